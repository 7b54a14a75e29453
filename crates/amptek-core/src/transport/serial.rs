//! Serial port transport (RS-232 interface of the DP5 family).

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info, instrument};

use super::traits::{Connector, Discovery, Transport, TransportError, TransportId};
use crate::protocol::constants::DEFAULT_TIMEOUT;

pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    id: TransportId,
}

impl SerialTransport {
    #[instrument(level = "info")]
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud_rate)
            .timeout(DEFAULT_TIMEOUT)
            .open()?;
        info!(path, baud_rate, "Serial port opened");

        Ok(Self {
            port: Some(port),
            id: TransportId::Serial {
                path: path.to_string(),
                baud_rate,
            },
        })
    }
}

impl Transport for SerialTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Disconnected)?;
        port.write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        port.flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(timeout_ms = timeout.as_millis() as u64))]
    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Disconnected)?;
        port.set_timeout(timeout)?;

        let mut buf = vec![0u8; max_len];
        let n = match port.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::TimedOut => 0,
            Err(e) => return Err(TransportError::ReadFailed(e.to_string())),
        };
        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            info!(device = %self.id, "Serial port closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn id(&self) -> &TransportId {
        &self.id
    }
}

/// Opens a configured serial port.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    id: TransportId,
}

impl SerialConnector {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            id: TransportId::Serial {
                path: path.into(),
                baud_rate,
            },
        }
    }
}

impl Connector for SerialConnector {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn open(&self) -> Result<Box<dyn Transport>, TransportError> {
        match &self.id {
            TransportId::Serial { path, baud_rate } => {
                Ok(Box::new(SerialTransport::open(path, *baud_rate)?))
            }
            other => Err(TransportError::OpenFailed(format!(
                "not a serial port: {}",
                other
            ))),
        }
    }
}

/// Serial ports cannot be identified by VID/PID, so discovery just yields
/// the ports it was configured with.
#[derive(Debug, Clone, Default)]
pub struct SerialDiscovery {
    ports: Vec<SerialConnector>,
}

impl SerialDiscovery {
    pub fn new<I, S>(ports: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self {
            ports: ports
                .into_iter()
                .map(|(path, baud)| SerialConnector::new(path, baud))
                .collect(),
        }
    }
}

impl Discovery for SerialDiscovery {
    fn enumerate(&self) -> Result<Vec<Box<dyn Connector>>, TransportError> {
        Ok(self
            .ports
            .iter()
            .cloned()
            .map(|c| Box::new(c) as Box<dyn Connector>)
            .collect())
    }
}
