//! Transport layer abstraction.
//!
//! Defines the byte-level [`Transport`] trait plus the [`Connector`] and
//! [`Discovery`] seams used to open and enumerate devices, so sessions run
//! unchanged over USB, a serial port or the in-memory mock.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a device lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportId {
    Usb {
        vendor_id: u16,
        product_id: u16,
        bus: String,
        address: u8,
        serial: Option<String>,
    },
    Serial {
        path: String,
        baud_rate: u32,
    },
    /// In-memory simulated device.
    Mock(String),
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportId::Usb {
                vendor_id,
                product_id,
                bus,
                address,
                serial,
            } => {
                write!(f, "usb:{}-{} {:04X}:{:04X}", bus, address, vendor_id, product_id)?;
                if let Some(serial) = serial {
                    write!(f, " sn={}", serial)?;
                }
                Ok(())
            }
            TransportId::Serial { path, baud_rate } => write!(f, "serial:{}@{}", path, baud_rate),
            TransportId::Mock(name) => write!(f, "mock:{}", name),
        }
    }
}

/// Byte-oriented duplex channel to one device.
///
/// A transport is exclusively owned by one session, hence `&mut self`.
pub trait Transport: Send {
    /// Write raw bytes to the device.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `max_len` bytes, waiting at most `timeout`.
    ///
    /// Returns an empty buffer when nothing arrived in time.
    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Release the underlying handle. Safe to call more than once.
    fn close(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    fn id(&self) -> &TransportId;
}

/// Opens a transport for one known device.
pub trait Connector: Send + Sync {
    fn id(&self) -> &TransportId;

    fn open(&self) -> Result<Box<dyn Transport>, TransportError>;
}

/// Enumerates attached devices.
pub trait Discovery {
    fn enumerate(&self) -> Result<Vec<Box<dyn Connector>>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_id_display() {
        let usb = TransportId::Usb {
            vendor_id: 0x10C4,
            product_id: 0x842A,
            bus: "1".into(),
            address: 7,
            serial: Some("12345".into()),
        };
        assert_eq!(usb.to_string(), "usb:1-7 10C4:842A sn=12345");

        let serial = TransportId::Serial {
            path: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
        };
        assert_eq!(serial.to_string(), "serial:/dev/ttyUSB0@115200");
    }
}
