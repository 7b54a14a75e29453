//! nusb-based USB transport implementation.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{Bulk, In, Out};
use nusb::{MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{Connector, Discovery, Transport, TransportError, TransportId};
use crate::protocol::constants::{AMPTEK_PRODUCT_ID, AMPTEK_VENDOR_ID, EP_IN, EP_OUT};

const TRANSFER_SIZE: usize = 4096;

/// nusb-based USB transport.
pub struct NusbTransport {
    reader: Option<EndpointRead<Bulk>>,
    writer: Option<EndpointWrite<Bulk>>,
    id: TransportId,
}

impl NusbTransport {
    /// Open the device at a bus/address pair reported by discovery.
    #[instrument(level = "info")]
    pub fn open_at(bus: &str, address: u8) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.bus_id() == bus && d.device_address() == address)
            .ok_or_else(|| TransportError::DeviceNotFound(format!("usb:{}-{}", bus, address)))?;

        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        let id = usb_id(&device_info);
        info!(device = %id, "Found device");

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface =
            device
                .claim_interface(0)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: 0,
                    message: e.to_string(),
                })?;

        let in_ep = interface.endpoint::<Bulk, In>(EP_IN).map_err(|_| {
            TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "In".into(),
            }
        })?;
        let out_ep = interface.endpoint::<Bulk, Out>(EP_OUT).map_err(|_| {
            TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "Out".into(),
            }
        })?;

        info!(
            in_ep = %format!("0x{:02X}", EP_IN),
            out_ep = %format!("0x{:02X}", EP_OUT),
            "Device opened successfully"
        );

        Ok(Self {
            reader: Some(in_ep.reader(TRANSFER_SIZE)),
            writer: Some(out_ep.writer(TRANSFER_SIZE)),
            id,
        })
    }
}

fn usb_id(device_info: &nusb::DeviceInfo) -> TransportId {
    TransportId::Usb {
        vendor_id: device_info.vendor_id(),
        product_id: device_info.product_id(),
        bus: device_info.bus_id().to_string(),
        address: device_info.device_address(),
        serial: device_info.serial_number().map(str::to_string),
    }
}

impl Transport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::Disconnected)?;
        writer
            .write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(max_len, timeout_ms = timeout.as_millis() as u64))]
    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let reader = self.reader.as_mut().ok_or(TransportError::Disconnected)?;
        reader.set_read_timeout(timeout);

        let mut buf = vec![0u8; max_len];
        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::TimedOut => 0,
            Err(e) => return Err(TransportError::ReadFailed(e.to_string())),
        };

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.reader.take().is_some() | self.writer.take().is_some() {
            info!(device = %self.id, "Released USB interface");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.reader.is_some() && self.writer.is_some()
    }

    fn id(&self) -> &TransportId {
        &self.id
    }
}

/// Opens one enumerated USB device.
pub struct UsbConnector {
    id: TransportId,
}

impl Connector for UsbConnector {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn open(&self) -> Result<Box<dyn Transport>, TransportError> {
        match &self.id {
            TransportId::Usb { bus, address, .. } => {
                Ok(Box::new(NusbTransport::open_at(bus, *address)?))
            }
            other => Err(TransportError::OpenFailed(format!(
                "not a USB device: {}",
                other
            ))),
        }
    }
}

/// Lists every attached device with the Amptek VID/PID.
#[derive(Debug, Default, Clone, Copy)]
pub struct UsbDiscovery;

impl Discovery for UsbDiscovery {
    #[instrument(level = "info", skip(self))]
    fn enumerate(&self) -> Result<Vec<Box<dyn Connector>>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let mut found: Vec<Box<dyn Connector>> = Vec::new();
        for device_info in devices {
            if device_info.vendor_id() != AMPTEK_VENDOR_ID
                || device_info.product_id() != AMPTEK_PRODUCT_ID
            {
                continue;
            }
            let id = usb_id(&device_info);
            debug!(device = %id, "Discovered device");
            found.push(Box::new(UsbConnector { id }));
        }

        info!(count = found.len(), "USB enumeration complete");
        Ok(found)
    }
}
