//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod serial;
pub mod traits;

pub use mock::{MockConnector, MockDiscovery, MockTransport, SimulatedDevice};
pub use nusb::{NusbTransport, UsbConnector, UsbDiscovery};
pub use serial::{SerialConnector, SerialDiscovery, SerialTransport};
pub use traits::{Connector, Discovery, Transport, TransportError, TransportId};
