//! Amptek-Core: control engine for Amptek DPP/MCA spectrometers.
//!
//! Talks the Amptek packet protocol to DP5, PX5, DP5G, MCA8000D, TB5 and
//! DP5X devices over USB or a serial line: configuration, high-voltage
//! ramping, spectrum acquisition and fleets of several devices at once.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, ACK codes, framing, status decoding
//! - **Transport**: Byte channel abstraction (nusb, serialport, mock)
//! - **Engine**: One request, one reply, bounded by a timeout
//! - **Params**: Parameter table and validation
//! - **Presets**: Bundled default configurations
//! - **Ramp**: Stepwise HV changes with fail-stop
//! - **Session**: One device
//! - **Manager**: Several devices, per-device results
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use amptek_core::{AcquisitionPreset, AmptekMca, ApplyOptions, DeviceModel, UsbDiscovery};
//! use amptek_core::transport::Discovery;
//!
//! # fn main() -> amptek_core::Result<()> {
//! let connector = UsbDiscovery.enumerate()?.remove(0);
//! let mut mca = AmptekMca::new(connector);
//! mca.connect()?;
//! mca.apply_default_configuration(DeviceModel::Dp5, "SDD Default DP5", ApplyOptions::default())?;
//! let spectrum = mca.acquire_spectrum(AcquisitionPreset::RealTime(Duration::from_secs(10)))?;
//! println!("{} counts", spectrum.total_counts());
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod engine;
pub mod error;
pub mod events;
pub mod manager;
pub mod params;
pub mod presets;
pub mod protocol;
pub mod ramp;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AmptekError, Result};
pub use events::{McaEvent, McaObserver, NullObserver, SessionState, TracingObserver};
pub use manager::{DeviceHandle, DeviceIdentity, ManagerConfig, MultiAmptekMca, Outcomes, SerialPortConfig};
pub use params::{ConfigValue, Configuration, ParamCode, ParamInfo, ValidationContext, ValueKind};
pub use presets::{Preset, PresetStore};
pub use protocol::{AckCode, DeviceModel, DeviceStatus};
pub use ramp::{HvRampController, HvTarget};
pub use session::{
    AcquisitionPreset, AmptekMca, ApplyOptions, BatchPolicy, SessionConfig, Spectrum,
};
pub use transport::{
    MockTransport, NusbTransport, SerialConnector, SerialTransport, TransportError, UsbDiscovery,
};
