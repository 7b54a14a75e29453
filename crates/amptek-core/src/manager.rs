//! Multi-device manager.
//!
//! Keeps a registry of sessions keyed by [`DeviceHandle`] and fans
//! operations out to every device, or to those of one model. Quick
//! request/reply operations run one device after another. Acquisitions,
//! waits and HV ramps run on one scoped thread per device and report back
//! over a channel. Every broadcast yields one `Result` per device.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{AmptekError, Result};
use crate::events::{McaObserver, TracingObserver};
use crate::params::Configuration;
use crate::protocol::constants::DEFAULT_BAUD_RATE;
use crate::protocol::{DeviceModel, DeviceStatus};
use crate::ramp::HvTarget;
use crate::session::{AcquisitionPreset, AmptekMca, ApplyOptions, SessionConfig, Spectrum};
use crate::transport::{Discovery, SerialDiscovery, TransportId, UsbDiscovery};

/// Registry key. Assigned in discovery order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&format!("#{}", self.0))
    }
}

/// Per-device results of one broadcast.
pub type Outcomes<T> = BTreeMap<DeviceHandle, Result<T>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPortConfig {
    pub path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

/// Configuration for a [`MultiAmptekMca`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Applied to every session the manager creates.
    pub session: SessionConfig,
    /// Serial ports probed on discovery in addition to USB.
    pub serial_ports: Vec<SerialPortConfig>,
}

impl ManagerConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ManagerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// What is known about a registered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub transport: TransportId,
    pub model: Option<DeviceModel>,
    pub serial_number: Option<u32>,
}

struct Entry {
    session: AmptekMca,
}

impl Entry {
    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            transport: self.session.id().clone(),
            model: self.session.model(),
            serial_number: self.session.last_status().map(|s| s.serial_number),
        }
    }
}

/// Manager for several Amptek devices.
pub struct MultiAmptekMca {
    config: ManagerConfig,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn McaObserver>,
    devices: BTreeMap<DeviceHandle, Entry>,
    next_handle: u64,
}

impl MultiAmptekMca {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            observer: Arc::new(TracingObserver),
            devices: BTreeMap::new(),
            next_handle: 0,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn McaObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Register every USB device and every configured serial port.
    pub fn discover_default(&mut self) -> Vec<DeviceHandle> {
        let serial = SerialDiscovery::new(
            self.config
                .serial_ports
                .iter()
                .map(|p| (p.path.clone(), p.baud_rate)),
        );
        self.discover(&[&UsbDiscovery, &serial])
    }

    /// Register one session per device the given sources report.
    ///
    /// A source that fails to enumerate is logged and skipped. Devices
    /// already registered under the same transport id are not added twice.
    #[instrument(skip_all)]
    pub fn discover(&mut self, sources: &[&dyn Discovery]) -> Vec<DeviceHandle> {
        let mut added = Vec::new();
        for source in sources {
            let connectors = match source.enumerate() {
                Ok(connectors) => connectors,
                Err(e) => {
                    warn!(error = %e, "Device enumeration failed");
                    continue;
                }
            };
            for connector in connectors {
                if self.devices.values().any(|e| e.session.id() == connector.id()) {
                    debug!(device = %connector.id(), "Already registered");
                    continue;
                }
                let session = AmptekMca::new(connector)
                    .with_config(self.config.session.clone())
                    .with_clock(self.clock.clone())
                    .with_observer(self.observer.clone());
                let handle = DeviceHandle(self.next_handle);
                self.next_handle += 1;
                info!(handle = %handle, device = %session.id(), "Registered device");
                self.devices.insert(handle, Entry { session });
                added.push(handle);
            }
        }
        added
    }

    pub fn handles(&self) -> Vec<DeviceHandle> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get_device(&mut self, handle: DeviceHandle) -> Result<&mut AmptekMca> {
        self.devices
            .get_mut(&handle)
            .map(|e| &mut e.session)
            .ok_or_else(|| AmptekError::NotFound(format!("device {}", handle)))
    }

    pub fn identity(&self, handle: DeviceHandle) -> Result<DeviceIdentity> {
        self.devices
            .get(&handle)
            .map(Entry::identity)
            .ok_or_else(|| AmptekError::NotFound(format!("device {}", handle)))
    }

    /// Disconnect and unregister one device. Rediscovering it yields a new
    /// handle.
    pub fn remove(&mut self, handle: DeviceHandle) -> Result<()> {
        let mut entry = self
            .devices
            .remove(&handle)
            .ok_or_else(|| AmptekError::NotFound(format!("device {}", handle)))?;
        entry.session.disconnect()
    }

    /// Disconnect every device and empty the registry.
    pub fn disconnect_all(&mut self) -> Outcomes<()> {
        let outcomes = self.disconnect(None);
        self.devices.clear();
        outcomes
    }

    // ========================================================================
    // Sequential broadcasts
    // ========================================================================

    pub fn connect(&mut self, model: Option<DeviceModel>) -> Outcomes<DeviceModel> {
        // Model filtering needs a model; unconnected devices are always tried.
        self.each(model, true, "connect", AmptekMca::connect)
    }

    pub fn disconnect(&mut self, model: Option<DeviceModel>) -> Outcomes<()> {
        self.each(model, false, "disconnect", AmptekMca::disconnect)
    }

    pub fn get_status(&mut self, model: Option<DeviceModel>) -> Outcomes<DeviceStatus> {
        self.each(model, false, "get_status", AmptekMca::get_status)
    }

    pub fn get_model(&mut self, model: Option<DeviceModel>) -> Outcomes<DeviceModel> {
        self.each(model, false, "get_model", |s| s.model().ok_or(AmptekError::NotConnected))
    }

    pub fn send_configuration(
        &mut self,
        config: &Configuration,
        options: ApplyOptions,
        model: Option<DeviceModel>,
    ) -> Outcomes<()> {
        self.each(model, false, "send_configuration", |s| {
            s.send_configuration(config, options)
        })
    }

    /// Apply the preset `name` of each device's own model.
    ///
    /// Unlike [`AmptekMca::apply_default_configuration`], `model` here only
    /// selects which devices take part, so it trails like every other
    /// broadcast filter. The preset model always comes from the device.
    pub fn apply_default_configuration(
        &mut self,
        name: &str,
        options: ApplyOptions,
        model: Option<DeviceModel>,
    ) -> Outcomes<()> {
        self.each(model, false, "apply_default_configuration", |s| {
            let own = s.model().ok_or(AmptekError::NotConnected)?;
            s.apply_default_configuration(own, name, options)
        })
    }

    pub fn clear_spectrum(&mut self, model: Option<DeviceModel>) -> Outcomes<()> {
        self.each(model, false, "clear_spectrum", AmptekMca::clear_spectrum)
    }

    pub fn enable_mca(&mut self, model: Option<DeviceModel>) -> Outcomes<()> {
        self.each(model, false, "enable_mca", AmptekMca::enable_mca)
    }

    pub fn disable_mca(&mut self, model: Option<DeviceModel>) -> Outcomes<()> {
        self.each(model, false, "disable_mca", AmptekMca::disable_mca)
    }

    pub fn get_spectrum(&mut self, model: Option<DeviceModel>) -> Outcomes<Spectrum> {
        self.each(model, false, "get_spectrum", AmptekMca::get_spectrum)
    }

    // ========================================================================
    // Concurrent broadcasts
    // ========================================================================

    pub fn acquire_spectrum(
        &mut self,
        preset: AcquisitionPreset,
        model: Option<DeviceModel>,
    ) -> Outcomes<Spectrum> {
        self.concurrent(model, "acquire_spectrum", move |s| s.acquire_spectrum(preset))
    }

    /// Wait for every targeted MCA to close, using each session's live-time
    /// polling interval and grace period.
    pub fn wait_until_mca_closed(&mut self, model: Option<DeviceModel>) -> Outcomes<()> {
        self.concurrent(model, "wait_until_mca_closed", |s| {
            let poll = s.config().live_time_poll();
            let timeout = s.config().live_time_grace();
            s.wait_until_mca_closed(poll, timeout)
        })
    }

    pub fn set_hvse(
        &mut self,
        target: HvTarget,
        save_to_flash: bool,
        model: Option<DeviceModel>,
    ) -> Outcomes<f64> {
        self.concurrent(model, "set_hvse", move |s| s.set_hvse(target, save_to_flash))
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn targets(&mut self, model: Option<DeviceModel>, include_unknown: bool) -> Vec<(DeviceHandle, &mut AmptekMca)> {
        self.devices
            .iter_mut()
            .filter(|(_, e)| match (model, e.session.model()) {
                (None, _) => true,
                (Some(wanted), Some(actual)) => wanted == actual,
                (Some(_), None) => include_unknown,
            })
            .map(|(h, e)| (*h, &mut e.session))
            .collect()
    }

    fn each<T>(
        &mut self,
        model: Option<DeviceModel>,
        include_unknown: bool,
        operation: &str,
        mut f: impl FnMut(&mut AmptekMca) -> Result<T>,
    ) -> Outcomes<T> {
        let mut outcomes = BTreeMap::new();
        for (handle, session) in self.targets(model, include_unknown) {
            let result = f(session);
            if let Err(e) = &result {
                warn!(handle = %handle, operation, error = %e, "Device operation failed");
            }
            outcomes.insert(handle, result);
        }
        outcomes
    }

    fn concurrent<T, F>(&mut self, model: Option<DeviceModel>, operation: &str, f: F) -> Outcomes<T>
    where
        T: Send,
        F: Fn(&mut AmptekMca) -> Result<T> + Sync,
    {
        let targets = self.targets(model, false);
        let workers = targets.len();
        debug!(operation, workers, "Starting concurrent broadcast");

        let (tx, rx) = mpsc::channel();
        let panicked: Vec<(DeviceHandle, String)> = thread::scope(|scope| {
            let workers: Vec<_> = targets
                .into_iter()
                .map(|(handle, session)| {
                    let tx = tx.clone();
                    let f = &f;
                    let worker = scope.spawn(move || {
                        let result = f(session);
                        // The receiver outlives the scope
                        let _ = tx.send((handle, result));
                    });
                    (handle, worker)
                })
                .collect();
            // Joining here keeps one worker's panic from tearing down the scope.
            workers
                .into_iter()
                .filter_map(|(handle, worker)| {
                    worker.join().err().map(|payload| (handle, panic_message(payload.as_ref())))
                })
                .collect()
        });
        drop(tx);

        let mut outcomes = BTreeMap::new();
        for (handle, message) in panicked {
            error!(handle = %handle, operation, panic = %message, "Device worker panicked");
            outcomes.insert(handle, Err(AmptekError::WorkerPanicked(message)));
        }
        for (handle, result) in rx {
            if let Err(e) = &result {
                warn!(handle = %handle, operation, error = %e, "Device operation failed");
            }
            outcomes.insert(handle, result);
        }
        outcomes
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Drop for MultiAmptekMca {
    fn drop(&mut self) {
        for entry in self.devices.values_mut() {
            let _ = entry.session.disconnect();
        }
    }
}
