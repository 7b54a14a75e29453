//! Device session: one DPP behind one transport.
//!
//! [`AmptekMca`] owns its transport while connected and runs at most one
//! transaction at a time; every operation takes `&mut self`. Configuration
//! is validated against the parameter table before anything is written, and
//! high voltage only ever moves through the ramp controller.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::engine::{TransactionEngine, deadline_after};
use crate::error::{AmptekError, Result};
use crate::events::{McaEvent, McaObserver, SessionState, TracingObserver};
use crate::params::{ConfigValue, Configuration, ParamCode, ValidationContext, split_assignments, validate};
use crate::presets::PresetStore;
use crate::protocol::command::spectrum_channels;
use crate::protocol::constants::*;
use crate::protocol::{Command, DeviceModel, DeviceStatus, Frame};
use crate::ramp::{HvChannel, HvRampController, HvTarget, RampSettings, format_volts};
use crate::transport::{Connector, Transport, TransportError, TransportId};

/// What to do when one entry of a configuration batch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    /// Pack entries into as few packets as possible and stop at the first
    /// rejected packet.
    #[default]
    AbortOnFirstError,
    /// Send every entry on its own and report all failures at the end.
    BestEffort,
}

/// Configuration for a device session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Reply timeout for short requests.
    pub command_timeout_ms: u64,
    /// Reply timeout for spectrum reads and configuration writes.
    pub long_timeout_ms: u64,
    /// HV ramp step, capped at the vendor maximum of 50 V.
    pub hv_step_volts: f64,
    /// Settling delay between HV ramp steps.
    pub hv_step_delay_ms: u64,
    /// Read the HV setpoint back after each ramp step.
    pub verify_hv_steps: bool,
    pub batch_policy: BatchPolicy,
    /// Status polling interval while waiting for a live-time preset.
    pub live_time_poll_ms: u64,
    /// How long past the nominal duration a live-time acquisition may run.
    pub live_time_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            long_timeout_ms: LONG_TIMEOUT.as_millis() as u64,
            hv_step_volts: HV_MAX_STEP_VOLTS,
            hv_step_delay_ms: HV_SETTLE_DELAY.as_millis() as u64,
            verify_hv_steps: true,
            batch_policy: BatchPolicy::default(),
            live_time_poll_ms: 1000,
            live_time_grace_ms: 30_000,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn long_timeout(&self) -> Duration {
        Duration::from_millis(self.long_timeout_ms)
    }

    pub fn live_time_poll(&self) -> Duration {
        Duration::from_millis(self.live_time_poll_ms.max(1))
    }

    pub fn live_time_grace(&self) -> Duration {
        Duration::from_millis(self.live_time_grace_ms)
    }

    pub fn ramp_settings(&self) -> RampSettings {
        RampSettings {
            max_step: self.hv_step_volts.min(HV_MAX_STEP_VOLTS),
            settle: Duration::from_millis(self.hv_step_delay_ms),
            verify: self.verify_hv_steps,
        }
    }
}

/// Options for writing a configuration batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Persist the batch in the device's flash.
    pub save_to_flash: bool,
    /// Leave the HV setpoint alone even if the batch contains one.
    pub skip_hvse: bool,
    /// Overrides the session's [`BatchPolicy`].
    pub policy: Option<BatchPolicy>,
}

impl ApplyOptions {
    pub fn saving() -> Self {
        Self {
            save_to_flash: true,
            ..Default::default()
        }
    }
}

/// Stop condition for [`AmptekMca::acquire_spectrum`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionPreset {
    RealTime(Duration),
    LiveTime(Duration),
}

impl AcquisitionPreset {
    pub fn duration(&self) -> Duration {
        match self {
            AcquisitionPreset::RealTime(d) | AcquisitionPreset::LiveTime(d) => *d,
        }
    }
}

/// Channel counts of one spectrum read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Spectrum {
    pub counts: Vec<u32>,
}

impl Spectrum {
    /// Decode `channels` 24-bit little-endian counts.
    pub fn from_payload(channels: usize, payload: &[u8]) -> Result<Self> {
        let expected = channels * BYTES_PER_CHANNEL;
        if payload.len() != expected {
            return Err(AmptekError::Protocol(format!(
                "spectrum of {} channels carries {} bytes, expected {}",
                channels,
                payload.len(),
                expected
            )));
        }
        let counts = payload
            .chunks_exact(BYTES_PER_CHANNEL)
            .map(LittleEndian::read_u24)
            .collect();
        Ok(Self { counts })
    }

    pub fn channels(&self) -> usize {
        self.counts.len()
    }

    pub fn total_counts(&self) -> u64 {
        self.counts.iter().map(|&c| u64::from(c)).sum()
    }
}

/// Session with one Amptek DPP.
pub struct AmptekMca {
    connector: Box<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    engine: TransactionEngine,
    state: SessionState,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn McaObserver>,
    model: Option<DeviceModel>,
    last_status: Option<DeviceStatus>,
    ramp: HvRampController,
}

impl AmptekMca {
    /// Create a disconnected session with default configuration.
    pub fn new(connector: Box<dyn Connector>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let config = SessionConfig::default();
        Self {
            connector,
            transport: None,
            engine: TransactionEngine::new(clock.clone()),
            state: SessionState::Disconnected,
            ramp: HvRampController::new(config.ramp_settings()),
            config,
            clock,
            observer: Arc::new(TracingObserver),
            model: None,
            last_status: None,
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.ramp = HvRampController::new(config.ramp_settings());
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.engine = TransactionEngine::new(clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn McaObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn id(&self) -> &TransportId {
        self.connector.id()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Model reported by the last handshake.
    pub fn model(&self) -> Option<DeviceModel> {
        self.model
    }

    pub fn last_status(&self) -> Option<&DeviceStatus> {
        self.last_status.as_ref()
    }

    /// Last HV voltage confirmed by a ramp.
    pub fn last_hv(&self) -> Option<f64> {
        self.ramp.last_voltage()
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// Open the transport and identify the device. Does nothing when
    /// already connected.
    #[instrument(skip(self), fields(device = %self.connector.id()))]
    pub fn connect(&mut self) -> Result<DeviceModel> {
        if self.transport.is_some()
            && let Some(model) = self.model
        {
            debug!("Already connected");
            return Ok(model);
        }

        let target = self.connector.id().to_string();
        let transport = self.connector.open().map_err(|e| AmptekError::Connection {
            target: target.clone(),
            reason: e.to_string(),
        })?;
        self.transport = Some(transport);
        self.engine.reset();

        let status = match self.request_status() {
            Ok(status) => status,
            Err(e) => {
                self.drop_transport();
                return Err(match e {
                    AmptekError::Timeout { .. } => AmptekError::Connection {
                        target,
                        reason: format!("status handshake failed: {}", e),
                    },
                    other => other,
                });
            }
        };

        let model = status.model;
        info!(model = %model, serial = status.serial_number, firmware = %status.firmware_version, "Connected");
        self.observer.on_event(&McaEvent::Connected {
            device: target,
            model,
            serial_number: status.serial_number,
        });
        self.model = Some(model);
        self.sync_state(&status);
        self.last_status = Some(status);
        Ok(model)
    }

    /// Close the transport. Safe to call repeatedly.
    #[instrument(skip(self), fields(device = %self.connector.id()))]
    pub fn disconnect(&mut self) -> Result<()> {
        let closed = match self.transport.take() {
            Some(mut transport) => {
                let result = transport.close();
                self.observer.on_event(&McaEvent::Disconnected {
                    device: self.connector.id().to_string(),
                });
                info!("Disconnected");
                result
            }
            None => Ok(()),
        };
        self.engine.reset();
        self.ramp.forget();
        self.set_state(SessionState::Disconnected);
        closed.map_err(AmptekError::from)
    }

    // ========================================================================
    // Status and readback
    // ========================================================================

    #[instrument(skip(self))]
    pub fn get_status(&mut self) -> Result<DeviceStatus> {
        let status = self.request_status()?;
        self.model = Some(status.model);
        self.sync_state(&status);
        self.last_status = Some(status.clone());
        Ok(status)
    }

    /// Read back the current values of `codes`, in device order.
    #[instrument(skip(self))]
    pub fn read_configuration(&mut self, codes: &[&str]) -> Result<Vec<(String, String)>> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        let mut request = String::new();
        for code in codes {
            let code = ParamCode::parse(code)?;
            request.push_str(code.as_str());
            request.push(';');
        }
        let timeout = self.config.command_timeout();
        let reply = self.transact(Command::TextConfigReadback, request.as_bytes(), timeout)?;
        let text = String::from_utf8_lossy(&reply.payload);
        Ok(split_assignments(&text)
            .map(|(k, v)| (k.to_ascii_uppercase(), v.to_string()))
            .collect())
    }

    /// Send `text` and expect it back unchanged.
    pub fn echo_test(&mut self, text: &str) -> Result<String> {
        let timeout = self.config.command_timeout();
        let reply = self.transact(Command::EchoTest, text.as_bytes(), timeout)?;
        if reply.payload != text.as_bytes() {
            return Err(AmptekError::Protocol(format!(
                "echo returned {} bytes that differ from the {} sent",
                reply.payload.len(),
                text.len()
            )));
        }
        Ok(text.to_string())
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Write a single parameter.
    pub fn set_parameter(
        &mut self,
        code: &str,
        value: impl Into<ConfigValue>,
        save_to_flash: bool,
    ) -> Result<()> {
        let config = Configuration::new().with(code, value)?;
        self.send_configuration(
            &config,
            ApplyOptions {
                save_to_flash,
                ..Default::default()
            },
        )
    }

    /// Validate and write a batch of parameters.
    ///
    /// Nothing is written if any entry fails validation. A reset (`RESC=Y`)
    /// in the batch goes out ahead of everything else. `HVSE` is held back and ramped once the rest
    /// of the batch is in place.
    #[instrument(skip(self, config), fields(params = config.len()))]
    pub fn send_configuration(&mut self, config: &Configuration, options: ApplyOptions) -> Result<()> {
        self.ensure_connected()?;
        let ctx = self.validation_context(Some(config));

        let mut commands = Vec::new();
        let mut hv_target = None;
        for (code, value) in config.iter() {
            let text = validate(*code, value, &ctx)?;
            if code.is("HVSE") {
                hv_target = Some(text.parse::<HvTarget>()?);
                continue;
            }
            let command = format!("{}={};", code, text);
            let reset = code.is("RESC") && matches!(text.as_str(), "Y" | "YES");
            if reset {
                commands.insert(0, (code.to_string(), command));
            } else {
                commands.push((code.to_string(), command));
            }
        }

        let policy = options.policy.unwrap_or(self.config.batch_policy);
        let hv_target = hv_target.filter(|_| !options.skip_hvse);
        info!(commands = commands.len(), hvse = ?hv_target, ?policy, save = options.save_to_flash, "Sending configuration");

        match policy {
            BatchPolicy::AbortOnFirstError => {
                let texts: Vec<_> = commands.into_iter().map(|(_, c)| c).collect();
                let packets = pack_commands(&texts);
                let total = packets.len();
                for (i, packet) in packets.iter().enumerate() {
                    let save = options.save_to_flash && i + 1 == total;
                    debug!(packet = i + 1, total, len = packet.len(), save, "Configuration packet");
                    self.write_config(packet, save, options.save_to_flash)?;
                }
                if let Some(target) = hv_target {
                    self.set_hvse(target, options.save_to_flash)?;
                }
                Ok(())
            }
            BatchPolicy::BestEffort => {
                let mut failures = Vec::new();
                let total = commands.len();
                for (i, (code, command)) in commands.into_iter().enumerate() {
                    let save = options.save_to_flash && i + 1 == total && hv_target.is_none();
                    if let Err(e) = self.write_config(&command, save, options.save_to_flash) {
                        warn!(code = %code, error = %e, "Parameter not applied");
                        if matches!(e, AmptekError::Transport(_) | AmptekError::NotConnected) {
                            return Err(e);
                        }
                        failures.push((code, e));
                    }
                }
                if let Some(target) = hv_target
                    && let Err(e) = self.set_hvse(target, options.save_to_flash)
                {
                    warn!(error = %e, "HV setpoint not applied");
                    failures.push(("HVSE".to_string(), e));
                }
                if failures.is_empty() {
                    Ok(())
                } else {
                    Err(AmptekError::PartiallyApplied { failures })
                }
            }
        }
    }

    /// Names of the bundled presets for every model.
    pub fn get_available_default_configurations(&self) -> BTreeMap<DeviceModel, Vec<&'static str>> {
        PresetStore::bundled().all_names()
    }

    /// Names of the bundled presets for the connected model.
    pub fn default_configurations_for_model(&self) -> Vec<&'static str> {
        self.model
            .map(|m| PresetStore::bundled().names(m))
            .unwrap_or_default()
    }

    /// Apply a bundled preset, ramping its HV setpoint last.
    #[instrument(skip(self, options))]
    pub fn apply_default_configuration(
        &mut self,
        model: DeviceModel,
        name: &str,
        options: ApplyOptions,
    ) -> Result<()> {
        let preset = PresetStore::bundled().get(model, name)?;
        self.ensure_connected()?;
        if let Some(connected) = self.model
            && connected != model
        {
            return Err(AmptekError::invalid(
                "preset",
                format!("'{}' is for {} but the device is a {}", name, model, connected),
            ));
        }
        info!(preset = name, "Applying default configuration");
        self.send_configuration(&preset.config, options)
    }

    // ========================================================================
    // High voltage
    // ========================================================================

    /// Ramp the HV supply to `target`. `Off` ramps to 0 V and then switches
    /// the supply off. With `save_to_flash` the final setpoint is persisted.
    #[instrument(skip(self), fields(target = %target))]
    pub fn set_hvse(&mut self, target: HvTarget, save_to_flash: bool) -> Result<f64> {
        self.ensure_connected()?;
        let code = ParamCode::parse("HVSE")?;
        validate(code, &ConfigValue::Text(target.to_text()), &self.validation_context(None))?;

        let clock = self.clock.clone();
        let observer = self.observer.clone();
        let mut ramp = std::mem::take(&mut self.ramp);
        let result = ramp.ramp_to(
            &mut SessionHv { session: self },
            clock.as_ref(),
            observer.as_ref(),
            target.ramp_volts(),
        );
        self.ramp = ramp;
        let reached = result?;

        match target {
            HvTarget::Off => {
                self.write_config("HVSE=OFF;", save_to_flash, save_to_flash)?;
                info!("HV supply off");
            }
            HvTarget::Volts(_) if save_to_flash => {
                let persist = format!("HVSE={};", format_volts(reached));
                self.write_config(&persist, true, true)?;
                info!(volts = reached, "HV setpoint saved");
            }
            HvTarget::Volts(_) => {}
        }
        Ok(reached)
    }

    fn read_hv(&mut self) -> Result<Option<f64>> {
        let values = self.read_configuration(&["HVSE"])?;
        Ok(values
            .into_iter()
            .find(|(code, _)| code == "HVSE")
            .and_then(|(_, value)| {
                if value.eq_ignore_ascii_case("OFF") {
                    Some(0.0)
                } else {
                    value.parse().ok()
                }
            }))
    }

    // ========================================================================
    // Acquisition
    // ========================================================================

    pub fn enable_mca(&mut self) -> Result<()> {
        let timeout = self.config.command_timeout();
        self.transact(Command::EnableMca, &[], timeout)?;
        self.set_state(SessionState::Acquiring);
        Ok(())
    }

    pub fn disable_mca(&mut self) -> Result<()> {
        let timeout = self.config.command_timeout();
        self.transact(Command::DisableMca, &[], timeout)?;
        self.set_state(SessionState::Idle);
        Ok(())
    }

    pub fn clear_spectrum(&mut self) -> Result<()> {
        let timeout = self.config.command_timeout();
        self.transact(Command::ClearSpectrum, &[], timeout)?;
        Ok(())
    }

    pub fn autoset_input_offset(&mut self) -> Result<()> {
        let timeout = self.config.long_timeout();
        self.transact(Command::AutosetInputOffset, &[], timeout)?;
        Ok(())
    }

    pub fn autoset_fast_threshold(&mut self) -> Result<()> {
        let timeout = self.config.long_timeout();
        self.transact(Command::AutosetFastThreshold, &[], timeout)?;
        Ok(())
    }

    /// Read the spectrum without touching acquisition state.
    #[instrument(skip(self))]
    pub fn get_spectrum(&mut self) -> Result<Spectrum> {
        let timeout = self.config.long_timeout();
        let reply = self.transact(Command::Spectrum, &[], timeout)?;
        let channels = spectrum_channels(reply.pid)
            .ok_or_else(|| AmptekError::Protocol(format!("{} is not a spectrum reply", reply.pid)))?;
        let spectrum = Spectrum::from_payload(channels, &reply.payload)?;
        debug!(channels, total = spectrum.total_counts(), "Spectrum read");
        Ok(spectrum)
    }

    /// Program `preset`, clear, acquire for its duration and read the result.
    #[instrument(skip(self))]
    pub fn acquire_spectrum(&mut self, preset: AcquisitionPreset) -> Result<Spectrum> {
        self.ensure_connected()?;
        let duration = preset.duration();
        if duration.is_zero() {
            return Err(AmptekError::invalid("preset", "acquisition time must be non-zero"));
        }
        let code = match preset {
            AcquisitionPreset::RealTime(_) => "PRER",
            AcquisitionPreset::LiveTime(_) if self.model == Some(DeviceModel::Mca8000d) => "PREL",
            AcquisitionPreset::LiveTime(_) => "PRET",
        };
        let seconds = (duration.as_secs_f64() * 100.0).round() / 100.0;
        self.set_parameter(code, seconds, false)?;

        self.clear_spectrum()?;
        self.enable_mca()?;
        info!(preset = code, seconds, "Acquisition started");
        self.clock.sleep(duration);

        if let AcquisitionPreset::LiveTime(_) = preset {
            let (poll, grace) = (self.config.live_time_poll(), self.config.live_time_grace());
            match self.wait_until_mca_closed(poll, grace) {
                Ok(()) => {}
                Err(AmptekError::Timeout { .. }) => {
                    warn!(grace_ms = grace.as_millis() as u64, "Live-time preset not reached, stopping acquisition");
                }
                Err(e) => return Err(e),
            }
        }

        self.disable_mca()?;
        self.get_spectrum()
    }

    /// Block until the device closes the MCA on its own.
    ///
    /// Returns at once if the MCA is already closed, or if no preset
    /// (`PRET`, `PRER`, `PREC`, plus `PREL` on the MCA8000D) would ever close
    /// it. Otherwise polls status every `poll` for up to `timeout`.
    #[instrument(skip(self))]
    pub fn wait_until_mca_closed(&mut self, poll: Duration, timeout: Duration) -> Result<()> {
        if poll.is_zero() {
            return Err(AmptekError::invalid("poll interval", "must be non-zero"));
        }
        if !self.get_status()?.flags.mca_enabled {
            debug!("MCA already closed");
            return Ok(());
        }

        let mut codes = vec!["PRET", "PRER", "PREC"];
        if self.model == Some(DeviceModel::Mca8000d) {
            codes.push("PREL");
        }
        let presets = self.read_configuration(&codes)?;
        if !presets.iter().any(|(_, value)| preset_active(value)) {
            warn!("MCA is enabled without an active preset, not waiting");
            return Ok(());
        }

        let deadline = deadline_after(self.clock.as_ref(), timeout);
        loop {
            let remaining = match deadline {
                Some(deadline) => self.clock.remaining(deadline),
                None => poll,
            };
            if remaining.is_zero() {
                return Err(AmptekError::Timeout {
                    command: "wait-until-mca-closed",
                    waited: timeout,
                });
            }
            self.clock.sleep(poll.min(remaining));
            if !self.get_status()?.flags.mca_enabled {
                info!("MCA closed");
                return Ok(());
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn ensure_connected(&self) -> Result<()> {
        if self.transport.is_some() && self.state.is_connected() {
            Ok(())
        } else {
            Err(AmptekError::NotConnected)
        }
    }

    fn transact(&mut self, command: Command, payload: &[u8], timeout: Duration) -> Result<Frame> {
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or(AmptekError::NotConnected)?;
        let result = self
            .engine
            .execute(transport, command, payload, timeout, self.observer.as_ref());
        if let Err(AmptekError::Transport(TransportError::Disconnected)) = &result {
            warn!(device = %self.connector.id(), "Device went away");
            self.drop_transport();
        }
        result
    }

    fn request_status(&mut self) -> Result<DeviceStatus> {
        let timeout = self.config.command_timeout();
        let reply = self.transact(Command::Status, &[], timeout)?;
        if reply.pid == RESP_MINIX_STATUS {
            return Err(AmptekError::Protocol(
                "Mini-X controllers are not supported".to_string(),
            ));
        }
        Ok(DeviceStatus::from_bytes(&reply.payload)?)
    }

    fn write_config(&mut self, payload: &str, save: bool, settle: bool) -> Result<()> {
        let timeout = self.config.long_timeout();
        self.transact(Command::TextConfig { save }, payload.as_bytes(), timeout)?;
        if settle {
            self.clock.sleep(FLASH_WRITE_DELAY);
        }
        Ok(())
    }

    fn validation_context(&self, config: Option<&Configuration>) -> ValidationContext {
        let mut ctx = match &self.last_status {
            Some(status) => ValidationContext::for_status(status),
            None => ValidationContext {
                model: self.model,
                ..Default::default()
            },
        };
        ctx.channels = config
            .and_then(|c| c.get("MCAC"))
            .and_then(|v| v.to_text().parse::<f64>().ok())
            .map(|v| v as usize);
        ctx
    }

    fn sync_state(&mut self, status: &DeviceStatus) {
        let state = if status.flags.mca_enabled {
            SessionState::Acquiring
        } else {
            SessionState::Idle
        };
        self.set_state(state);
    }

    fn set_state(&mut self, to: SessionState) {
        if self.state != to {
            debug!(from = %self.state, to = %to, "State change");
            self.observer.on_event(&McaEvent::StateChanged {
                from: self.state,
                to,
            });
            self.state = to;
        }
    }

    fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.close();
            self.observer.on_event(&McaEvent::Disconnected {
                device: self.connector.id().to_string(),
            });
        }
        self.engine.reset();
        self.ramp.forget();
        self.set_state(SessionState::Disconnected);
    }
}

impl Drop for AmptekMca {
    fn drop(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.close();
        }
    }
}

/// HV access for the ramp controller while it is detached from the session.
struct SessionHv<'a> {
    session: &'a mut AmptekMca,
}

impl HvChannel for SessionHv<'_> {
    fn command_hv(&mut self, volts: f64) -> Result<()> {
        let command = format!("HVSE={};", format_volts(volts));
        self.session.write_config(&command, false, false)
    }

    fn read_hv(&mut self) -> Result<Option<f64>> {
        self.session.read_hv()
    }
}

/// Greedily pack `CODE=VALUE;` commands into packets of at most
/// [`MAX_REQUEST_DATA`] bytes, keeping their order.
fn pack_commands(commands: &[String]) -> Vec<String> {
    let mut packets = Vec::new();
    let mut current = String::new();
    for command in commands {
        if !current.is_empty() && current.len() + command.len() > MAX_REQUEST_DATA {
            packets.push(std::mem::take(&mut current));
        }
        current.push_str(command);
    }
    if !current.is_empty() {
        packets.push(current);
    }
    packets
}

fn preset_active(value: &str) -> bool {
    if value.eq_ignore_ascii_case("OFF") {
        return false;
    }
    value.parse::<f64>().map(|v| v != 0.0).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::NullObserver;
    use crate::protocol::Pid;
    use crate::transport::MockTransport;

    fn session(model: DeviceModel) -> (MockTransport, Arc<ManualClock>, AmptekMca) {
        let clock = Arc::new(ManualClock::new());
        let mock = MockTransport::simulated(model).with_clock(clock.clone());
        let session = AmptekMca::new(Box::new(mock.connector()))
            .with_clock(clock.clone())
            .with_observer(Arc::new(NullObserver));
        (mock, clock, session)
    }

    fn connected(model: DeviceModel) -> (MockTransport, Arc<ManualClock>, AmptekMca) {
        let (mock, clock, mut mca) = session(model);
        mca.connect().unwrap();
        mock.clear_writes();
        (mock, clock, mca)
    }

    #[test]
    fn test_connect_identifies_model_once() {
        let (mock, _clock, mut mca) = session(DeviceModel::Px5);
        assert_eq!(mca.state(), SessionState::Disconnected);

        assert_eq!(mca.connect().unwrap(), DeviceModel::Px5);
        assert_eq!(mca.connect().unwrap(), DeviceModel::Px5);
        assert_eq!(mca.state(), SessionState::Idle);
        assert_eq!(mock.written_frames().len(), 1);
        assert_eq!(mca.last_status().unwrap().serial_number, 40_001);
    }

    #[test]
    fn test_connect_failures() {
        let (mock, _clock, mut mca) = session(DeviceModel::Dp5);
        mock.set_open_fails(true);
        assert!(matches!(mca.connect(), Err(AmptekError::Connection { .. })));

        mock.set_open_fails(false);
        mock.with_device(|d| d.silent = true);
        assert!(matches!(mca.connect(), Err(AmptekError::Connection { .. })));
        assert_eq!(mca.state(), SessionState::Disconnected);
        assert!(!mock.is_connected());
    }

    #[test]
    fn test_operations_need_connection() {
        let (_mock, _clock, mut mca) = session(DeviceModel::Dp5);
        assert!(matches!(mca.enable_mca(), Err(AmptekError::NotConnected)));
        assert!(matches!(mca.get_spectrum(), Err(AmptekError::NotConnected)));
        assert!(matches!(
            mca.set_parameter("MCAC", 1024, false),
            Err(AmptekError::NotConnected)
        ));
        mca.disconnect().unwrap();
        mca.disconnect().unwrap();
    }

    #[test]
    fn test_unplug_marks_session_disconnected() {
        let (mock, _clock, mut mca) = connected(DeviceModel::Dp5);
        mock.disconnect();
        assert!(matches!(mca.get_status(), Err(AmptekError::Transport(_))));
        assert_eq!(mca.state(), SessionState::Disconnected);

        assert!(matches!(mca.connect(), Err(AmptekError::Connection { .. })));
        mock.reconnect();
        assert_eq!(mca.connect().unwrap(), DeviceModel::Dp5);
    }

    #[test]
    fn test_end_to_end_acquisition() {
        let (mock, clock, mut mca) = connected(DeviceModel::Dp5);

        mca.set_parameter("MCAC", 2048, false).unwrap();
        mca.clear_spectrum().unwrap();
        mca.enable_mca().unwrap();
        assert_eq!(mca.state(), SessionState::Acquiring);
        clock.sleep(Duration::from_secs(10));
        mca.disable_mca().unwrap();
        assert_eq!(mca.state(), SessionState::Idle);

        let spectrum = mca.get_spectrum().unwrap();
        assert_eq!(spectrum.channels(), 2048);
        assert!(spectrum.total_counts() > 0);
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
        assert_eq!(mock.config_writes(), ["MCAC=2048;"]);
    }

    #[test]
    fn test_invalid_parameter_sends_nothing() {
        let (mock, _clock, mut mca) = connected(DeviceModel::Dp5);
        let config = Configuration::new()
            .with("MCAC", 1024)
            .unwrap()
            .with("GAIN", 900.0)
            .unwrap();
        let err = mca.send_configuration(&config, ApplyOptions::default()).unwrap_err();
        assert!(matches!(err, AmptekError::InvalidParameter { .. }));
        assert!(mock.written_frames().is_empty());

        let err = mca.set_parameter("VOLU", "ON", false).unwrap_err();
        assert!(err.to_string().contains("not supported by DP5"));
    }

    #[test]
    fn test_reset_goes_first_and_packets_fit() {
        let (mock, clock, mut mca) = connected(DeviceModel::Dp5);
        let token = "X".repeat(32);
        let mut config = Configuration::new();
        for code in [
            "AUO1", "AUO2", "DACF", "GPIN", "INOF", "PAPZ", "RESL", "RTDD", "RTDS", "RTDT",
            "RTDW", "SCOG", "SCOT", "SOFF", "SYNC", "TFLA", "TLLD", "CLKL",
        ] {
            config.set(ParamCode::parse(code).unwrap(), token.as_str());
        }
        config.set(ParamCode::parse("RESC").unwrap(), "y");

        mca.send_configuration(&config, ApplyOptions::saving()).unwrap();

        let frames = mock.written_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].pid, REQ_TEXT_CONFIG_NO_SAVE);
        assert_eq!(frames[1].pid, REQ_TEXT_CONFIG);
        assert!(frames.iter().all(|f| f.payload.len() <= MAX_REQUEST_DATA));
        assert!(frames[0].payload.starts_with(b"RESC=Y;AUO1="));
        assert_eq!(clock.elapsed(), FLASH_WRITE_DELAY * 2);
        assert_eq!(mock.with_device(|d| d.flash_saves), Some(1));
    }

    #[test]
    fn test_device_rejection_carries_echo() {
        let (mock, _clock, mut mca) = connected(DeviceModel::Dp5);
        mock.with_device(|d| d.rejected.insert("GAIN".into()));
        let err = mca.set_parameter("GAIN", 20, false).unwrap_err();
        match err {
            AmptekError::Device { code, detail } => {
                assert_eq!(code.value(), ACK_BAD_PARAMETER);
                assert_eq!(detail.as_deref(), Some("GAIN=20"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_best_effort_reports_each_failure() {
        let (mock, _clock, mut mca) = connected(DeviceModel::Dp5);
        mock.with_device(|d| d.rejected.insert("GAIN".into()));
        let config = Configuration::new()
            .with("GAIN", 20)
            .unwrap()
            .with("MCAC", 512)
            .unwrap();
        let options = ApplyOptions {
            policy: Some(BatchPolicy::BestEffort),
            ..Default::default()
        };

        match mca.send_configuration(&config, options).unwrap_err() {
            AmptekError::PartiallyApplied { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "GAIN");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(mock.param("MCAC").as_deref(), Some("512"));
        assert_eq!(mock.config_writes(), ["GAIN=20;", "MCAC=512;"]);
    }

    #[test]
    fn test_hvse_in_batch_is_ramped_last() {
        let (mock, clock, mut mca) = connected(DeviceModel::Dp5);
        let config = Configuration::new()
            .with("HVSE", 120)
            .unwrap()
            .with("MCAC", 4096)
            .unwrap();
        mca.send_configuration(&config, ApplyOptions::default()).unwrap();

        assert_eq!(
            mock.config_writes(),
            ["MCAC=4096;", "HVSE=50;", "HVSE=100;", "HVSE=120;"]
        );
        assert_eq!(mock.param("HVSE").as_deref(), Some("120"));
        assert_eq!(clock.elapsed(), HV_SETTLE_DELAY * 2);
        assert_eq!(mca.last_hv(), Some(120.0));
    }

    #[test]
    fn test_skip_hvse_leaves_supply_alone() {
        let (mock, _clock, mut mca) = connected(DeviceModel::Dp5);
        let config = Configuration::new().with("HVSE", 120).unwrap();
        let options = ApplyOptions {
            skip_hvse: true,
            ..Default::default()
        };
        mca.send_configuration(&config, options).unwrap();
        assert!(mock.config_writes().is_empty());
    }

    #[test]
    fn test_hv_off_ramps_down_first() {
        let (mock, _clock, mut mca) = connected(DeviceModel::Dp5);
        mca.set_hvse(HvTarget::Volts(100.0), false).unwrap();
        mock.clear_writes();

        mca.set_hvse(HvTarget::Off, false).unwrap();
        assert_eq!(mock.config_writes(), ["HVSE=50;", "HVSE=0;", "HVSE=OFF;"]);
        assert_eq!(mock.param("HVSE").as_deref(), Some("OFF"));
    }

    #[test]
    fn test_hv_save_persists_after_ramp() {
        let (mock, _clock, mut mca) = connected(DeviceModel::Px5);
        mca.set_hvse(HvTarget::Volts(80.0), true).unwrap();
        let frames = mock.written_frames();
        let last = frames.last().unwrap();
        assert_eq!(last.pid, REQ_TEXT_CONFIG);
        assert_eq!(last.payload, b"HVSE=80;");
        assert_eq!(mock.with_device(|d| d.flash_saves), Some(1));
    }

    #[test]
    fn test_hv_polarity_and_model_checks() {
        let (mock, _clock, mut mca) = session(DeviceModel::Dp5);
        mock.with_device(|d| d.hv_polarity_positive = false);
        mca.connect().unwrap();
        assert!(matches!(
            mca.set_hvse(HvTarget::Volts(100.0), false),
            Err(AmptekError::InvalidParameter { .. })
        ));
        mca.set_hvse(HvTarget::Volts(-60.0), false).unwrap();

        let (_mock, _clock, mut mca) = connected(DeviceModel::Mca8000d);
        assert!(matches!(
            mca.set_hvse(HvTarget::Off, false),
            Err(AmptekError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_ramp_failure_stops_at_last_good_step() {
        let (mock, _clock, mut mca) = connected(DeviceModel::Dp5);
        mock.with_device(|d| d.fail_config_after = Some(2));

        let err = mca.set_hvse(HvTarget::Volts(200.0), false).unwrap_err();
        match &err {
            AmptekError::RampAborted { last_voltage, .. } => assert_eq!(*last_voltage, 100.0),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(err.root(), AmptekError::Device { .. }));
        assert_eq!(mock.param("HVSE").as_deref(), Some("100"));
    }

    #[test]
    fn test_acquire_real_time() {
        let (mock, clock, mut mca) = connected(DeviceModel::Dp5);
        let spectrum = mca
            .acquire_spectrum(AcquisitionPreset::RealTime(Duration::from_secs(5)))
            .unwrap();

        assert_eq!(spectrum.channels(), 1024);
        assert_eq!(mock.param("PRER").as_deref(), Some("5"));
        assert_eq!(mca.state(), SessionState::Idle);
        assert_eq!(mock.with_device(|d| d.mca_enabled), Some(false));
        assert_eq!(clock.elapsed(), Duration::from_secs(5));

        let pids: Vec<Pid> = mock.written_frames().iter().map(|f| f.pid).collect();
        assert_eq!(
            pids,
            [
                REQ_TEXT_CONFIG_NO_SAVE,
                REQ_CLEAR_SPECTRUM,
                REQ_ENABLE_MCA,
                REQ_DISABLE_MCA,
                REQ_SPECTRUM
            ]
        );
    }

    #[test]
    fn test_acquire_live_time_waits_out_grace() {
        let (mock, clock, mut mca) = connected(DeviceModel::Mca8000d);
        let config = SessionConfig {
            live_time_grace_ms: 3000,
            ..Default::default()
        };
        mca = mca.with_config(config);

        let spectrum = mca
            .acquire_spectrum(AcquisitionPreset::LiveTime(Duration::from_millis(2500)))
            .unwrap();
        assert_eq!(spectrum.channels(), 1024);
        assert_eq!(mock.param("PREL").as_deref(), Some("2.5"));
        assert_eq!(clock.elapsed(), Duration::from_millis(5500));
        assert_eq!(mca.state(), SessionState::Idle);
    }

    #[test]
    fn test_wait_returns_without_active_preset() {
        let (_mock, clock, mut mca) = connected(DeviceModel::Dp5);
        mca.enable_mca().unwrap();
        mca.wait_until_mca_closed(Duration::from_secs(1), Duration::from_secs(60))
            .unwrap();
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_wait_times_out_with_active_preset() {
        let (_mock, clock, mut mca) = connected(DeviceModel::Dp5);
        mca.set_parameter("PRET", 30, false).unwrap();
        mca.enable_mca().unwrap();
        let err = mca
            .wait_until_mca_closed(Duration::from_secs(1), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, AmptekError::Timeout { .. }));
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn test_read_configuration_and_echo() {
        let (_mock, _clock, mut mca) = connected(DeviceModel::Dp5);
        mca.set_parameter("MCAC", 512, false).unwrap();
        let values = mca.read_configuration(&["mcac", "HVSE"]).unwrap();
        assert_eq!(
            values,
            [
                ("MCAC".to_string(), "512".to_string()),
                ("HVSE".to_string(), "OFF".to_string())
            ]
        );
        assert!(mca.read_configuration(&["NOPE"]).is_err());
        assert_eq!(mca.echo_test("ping").unwrap(), "ping");
    }

    #[test]
    fn test_apply_default_configuration() {
        let (mock, _clock, mut mca) = connected(DeviceModel::Dp5);
        assert!(mca.default_configurations_for_model().contains(&"SDD Default DP5"));
        assert!(mca.get_available_default_configurations().contains_key(&DeviceModel::Px5));

        mca.apply_default_configuration(DeviceModel::Dp5, "SDD Default DP5", ApplyOptions::default())
            .unwrap();
        assert_eq!(mock.param("MCAC").as_deref(), Some("2048"));
        assert_eq!(mock.param("RTDS").as_deref(), Some("2"));
        assert_eq!(mock.param("HVSE").as_deref(), Some("130"));
        assert!(mock.config_writes()[0].starts_with("RESC=Y;"));
        assert_eq!(mock.param("VOLU"), None);

        assert!(matches!(
            mca.apply_default_configuration(DeviceModel::Dp5, "Nope", ApplyOptions::default()),
            Err(AmptekError::NotFound(_))
        ));
        assert!(matches!(
            mca.apply_default_configuration(DeviceModel::Px5, "SDD Default PX5", ApplyOptions::default()),
            Err(AmptekError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_spectrum_length_must_match_channels() {
        assert!(matches!(
            Spectrum::from_payload(256, &[0u8; 700]),
            Err(AmptekError::Protocol(_))
        ));
        let spectrum = Spectrum::from_payload(2, &[1, 0, 0, 0xFF, 0xFF, 0xFF]).unwrap();
        assert_eq!(spectrum.counts, [1, 0xFF_FFFF]);
    }

    #[test]
    fn test_config_defaults_and_step_cap() {
        let config: SessionConfig =
            toml::from_str("hv_step_volts = 80.0\nbatch_policy = \"best_effort\"").unwrap();
        assert_eq!(config.command_timeout(), DEFAULT_TIMEOUT);
        assert_eq!(config.batch_policy, BatchPolicy::BestEffort);
        assert_eq!(config.ramp_settings().max_step, HV_MAX_STEP_VOLTS);
    }

    #[test]
    fn test_pack_commands_keeps_order() {
        let commands: Vec<String> = (0..100).map(|i| format!("GAIN={:02};", i)).collect();
        let packets = pack_commands(&commands);
        assert!(packets.iter().all(|p| p.len() <= MAX_REQUEST_DATA));
        assert_eq!(packets.concat(), commands.concat());
        assert!(preset_active("10"));
        assert!(!preset_active("OFF"));
        assert!(!preset_active("0"));
    }
}
