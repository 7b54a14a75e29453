//! High-voltage ramp controller.
//!
//! The detector bias is never stepped by more than [`HV_MAX_STEP_VOLTS`] at a
//! time. Each step is one setpoint write followed by a settling delay, and
//! when verification is on the device's reported setpoint is read back before
//! the next step. A failed step stops the ramp where it is.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{AmptekError, Result};
use crate::events::{McaEvent, McaObserver};
use crate::protocol::constants::{HV_MAX_STEP_VOLTS, HV_SETTLE_DELAY};

/// Readback may differ from the command by the supply's resolution.
const SETPOINT_TOLERANCE: f64 = 0.5;

/// Requested end state of the HV supply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HvTarget {
    Volts(f64),
    /// Ramp to 0 V, then switch the supply off.
    Off,
}

impl HvTarget {
    /// Voltage the ramp itself ends at.
    pub fn ramp_volts(&self) -> f64 {
        match self {
            HvTarget::Volts(v) => *v,
            HvTarget::Off => 0.0,
        }
    }

    /// Setpoint text as written to the device.
    pub fn to_text(&self) -> String {
        match self {
            HvTarget::Volts(v) => format_volts(*v),
            HvTarget::Off => "OFF".to_string(),
        }
    }
}

impl From<f64> for HvTarget {
    fn from(v: f64) -> Self {
        HvTarget::Volts(v)
    }
}

impl FromStr for HvTarget {
    type Err = AmptekError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("OFF") {
            return Ok(HvTarget::Off);
        }
        s.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(HvTarget::Volts)
            .ok_or_else(|| AmptekError::invalid("HVSE", format!("'{}' is neither a voltage nor OFF", s)))
    }
}

impl fmt::Display for HvTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HvTarget::Volts(v) => write!(f, "{} V", format_volts(*v)),
            HvTarget::Off => f.write_str("OFF"),
        }
    }
}

/// Volts with at most one decimal, as the firmware accepts them.
pub fn format_volts(volts: f64) -> String {
    let rounded = round_tenth(volts);
    if rounded.fract() == 0.0 {
        format!("{:.0}", rounded)
    } else {
        format!("{:.1}", rounded)
    }
}

fn round_tenth(v: f64) -> f64 {
    let r = (v * 10.0).round() / 10.0;
    // -0.0 would print as "-0"
    if r == 0.0 { 0.0 } else { r }
}

/// Nearest 0.1 V grid point not past `v` when moving in `direction`.
fn tenth_toward(v: f64, direction: f64) -> f64 {
    let scaled = v * 10.0;
    let nearest = scaled.round();
    let t = if (scaled - nearest).abs() < 1e-6 {
        nearest
    } else if direction > 0.0 {
        scaled.floor()
    } else {
        scaled.ceil()
    };
    let r = t / 10.0;
    if r == 0.0 { 0.0 } else { r }
}

/// Voltages to command, in order, to move from `start` to `target`.
///
/// Consecutive values differ by at most `max_step`, move monotonically
/// toward the target and the last one is exactly `target`. Empty when
/// already there.
pub fn plan_ramp(start: f64, target: f64, max_step: f64) -> Result<Vec<f64>> {
    if !start.is_finite() || !target.is_finite() {
        return Err(AmptekError::invalid("HVSE", "voltage must be finite"));
    }
    if !(0.1..=HV_MAX_STEP_VOLTS).contains(&max_step) {
        return Err(AmptekError::invalid(
            "HVSE",
            format!("ramp step {} V outside 0.1..={} V", max_step, HV_MAX_STEP_VOLTS),
        ));
    }

    let distance = target - start;
    if distance.abs() < f64::EPSILON {
        return Ok(Vec::new());
    }
    let direction = distance.signum();
    let mut steps = Vec::new();
    let mut prev = start;
    loop {
        // Snapping back toward the previous value keeps an off-grid start within the step.
        let next = tenth_toward(prev + direction * max_step, direction);
        if (target - next) * direction <= 0.0 {
            steps.push(target);
            return Ok(steps);
        }
        steps.push(next);
        prev = next;
    }
}

/// The device side of a ramp: write one setpoint, read the current one.
pub trait HvChannel {
    fn command_hv(&mut self, volts: f64) -> Result<()>;

    /// Reported setpoint. `None` when the device cannot report one.
    fn read_hv(&mut self) -> Result<Option<f64>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RampState {
    #[default]
    Idle,
    Ramping { step: usize, total: usize, target: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampSettings {
    pub max_step: f64,
    pub settle: Duration,
    /// Read the setpoint back after each step.
    pub verify: bool,
}

impl Default for RampSettings {
    fn default() -> Self {
        Self {
            max_step: HV_MAX_STEP_VOLTS,
            settle: HV_SETTLE_DELAY,
            verify: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct HvRampController {
    settings: RampSettings,
    state: RampState,
    last_voltage: Option<f64>,
}

impl HvRampController {
    pub fn new(settings: RampSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    pub fn settings(&self) -> &RampSettings {
        &self.settings
    }

    pub fn state(&self) -> RampState {
        self.state
    }

    /// Last voltage confirmed on the device.
    pub fn last_voltage(&self) -> Option<f64> {
        self.last_voltage
    }

    /// Drop what is known about the supply, e.g. after a disconnect.
    pub fn forget(&mut self) {
        self.last_voltage = None;
        self.state = RampState::Idle;
    }

    /// Ramp from the device's current setpoint to `target`.
    ///
    /// The start voltage is read from the channel, falling back to the last
    /// confirmed voltage and then to 0 V. Returns the voltage reached.
    pub fn ramp_to(
        &mut self,
        channel: &mut dyn HvChannel,
        clock: &dyn Clock,
        observer: &dyn McaObserver,
        target: f64,
    ) -> Result<f64> {
        let start = channel
            .read_hv()?
            .or(self.last_voltage)
            .unwrap_or(0.0);
        self.last_voltage = Some(start);

        let plan = plan_ramp(start, target, self.settings.max_step)?;
        if plan.is_empty() {
            debug!(volts = target, "HV already at target");
            return Ok(target);
        }
        info!(from = start, to = target, steps = plan.len(), "Ramping HV");

        let total = plan.len();
        for (i, &volts) in plan.iter().enumerate() {
            self.state = RampState::Ramping {
                step: i + 1,
                total,
                target,
            };
            if i > 0 {
                clock.sleep(self.settings.settle);
            }
            if let Err(source) = self.step(channel, volts) {
                let last_voltage = self.last_voltage.unwrap_or(start);
                warn!(step = i + 1, volts, last_voltage, error = %source, "HV ramp aborted");
                self.state = RampState::Idle;
                return Err(AmptekError::RampAborted {
                    last_voltage,
                    source: Box::new(source),
                });
            }
            self.last_voltage = Some(volts);
            observer.on_event(&McaEvent::RampStep {
                step: i + 1,
                total,
                volts,
            });
        }

        self.state = RampState::Idle;
        info!(volts = target, "HV ramp complete");
        Ok(target)
    }

    fn step(&mut self, channel: &mut dyn HvChannel, volts: f64) -> Result<()> {
        channel.command_hv(volts)?;
        if !self.settings.verify {
            return Ok(());
        }
        match channel.read_hv()? {
            Some(reported) if (reported - volts).abs() > SETPOINT_TOLERANCE => {
                Err(AmptekError::Protocol(format!(
                    "HV setpoint reads back {} V after commanding {} V",
                    format_volts(reported),
                    format_volts(volts)
                )))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::NullObserver;
    use crate::protocol::AckCode;
    use crate::protocol::constants::ACK_BUSY;

    #[derive(Default)]
    struct FakeSupply {
        setpoint: Option<f64>,
        commands: Vec<f64>,
        fail_at: Option<usize>,
        drift: f64,
    }

    impl HvChannel for FakeSupply {
        fn command_hv(&mut self, volts: f64) -> Result<()> {
            if self.fail_at == Some(self.commands.len() + 1) {
                return Err(AmptekError::Device {
                    code: AckCode::new(ACK_BUSY),
                    detail: None,
                });
            }
            self.commands.push(volts);
            self.setpoint = Some(volts + self.drift);
            Ok(())
        }

        fn read_hv(&mut self) -> Result<Option<f64>> {
            Ok(self.setpoint)
        }
    }

    #[test]
    fn test_plan_is_monotonic_and_exact() {
        let plan = plan_ramp(0.0, -500.0, 50.0).unwrap();
        assert_eq!(plan.len(), 10);
        assert_eq!(*plan.last().unwrap(), -500.0);

        let plan = plan_ramp(12.0, 130.0, 50.0).unwrap();
        assert_eq!(plan, [62.0, 112.0, 130.0]);

        let plan = plan_ramp(180.0, 0.0, 30.0).unwrap();
        let mut prev = 180.0;
        for v in &plan {
            assert!(*v < prev);
            assert!(prev - v <= 30.0 + 1e-9);
            prev = *v;
        }
        assert_eq!(prev, 0.0);
    }

    #[test]
    fn test_plan_from_off_grid_start() {
        let plan = plan_ramp(12.37, 200.0, 50.0).unwrap();
        assert_eq!(plan, [62.3, 112.3, 162.3, 200.0]);
        let mut prev = 12.37;
        for v in &plan {
            assert!(*v > prev);
            assert!(v - prev <= 50.0 + 1e-6, "{} -> {}", prev, v);
            prev = *v;
        }

        let plan = plan_ramp(-0.05, -0.5, 0.15).unwrap();
        let mut prev = -0.05;
        for v in &plan {
            assert!(*v < prev);
            assert!(prev - v <= 0.15 + 1e-6, "{} -> {}", prev, v);
            prev = *v;
        }
        assert_eq!(prev, -0.5);
    }

    #[test]
    fn test_plan_rejects_bad_step() {
        assert!(plan_ramp(0.0, 100.0, 60.0).is_err());
        assert!(plan_ramp(0.0, 100.0, 0.0).is_err());
        assert!(plan_ramp(0.0, f64::NAN, 10.0).is_err());
        assert!(plan_ramp(100.0, 100.0, 50.0).unwrap().is_empty());
    }

    #[test]
    fn test_ramp_waits_between_steps() {
        let clock = ManualClock::new();
        let mut supply = FakeSupply::default();
        let mut ramp = HvRampController::default();

        let reached = ramp.ramp_to(&mut supply, &clock, &NullObserver, 150.0).unwrap();
        assert_eq!(reached, 150.0);
        assert_eq!(supply.commands, [50.0, 100.0, 150.0]);
        assert_eq!(clock.elapsed(), HV_SETTLE_DELAY * 2);
        assert_eq!(ramp.last_voltage(), Some(150.0));
        assert_eq!(ramp.state(), RampState::Idle);
    }

    #[test]
    fn test_ramp_starts_from_reported_setpoint() {
        let clock = ManualClock::new();
        let mut supply = FakeSupply {
            setpoint: Some(-120.0),
            ..Default::default()
        };
        let mut ramp = HvRampController::default();
        ramp.ramp_to(&mut supply, &clock, &NullObserver, 0.0).unwrap();
        assert_eq!(supply.commands, [-70.0, -20.0, 0.0]);
    }

    #[test]
    fn test_fail_stop_reports_previous_step() {
        let clock = ManualClock::new();
        let mut supply = FakeSupply {
            fail_at: Some(3),
            ..Default::default()
        };
        let mut ramp = HvRampController::default();

        let err = ramp
            .ramp_to(&mut supply, &clock, &NullObserver, 200.0)
            .unwrap_err();
        match err {
            AmptekError::RampAborted { last_voltage, source } => {
                assert_eq!(last_voltage, 100.0);
                assert!(matches!(*source, AmptekError::Device { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(supply.commands, [50.0, 100.0]);
        assert_eq!(ramp.last_voltage(), Some(100.0));
    }

    #[test]
    fn test_readback_mismatch_aborts() {
        let clock = ManualClock::new();
        let mut supply = FakeSupply {
            drift: 5.0,
            ..Default::default()
        };
        let mut ramp = HvRampController::default();
        let err = ramp
            .ramp_to(&mut supply, &clock, &NullObserver, 100.0)
            .unwrap_err();
        assert!(matches!(
            err,
            AmptekError::RampAborted { last_voltage, .. } if last_voltage == 0.0
        ));
        assert!(matches!(err.root(), AmptekError::Protocol(_)));
    }

    #[test]
    fn test_target_parsing_and_format() {
        assert_eq!("off".parse::<HvTarget>().unwrap(), HvTarget::Off);
        assert_eq!("-500".parse::<HvTarget>().unwrap(), HvTarget::Volts(-500.0));
        assert!("high".parse::<HvTarget>().is_err());
        assert_eq!(format_volts(-500.0), "-500");
        assert_eq!(format_volts(12.34), "12.3");
        assert_eq!(format_volts(-0.01), "0");
        assert_eq!(HvTarget::Off.to_text(), "OFF");
    }
}
