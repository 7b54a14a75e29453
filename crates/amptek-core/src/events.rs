//! Event system for UI decoupling.
//!
//! Lets a CLI or GUI follow what a session is doing without coupling to
//! the core logic.

use std::fmt;

use crate::protocol::{DeviceModel, Pid};

/// Lifecycle state of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Connected, MCA disabled.
    Idle,
    /// Connected, MCA enabled.
    Acquiring,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        !matches!(self, SessionState::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "Disconnected"),
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Acquiring => write!(f, "Acquiring"),
        }
    }
}

/// Packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by a device session.
#[derive(Debug, Clone)]
pub enum McaEvent {
    Connected {
        device: String,
        model: DeviceModel,
        serial_number: u32,
    },
    Disconnected { device: String },
    StateChanged { from: SessionState, to: SessionState },
    Packet {
        direction: PacketDirection,
        pid: Pid,
        length: usize,
    },
    /// Stale frame dropped while waiting for a reply.
    StaleFrame { pid: Pid },
    /// Bytes that failed to decode, skipped while waiting for a reply.
    CorruptFrame { reason: String },
    RampStep {
        step: usize,
        total: usize,
        volts: f64,
    },
}

/// Observer trait for receiving session events.
pub trait McaObserver: Send + Sync {
    fn on_event(&self, event: &McaEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl McaObserver for NullObserver {
    fn on_event(&self, _event: &McaEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl McaObserver for TracingObserver {
    fn on_event(&self, event: &McaEvent) {
        match event {
            McaEvent::Connected {
                device,
                model,
                serial_number,
            } => {
                tracing::info!(device = %device, model = %model, serial = serial_number, "Device connected");
            }
            McaEvent::Disconnected { device } => {
                tracing::info!(device = %device, "Device disconnected");
            }
            McaEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State changed");
            }
            McaEvent::Packet {
                direction,
                pid,
                length,
            } => {
                tracing::trace!(dir = %direction, pid = %pid, len = length, "Packet");
            }
            McaEvent::StaleFrame { pid } => {
                tracing::warn!(pid = %pid, "Discarded stale frame");
            }
            McaEvent::CorruptFrame { reason } => {
                tracing::warn!(reason = %reason, "Discarded corrupted frame");
            }
            McaEvent::RampStep { step, total, volts } => {
                tracing::info!(step = step, total = total, volts = volts, "HV ramp step");
            }
        }
    }
}
