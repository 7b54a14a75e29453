//! Error type shared by every public operation.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{AckCode, FrameError, StatusError};
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum AmptekError {
    #[error("Connection to {target} failed: {reason}")]
    Connection { target: String, reason: String },

    #[error("No reply to {command} within {}ms", .waited.as_millis())]
    Timeout {
        command: &'static str,
        waited: Duration,
    },

    #[error("Corrupted frame: {0}")]
    Frame(#[from] FrameError),

    #[error("Device rejected request: {code}{}", .detail.as_deref().map(|d| format!(" [{}]", d)).unwrap_or_default())]
    Device {
        code: AckCode,
        /// Command text echoed back by the device, if any.
        detail: Option<String>,
    },

    #[error("Invalid parameter {code}: {reason}")]
    InvalidParameter { code: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Session is not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("HV ramp aborted at {last_voltage} V: {source}")]
    RampAborted {
        last_voltage: f64,
        #[source]
        source: Box<AmptekError>,
    },

    #[error("Device worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("{} parameter(s) failed to apply", .failures.len())]
    PartiallyApplied { failures: Vec<(String, AmptekError)> },
}

impl AmptekError {
    pub(crate) fn invalid(code: impl Into<String>, reason: impl Into<String>) -> Self {
        AmptekError::InvalidParameter {
            code: code.into(),
            reason: reason.into(),
        }
    }

    /// Innermost error, looking through ramp aborts.
    pub fn root(&self) -> &AmptekError {
        match self {
            AmptekError::RampAborted { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<StatusError> for AmptekError {
    fn from(e: StatusError) -> Self {
        AmptekError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AmptekError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{ACK_BAD_PARAMETER, ACK_BUSY};

    #[test]
    fn test_device_error_message() {
        let err = AmptekError::Device {
            code: AckCode::new(ACK_BAD_PARAMETER),
            detail: Some("GAIN=900".into()),
        };
        assert_eq!(
            err.to_string(),
            "Device rejected request: Bad Parameter (0x05) [GAIN=900]"
        );
    }

    #[test]
    fn test_root_of_ramp_abort() {
        let err = AmptekError::RampAborted {
            last_voltage: 100.0,
            source: Box::new(AmptekError::Device {
                code: AckCode::new(ACK_BUSY),
                detail: None,
            }),
        };
        assert!(matches!(err.root(), AmptekError::Device { .. }));
        assert_eq!(
            err.to_string(),
            "HV ramp aborted at 100 V: Device rejected request: Device Busy (0x0D)"
        );
    }
}
