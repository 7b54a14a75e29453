//! ACK code parsing and matching.
//!
//! Every acknowledgment packet carries PID1 `0xFF`; its PID2 is the code.
//! Three codes mean success, the rest are device-reported errors.

use std::fmt;

use super::constants::*;

/// Acknowledgment code reported by a device.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckCode(u8);

impl AckCode {
    pub const fn new(code: u8) -> Self {
        Self(code)
    }

    /// Raw PID2 value.
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Whether the device accepted the request.
    pub fn is_ok(&self) -> bool {
        ACK_OK_CODES.contains(&self.0)
    }

    /// Whether the ACK payload echoes the offending command as ASCII.
    pub fn echoes_command(&self) -> bool {
        matches!(
            self.0,
            ACK_BAD_PARAMETER | ACK_UNRECOGNIZED_COMMAND | ACK_PC5_NOT_PRESENT
        )
    }

    /// Human readable name from the programmer's guide.
    pub fn description(&self) -> &'static str {
        match self.0 {
            ACK_OK => "OK",
            ACK_SYNC_ERROR => "Sync Error",
            ACK_PID_ERROR => "PID Error",
            ACK_LEN_ERROR => "Length Error",
            ACK_CHECKSUM_ERROR => "Checksum Error",
            ACK_BAD_PARAMETER => "Bad Parameter",
            ACK_BAD_HEX_RECORD => "Bad Hex Record",
            ACK_UNRECOGNIZED_COMMAND => "Unrecognized Command",
            ACK_FPGA_ERROR => "FPGA Error",
            ACK_CP2201_NOT_FOUND => "Ethernet Controller Not Found",
            ACK_SCOPE_DATA_NOT_AVAILABLE => "Scope Data Not Available",
            ACK_PC5_NOT_PRESENT => "PC5 Not Present",
            ACK_OK_SHARING_REQUEST => "OK (Interface Sharing Request)",
            ACK_BUSY => "Device Busy",
            ACK_I2C_ERROR => "I2C Error",
            ACK_OK_FPGA_UPLOAD_ADDRESS => "OK (FPGA Upload Address)",
            ACK_FEATURE_NOT_SUPPORTED => "Feature Not Supported By FPGA",
            ACK_CALIBRATION_NOT_PRESENT => "Calibration Data Not Present",
            _ => "Unknown ACK",
        }
    }
}

impl fmt::Debug for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AckCode(0x{:02X} '{}')", self.0, self.description())
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_codes() {
        assert!(AckCode::new(ACK_OK).is_ok());
        assert!(AckCode::new(ACK_OK_SHARING_REQUEST).is_ok());
        assert!(AckCode::new(ACK_OK_FPGA_UPLOAD_ADDRESS).is_ok());
        assert!(!AckCode::new(ACK_BUSY).is_ok());
    }

    #[test]
    fn test_error_description() {
        let ack = AckCode::new(ACK_BAD_PARAMETER);
        assert_eq!(ack.description(), "Bad Parameter");
        assert!(ack.echoes_command());
        assert_eq!(ack.to_string(), "Bad Parameter (0x05)");
    }

    #[test]
    fn test_unknown_code() {
        let ack = AckCode::new(0x42);
        assert!(!ack.is_ok());
        assert_eq!(ack.description(), "Unknown ACK");
    }
}
