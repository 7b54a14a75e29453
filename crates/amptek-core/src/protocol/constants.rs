//! Protocol constants from the Amptek DP5 programmer's guide.
//!
//! Packet identifiers are written as `(PID1, PID2)` pairs.

use std::time::Duration;

use super::frame::Pid;

// ============================================================================
// Device Identification
// ============================================================================

/// Silicon Labs vendor ID used by Amptek DPP units.
pub const AMPTEK_VENDOR_ID: u16 = 0x10C4;
/// Product ID shared by DP5, PX5, DP5G, MCA8000D, TB5 and DP5-X.
pub const AMPTEK_PRODUCT_ID: u16 = 0x842A;

/// Bulk IN endpoint address.
pub const EP_IN: u8 = 0x81;
/// Bulk OUT endpoint address.
pub const EP_OUT: u8 = 0x02;

/// Default baud rate for the serial interface.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

// ============================================================================
// Framing
// ============================================================================

pub const SYNC1: u8 = 0xF5;
pub const SYNC2: u8 = 0xFA;

/// Sync (2) + PID (2) + length (2).
pub const HEADER_LEN: usize = 6;
pub const CHECKSUM_LEN: usize = 2;

/// Largest payload a request may carry.
pub const MAX_REQUEST_DATA: usize = 512;
/// Largest payload a reply may carry.
pub const MAX_RESPONSE_DATA: usize = 32_768;
/// Largest complete reply packet on the wire.
pub const MAX_PACKET_LEN: usize = HEADER_LEN + MAX_RESPONSE_DATA + CHECKSUM_LEN;

/// Size of the status block returned by a status request.
pub const STATUS_LEN: usize = 64;

// ============================================================================
// Requests (Host -> Device)
// ============================================================================

pub const REQ_STATUS: Pid = Pid::new(0x01, 0x01);
pub const REQ_SPECTRUM: Pid = Pid::new(0x02, 0x01);
/// Text configuration, saved to flash.
pub const REQ_TEXT_CONFIG: Pid = Pid::new(0x20, 0x02);
pub const REQ_TEXT_CONFIG_READBACK: Pid = Pid::new(0x20, 0x03);
/// Text configuration, applied without saving.
pub const REQ_TEXT_CONFIG_NO_SAVE: Pid = Pid::new(0x20, 0x04);
pub const REQ_CLEAR_SPECTRUM: Pid = Pid::new(0xF0, 0x01);
pub const REQ_ENABLE_MCA: Pid = Pid::new(0xF0, 0x02);
pub const REQ_DISABLE_MCA: Pid = Pid::new(0xF0, 0x03);
pub const REQ_AUTOSET_OFFSET: Pid = Pid::new(0xF0, 0x05);
pub const REQ_AUTOSET_FAST_THRESH: Pid = Pid::new(0xF0, 0x06);
pub const REQ_COMM_TEST_ECHO: Pid = Pid::new(0xF1, 0x7F);

// ============================================================================
// Responses (Device -> Host)
// ============================================================================

pub const RESP_STATUS: Pid = Pid::new(0x80, 0x01);
/// Mini-X status block. Not a DPP.
pub const RESP_MINIX_STATUS: Pid = Pid::new(0x80, 0x02);
/// PID1 of every spectrum reply; PID2 encodes the channel count.
pub const RESP_SPECTRUM_PID1: u8 = 0x81;
pub const RESP_CONFIG_READBACK: Pid = Pid::new(0x82, 0x07);
pub const RESP_COMM_TEST_ECHO: Pid = Pid::new(0x8F, 0x7F);

/// PID1 of every acknowledgment packet.
pub const ACK_PID1: u8 = 0xFF;

// ============================================================================
// Acknowledgment codes (PID2 of an ACK packet)
// ============================================================================

pub const ACK_OK: u8 = 0x00;
pub const ACK_SYNC_ERROR: u8 = 0x01;
pub const ACK_PID_ERROR: u8 = 0x02;
pub const ACK_LEN_ERROR: u8 = 0x03;
pub const ACK_CHECKSUM_ERROR: u8 = 0x04;
pub const ACK_BAD_PARAMETER: u8 = 0x05;
pub const ACK_BAD_HEX_RECORD: u8 = 0x06;
pub const ACK_UNRECOGNIZED_COMMAND: u8 = 0x07;
pub const ACK_FPGA_ERROR: u8 = 0x08;
pub const ACK_CP2201_NOT_FOUND: u8 = 0x09;
pub const ACK_SCOPE_DATA_NOT_AVAILABLE: u8 = 0x0A;
pub const ACK_PC5_NOT_PRESENT: u8 = 0x0B;
pub const ACK_OK_SHARING_REQUEST: u8 = 0x0C;
pub const ACK_BUSY: u8 = 0x0D;
pub const ACK_I2C_ERROR: u8 = 0x0E;
pub const ACK_OK_FPGA_UPLOAD_ADDRESS: u8 = 0x0F;
pub const ACK_FEATURE_NOT_SUPPORTED: u8 = 0x10;
pub const ACK_CALIBRATION_NOT_PRESENT: u8 = 0x11;

/// ACK codes that report success.
pub const ACK_OK_CODES: &[u8] = &[ACK_OK, ACK_OK_SHARING_REQUEST, ACK_OK_FPGA_UPLOAD_ADDRESS];

// ============================================================================
// Spectrum and timing
// ============================================================================

/// Legal channel counts, indexed by `(PID2 - 1) / 2` of a spectrum reply.
pub const CHANNEL_COUNTS: [usize; 6] = [256, 512, 1024, 2048, 4096, 8192];

/// Bytes per spectrum channel (24-bit little-endian count).
pub const BYTES_PER_CHANNEL: usize = 3;

/// Timeout for short request/reply exchanges.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);
/// Timeout for spectrum reads and configuration writes.
pub const LONG_TIMEOUT: Duration = Duration::from_millis(5000);

/// Delay after a configuration packet that is written to flash.
pub const FLASH_WRITE_DELAY: Duration = Duration::from_millis(200);

// ============================================================================
// High voltage
// ============================================================================

/// Largest single HV step the ramp controller will command, in volts.
pub const HV_MAX_STEP_VOLTS: f64 = 50.0;
/// Settling delay between HV steps.
pub const HV_SETTLE_DELAY: Duration = Duration::from_millis(500);
