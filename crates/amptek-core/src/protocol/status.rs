//! Status block decoding and device model identity.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::STATUS_LEN;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    #[error("Status block too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Unknown device id {0}")]
    UnknownDevice(u8),
}

/// DPP family members that speak this protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceModel {
    Dp5,
    Px5,
    Dp5g,
    Mca8000d,
    Tb5,
    Dp5x,
}

impl DeviceModel {
    pub const ALL: [DeviceModel; 6] = [
        DeviceModel::Dp5,
        DeviceModel::Px5,
        DeviceModel::Dp5g,
        DeviceModel::Mca8000d,
        DeviceModel::Tb5,
        DeviceModel::Dp5x,
    ];

    /// Model from status byte 39.
    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(usize::from(id)).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceModel::Dp5 => "DP5",
            DeviceModel::Px5 => "PX5",
            DeviceModel::Dp5g => "DP5G",
            DeviceModel::Mca8000d => "MCA8000D",
            DeviceModel::Tb5 => "TB5",
            DeviceModel::Dp5x => "DP5X",
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for DeviceModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.name() == normalized)
            .ok_or_else(|| format!("unknown device model '{}'", s))
    }
}

/// Flag bits from status bytes 35, 36 and 38.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub preset_real_time_reached: bool,
    /// Byte 35 bit 6 on everything but the MCA8000D.
    pub auto_fast_threshold_locked: bool,
    /// Byte 35 bit 6 on the MCA8000D.
    pub preset_live_time_reached: bool,
    pub mca_enabled: bool,
    pub preset_counts_reached: bool,
    pub gate_active: bool,
    pub scope_data_ready: bool,
    pub unit_configured: bool,
    pub auto_input_offset_locked: bool,
    pub mcs_finished: bool,
    pub first_packet_since_reboot: bool,
    pub fpga_clock_80mhz: bool,
    pub fpga_clock_auto: bool,
    /// DP5, DP5G and TB5 only.
    pub pc5_detected: Option<bool>,
    /// PX5 only.
    pub hv_jumper_ok: Option<bool>,
    /// DP5, PX5 and DP5X only.
    pub hv_polarity_positive: Option<bool>,
    /// DP5 and PX5 only: preamp supply is 8.5 V rather than 5 V.
    pub preamp_supply_8_5v: Option<bool>,
}

/// Bootloader revision from status byte 48.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderVersion {
    /// Units shipped before the 7.00 bootloader.
    Original,
    V7_00_00,
    V7_00_01,
    Unknown(u8),
}

impl BootloaderVersion {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0xFF => BootloaderVersion::Original,
            0x80 => BootloaderVersion::V7_00_00,
            0x7F => BootloaderVersion::V7_00_01,
            other => BootloaderVersion::Unknown(other),
        }
    }
}

impl fmt::Display for BootloaderVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootloaderVersion::Original => f.pad("Original"),
            BootloaderVersion::V7_00_00 => f.pad("7.00.00"),
            BootloaderVersion::V7_00_01 => f.pad("7.00.01"),
            BootloaderVersion::Unknown(b) => write!(f, "Unknown (0x{:02X})", b),
        }
    }
}

/// Decoded 64-byte status block.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub model: DeviceModel,
    pub serial_number: u32,
    pub firmware_version: String,
    pub fpga_version: String,
    pub fast_count: u32,
    pub slow_count: u32,
    pub gp_counter: u32,
    pub acquisition_time: Duration,
    pub real_time: Duration,
    /// High voltage readback in volts.
    pub hv_volts: f64,
    /// Detector temperature in kelvin.
    pub detector_temp_k: f64,
    pub board_temp_c: i8,
    /// PX5 fitted with the 5 kV HPGe supply option.
    pub hpge_option: bool,
    pub bootloader: BootloaderVersion,
    pub flags: StatusFlags,
}

impl DeviceStatus {
    pub fn from_bytes(data: &[u8]) -> Result<Self, StatusError> {
        if data.len() < STATUS_LEN {
            return Err(StatusError::BufferTooSmall {
                expected: STATUS_LEN,
                actual: data.len(),
            });
        }
        let model = DeviceModel::from_id(data[39]).ok_or(StatusError::UnknownDevice(data[39]))?;

        let acq_ms =
            u64::from(data[12]) + u64::from(LittleEndian::read_u24(&data[13..16])) * 100;
        let firmware_version = format!("{}.{:02}.{:02}", data[24] >> 4, data[24] & 0x0F, data[37] & 0x0F);
        let fpga_version = format!("{}.{:02}", data[25] >> 4, data[25] & 0x0F);
        let detector_raw = (u16::from(data[32] & 0x0F) << 8) | u16::from(data[33]);

        Ok(Self {
            model,
            serial_number: LittleEndian::read_u32(&data[26..30]),
            firmware_version,
            fpga_version,
            fast_count: LittleEndian::read_u32(&data[0..4]),
            slow_count: LittleEndian::read_u32(&data[4..8]),
            gp_counter: LittleEndian::read_u32(&data[8..12]),
            acquisition_time: Duration::from_millis(acq_ms),
            real_time: Duration::from_millis(u64::from(LittleEndian::read_u32(&data[20..24]))),
            hv_volts: f64::from(BigEndian::read_i16(&data[30..32])) * 0.5,
            detector_temp_k: f64::from(detector_raw) * 0.1,
            board_temp_c: data[34] as i8,
            hpge_option: model == DeviceModel::Px5 && data[42] == 1,
            bootloader: BootloaderVersion::from_byte(data[48]),
            flags: parse_flags(model, data[35], data[36], data[38]),
        })
    }
}

fn parse_flags(model: DeviceModel, b35: u8, b36: u8, b38: u8) -> StatusFlags {
    let bit = |byte: u8, mask: u8| byte & mask != 0;
    let mca8000d = model == DeviceModel::Mca8000d;
    let pc5_models = matches!(model, DeviceModel::Dp5 | DeviceModel::Dp5g | DeviceModel::Tb5);
    let polarity_models = matches!(model, DeviceModel::Dp5 | DeviceModel::Px5 | DeviceModel::Dp5x);
    let preamp_models = matches!(model, DeviceModel::Dp5 | DeviceModel::Px5);

    StatusFlags {
        preset_real_time_reached: bit(b35, 0x80),
        auto_fast_threshold_locked: !mca8000d && bit(b35, 0x40),
        preset_live_time_reached: mca8000d && bit(b35, 0x40),
        mca_enabled: bit(b35, 0x20),
        preset_counts_reached: bit(b35, 0x10),
        gate_active: bit(b35, 0x08),
        scope_data_ready: bit(b35, 0x04),
        unit_configured: bit(b35, 0x02),
        auto_input_offset_locked: !bit(b36, 0x80),
        mcs_finished: bit(b36, 0x40),
        first_packet_since_reboot: bit(b36, 0x20),
        fpga_clock_80mhz: bit(b36, 0x02),
        fpga_clock_auto: bit(b36, 0x01),
        pc5_detected: pc5_models.then(|| bit(b38, 0x80)),
        hv_jumper_ok: (model == DeviceModel::Px5).then(|| bit(b38, 0x80)),
        hv_polarity_positive: polarity_models.then(|| bit(b38, 0x40)),
        preamp_supply_8_5v: preamp_models.then(|| bit(b38, 0x20)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> [u8; STATUS_LEN] {
        let mut data = [0u8; STATUS_LEN];
        data[0..4].copy_from_slice(&1000u32.to_le_bytes());
        data[4..8].copy_from_slice(&900u32.to_le_bytes());
        data[12] = 5;
        data[13] = 10; // 10 * 100 ms
        data[20..24].copy_from_slice(&2500u32.to_le_bytes());
        data[24] = 0x69;
        data[25] = 0x63;
        data[26..30].copy_from_slice(&12345u32.to_le_bytes());
        data[30..32].copy_from_slice(&(-200i16).to_be_bytes());
        data[32] = 0x0B;
        data[33] = 0xB8; // 0xBB8 = 3000 -> 300.0 K
        data[34] = (-5i8) as u8;
        data[35] = 0x20 | 0x02;
        data[36] = 0x80;
        data[37] = 0x07;
        data[38] = 0x40;
        data[39] = 0;
        data[48] = 0x80;
        data
    }

    #[test]
    fn test_parse_status() {
        let status = DeviceStatus::from_bytes(&sample()).unwrap();
        assert_eq!(status.model, DeviceModel::Dp5);
        assert_eq!(status.fast_count, 1000);
        assert_eq!(status.slow_count, 900);
        assert_eq!(status.acquisition_time, Duration::from_millis(1005));
        assert_eq!(status.real_time, Duration::from_millis(2500));
        assert_eq!(status.firmware_version, "6.09.07");
        assert_eq!(status.fpga_version, "6.03");
        assert_eq!(status.serial_number, 12345);
        assert_eq!(status.hv_volts, -100.0);
        assert!((status.detector_temp_k - 300.0).abs() < 1e-9);
        assert_eq!(status.board_temp_c, -5);
        assert!(status.flags.mca_enabled);
        assert!(status.flags.unit_configured);
        assert!(!status.flags.auto_input_offset_locked);
        assert_eq!(status.flags.hv_polarity_positive, Some(true));
        assert_eq!(status.flags.pc5_detected, Some(false));
        assert_eq!(status.flags.hv_jumper_ok, None);
        assert_eq!(status.bootloader, BootloaderVersion::V7_00_00);
    }

    #[test]
    fn test_bootloader_versions() {
        assert_eq!(BootloaderVersion::from_byte(0xFF), BootloaderVersion::Original);
        assert_eq!(BootloaderVersion::from_byte(0x7F).to_string(), "7.00.01");
        assert_eq!(BootloaderVersion::from_byte(0x12).to_string(), "Unknown (0x12)");
    }

    #[test]
    fn test_mca8000d_live_time_flag() {
        let mut data = sample();
        data[39] = 3;
        data[35] = 0x40;
        let status = DeviceStatus::from_bytes(&data).unwrap();
        assert_eq!(status.model, DeviceModel::Mca8000d);
        assert!(status.flags.preset_live_time_reached);
        assert!(!status.flags.auto_fast_threshold_locked);
        assert_eq!(status.flags.hv_polarity_positive, None);
    }

    #[test]
    fn test_short_and_unknown() {
        assert!(matches!(
            DeviceStatus::from_bytes(&[0u8; 10]),
            Err(StatusError::BufferTooSmall { .. })
        ));
        let mut data = sample();
        data[39] = 9;
        assert_eq!(
            DeviceStatus::from_bytes(&data),
            Err(StatusError::UnknownDevice(9))
        );
    }

    #[test]
    fn test_model_names() {
        assert_eq!("dp5-x".parse::<DeviceModel>(), Ok(DeviceModel::Dp5x));
        assert_eq!("TB-5".parse::<DeviceModel>(), Ok(DeviceModel::Tb5));
        assert_eq!("MCA8000D".parse::<DeviceModel>(), Ok(DeviceModel::Mca8000d));
        assert!("Mini-X".parse::<DeviceModel>().is_err());
        assert_eq!(DeviceModel::from_id(1), Some(DeviceModel::Px5));
    }
}
