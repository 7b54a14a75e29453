//! Protocol module - Amptek DPP packet protocol definitions.

pub mod ack;
pub mod command;
pub mod constants;
pub mod frame;
pub mod status;

pub use ack::AckCode;
pub use command::{Command, Reply};
pub use constants::*;
pub use frame::{Frame, FrameDecoder, FrameError, Pid, checksum, decode, encode};
pub use status::{BootloaderVersion, DeviceModel, DeviceStatus, StatusError, StatusFlags};
