//! Request kinds and the replies that complete them.

use super::constants::*;
use super::frame::Pid;

/// A request the host can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Spectrum,
    ClearSpectrum,
    EnableMca,
    DisableMca,
    /// Text configuration; `save` selects the flash-writing variant.
    TextConfig { save: bool },
    TextConfigReadback,
    AutosetInputOffset,
    AutosetFastThreshold,
    EchoTest,
}

/// What kind of reply completes a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// An OK acknowledgment.
    Ack,
    /// A data packet with exactly this PID.
    Packet(Pid),
    /// A data packet with any of these PIDs.
    OneOf(&'static [Pid]),
    /// Any spectrum packet (PID1 `0x81`, odd PID2 up to 11).
    Spectrum,
}

impl Command {
    /// Request PID written on the wire.
    pub fn pid(&self) -> Pid {
        match self {
            Command::Status => REQ_STATUS,
            Command::Spectrum => REQ_SPECTRUM,
            Command::ClearSpectrum => REQ_CLEAR_SPECTRUM,
            Command::EnableMca => REQ_ENABLE_MCA,
            Command::DisableMca => REQ_DISABLE_MCA,
            Command::TextConfig { save: true } => REQ_TEXT_CONFIG,
            Command::TextConfig { save: false } => REQ_TEXT_CONFIG_NO_SAVE,
            Command::TextConfigReadback => REQ_TEXT_CONFIG_READBACK,
            Command::AutosetInputOffset => REQ_AUTOSET_OFFSET,
            Command::AutosetFastThreshold => REQ_AUTOSET_FAST_THRESH,
            Command::EchoTest => REQ_COMM_TEST_ECHO,
        }
    }

    pub fn expected_reply(&self) -> Reply {
        match self {
            // Mini-X controllers answer with their own status PID
            Command::Status => Reply::OneOf(&[RESP_STATUS, RESP_MINIX_STATUS]),
            Command::Spectrum => Reply::Spectrum,
            Command::TextConfigReadback => Reply::Packet(RESP_CONFIG_READBACK),
            Command::EchoTest => Reply::Packet(RESP_COMM_TEST_ECHO),
            Command::ClearSpectrum
            | Command::EnableMca
            | Command::DisableMca
            | Command::TextConfig { .. }
            | Command::AutosetInputOffset
            | Command::AutosetFastThreshold => Reply::Ack,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::Spectrum => "spectrum",
            Command::ClearSpectrum => "clear-spectrum",
            Command::EnableMca => "enable-mca",
            Command::DisableMca => "disable-mca",
            Command::TextConfig { save: true } => "text-config",
            Command::TextConfig { save: false } => "text-config-no-save",
            Command::TextConfigReadback => "text-config-readback",
            Command::AutosetInputOffset => "autoset-input-offset",
            Command::AutosetFastThreshold => "autoset-fast-threshold",
            Command::EchoTest => "echo-test",
        }
    }
}

impl Reply {
    /// Whether a non-ACK packet with `pid` completes the transaction.
    pub fn accepts(&self, pid: Pid) -> bool {
        match self {
            Reply::Ack => false,
            Reply::Packet(expected) => *expected == pid,
            Reply::OneOf(expected) => expected.contains(&pid),
            Reply::Spectrum => spectrum_channels(pid).is_some(),
        }
    }
}

/// Channel count announced by a spectrum reply PID.
pub fn spectrum_channels(pid: Pid) -> Option<usize> {
    if pid.pid1 != RESP_SPECTRUM_PID1 || pid.pid2 % 2 == 0 {
        return None;
    }
    CHANNEL_COUNTS.get(usize::from(pid.pid2 / 2)).copied()
}

/// Spectrum reply PID for a channel count.
pub fn spectrum_pid(channels: usize) -> Option<Pid> {
    CHANNEL_COUNTS
        .iter()
        .position(|&c| c == channels)
        .map(|i| Pid::new(RESP_SPECTRUM_PID1, (i * 2 + 1) as u8))
}
