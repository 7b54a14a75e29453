//! Command transaction engine.
//!
//! One request, one matching reply, bounded by a timeout. Valid frames that
//! do not complete the current request (late replies to an earlier, timed
//! out request) are dropped. Nothing is retried here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::error::{AmptekError, Result};
use crate::events::{McaEvent, McaObserver, PacketDirection};
use crate::protocol::command::{Command, Reply};
use crate::protocol::constants::MAX_PACKET_LEN;
use crate::protocol::frame::{Frame, FrameDecoder, encode};
use crate::transport::Transport;

pub struct TransactionEngine {
    decoder: FrameDecoder,
    clock: Arc<dyn Clock>,
}

impl TransactionEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            decoder: FrameDecoder::new(),
            clock,
        }
    }

    /// Drop any partially received input.
    pub fn reset(&mut self) {
        self.decoder.clear();
    }

    /// Send `command` and wait up to `timeout` for the frame that completes it.
    #[instrument(skip(self, transport, payload, observer), fields(command = command.name(), len = payload.len()))]
    pub fn execute(
        &mut self,
        transport: &mut dyn Transport,
        command: Command,
        payload: &[u8],
        timeout: Duration,
        observer: &dyn McaObserver,
    ) -> Result<Frame> {
        let request = encode(command.pid(), payload)?;
        transport.write(&request)?;
        observer.on_event(&McaEvent::Packet {
            direction: PacketDirection::Tx,
            pid: command.pid(),
            length: request.len(),
        });

        let expected = command.expected_reply();
        let deadline = deadline_after(self.clock.as_ref(), timeout);
        // The first read always gets the full timeout.
        let mut remaining = timeout;
        let mut corrupted = None;

        loop {
            loop {
                let frame = match self.decoder.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        // Leftovers of an earlier exchange can precede the reply.
                        debug!(error = %e, "Skipping corrupted frame");
                        observer.on_event(&McaEvent::CorruptFrame {
                            reason: e.to_string(),
                        });
                        corrupted = Some(e);
                        continue;
                    }
                };
                observer.on_event(&McaEvent::Packet {
                    direction: PacketDirection::Rx,
                    pid: frame.pid,
                    length: frame.payload.len(),
                });

                if let Some(code) = frame.ack_code() {
                    if !code.is_ok() {
                        let detail = (code.echoes_command() && !frame.payload.is_empty())
                            .then(|| String::from_utf8_lossy(&frame.payload).into_owned());
                        warn!(ack = %code, "Device reported an error");
                        return Err(AmptekError::Device { code, detail });
                    }
                    if expected == Reply::Ack {
                        debug!(ack = %code, "Request acknowledged");
                        return Ok(frame);
                    }
                } else if expected.accepts(frame.pid) {
                    debug!(pid = %frame.pid, len = frame.payload.len(), "Reply received");
                    return Ok(frame);
                }

                debug!(pid = %frame.pid, "Discarding frame that does not answer this request");
                observer.on_event(&McaEvent::StaleFrame { pid: frame.pid });
            }

            if remaining.is_zero() {
                if let Some(e) = corrupted {
                    warn!(error = %e, "No valid reply, only corrupted frames");
                    return Err(AmptekError::Frame(e));
                }
                warn!(timeout_ms = timeout.as_millis() as u64, "Transaction timed out");
                return Err(AmptekError::Timeout {
                    command: command.name(),
                    waited: timeout,
                });
            }
            let chunk = transport.read(MAX_PACKET_LEN, remaining)?;
            self.decoder.push(&chunk);
            remaining = match deadline {
                Some(deadline) => self.clock.remaining(deadline),
                None => remaining,
            };
        }
    }
}

/// `now + timeout`, or `None` when that is too far out to represent.
pub(crate) fn deadline_after(clock: &dyn Clock, timeout: Duration) -> Option<Instant> {
    clock.now().checked_add(timeout)
}
