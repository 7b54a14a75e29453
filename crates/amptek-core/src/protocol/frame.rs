//! Packet framing.
//!
//! Layout of every packet in both directions:
//!
//! ```text
//! F5 FA | PID1 | PID2 | LEN (u16 BE) | DATA[LEN] | CHECKSUM (u16 BE)
//! ```
//!
//! The checksum is the two's complement of the 16-bit sum of all bytes that
//! precede it, sync marker included, so a valid packet sums to zero.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::debug;

use super::ack::AckCode;
use super::constants::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("No sync marker in {0} bytes")]
    NoSync(usize),
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Length field {length} exceeds limit of {limit} bytes")]
    BadLength { length: usize, limit: usize },
    #[error("Checksum mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    Checksum { computed: u16, received: u16 },
    #[error("Payload of {length} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { length: usize, limit: usize },
}

/// Packet identifier pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid {
    pub pid1: u8,
    pub pid2: u8,
}

impl Pid {
    pub const fn new(pid1: u8, pid2: u8) -> Self {
        Self { pid1, pid2 }
    }

    pub fn is_ack(&self) -> bool {
        self.pid1 == ACK_PID1
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}/{:02X}", self.pid1, self.pid2)
    }
}

/// One decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub pid: Pid,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(pid: Pid, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            pid,
            payload: payload.into(),
        }
    }

    /// ACK code if this is an acknowledgment packet.
    pub fn ack_code(&self) -> Option<AckCode> {
        self.pid.is_ack().then(|| AckCode::new(self.pid.pid2))
    }

    /// Serialize with the reply size limit.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        write_frame(self.pid, &self.payload, MAX_RESPONSE_DATA)
    }
}

/// Checksum over `bytes`: two's complement of their 16-bit sum.
pub fn checksum(bytes: &[u8]) -> u16 {
    let sum = bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)));
    (!sum).wrapping_add(1)
}

/// Encode a request packet. Payloads above 512 bytes are rejected.
pub fn encode(pid: Pid, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    write_frame(pid, payload, MAX_REQUEST_DATA)
}

fn write_frame(pid: Pid, payload: &[u8], limit: usize) -> Result<Vec<u8>, FrameError> {
    if payload.len() > limit {
        return Err(FrameError::PayloadTooLarge {
            length: payload.len(),
            limit,
        });
    }
    let body = HEADER_LEN + payload.len();
    let mut buf = vec![0u8; body + CHECKSUM_LEN];
    buf[..4].copy_from_slice(&[SYNC1, SYNC2, pid.pid1, pid.pid2]);
    BigEndian::write_u16(&mut buf[4..HEADER_LEN], payload.len() as u16);
    buf[HEADER_LEN..body].copy_from_slice(payload);
    let sum = checksum(&buf[..body]);
    BigEndian::write_u16(&mut buf[body..], sum);
    Ok(buf)
}

/// Decode the first valid packet in `bytes`.
///
/// Every sync marker is tried in turn, so a marker inside leading garbage
/// does not hide the packet behind it. The error of the last candidate is
/// returned when none parses.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    let mut offset = 0;
    let mut last_err = FrameError::NoSync(bytes.len());
    while let Some(found) = find_sync(&bytes[offset..]) {
        let start = offset + found;
        match parse_at(&bytes[start..]) {
            Ok(Parsed::Complete(frame, _)) => return Ok(frame),
            Ok(Parsed::Incomplete(expected)) => {
                last_err = FrameError::Truncated {
                    expected,
                    actual: bytes.len() - start,
                }
            }
            Err(e) => last_err = e,
        }
        offset = start + 2;
    }
    Err(last_err)
}

fn find_sync(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == [SYNC1, SYNC2])
}

enum Parsed {
    /// Need at least this many bytes from the marker on.
    Incomplete(usize),
    /// Frame plus the number of bytes it occupied.
    Complete(Frame, usize),
}

/// `buf` must start with the sync marker.
fn parse_at(buf: &[u8]) -> Result<Parsed, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(Parsed::Incomplete(HEADER_LEN));
    }
    let length = BigEndian::read_u16(&buf[4..6]) as usize;
    if length > MAX_RESPONSE_DATA {
        return Err(FrameError::BadLength {
            length,
            limit: MAX_RESPONSE_DATA,
        });
    }
    let body = HEADER_LEN + length;
    let total = body + CHECKSUM_LEN;
    if buf.len() < total {
        return Ok(Parsed::Incomplete(total));
    }

    let received = BigEndian::read_u16(&buf[body..total]);
    let computed = checksum(&buf[..body]);
    if received != computed {
        return Err(FrameError::Checksum { computed, received });
    }

    let frame = Frame::new(Pid::new(buf[2], buf[3]), &buf[HEADER_LEN..body]);
    Ok(Parsed::Complete(frame, total))
}

/// Streaming decoder that keeps partial input between reads.
///
/// Bytes before a sync marker are dropped. After a corrupted frame the
/// decoder skips its marker and scans forward again.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Next complete frame, `Ok(None)` if more input is needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let Some(start) = find_sync(&self.buf) else {
            // A trailing SYNC1 may be the first half of a marker.
            let keep = usize::from(self.buf.last() == Some(&SYNC1));
            let dropped = self.buf.len() - keep;
            if dropped > 0 {
                debug!(discarded = dropped, "Skipping bytes without sync marker");
                self.buf.drain(..dropped);
            }
            return Ok(None);
        };
        if start > 0 {
            debug!(discarded = start, "Resynchronized on sync marker");
            self.buf.drain(..start);
        }

        match parse_at(&self.buf) {
            Ok(Parsed::Incomplete(_)) => Ok(None),
            Ok(Parsed::Complete(frame, used)) => {
                self.buf.drain(..used);
                Ok(Some(frame))
            }
            Err(e) => {
                self.buf.drain(..2);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_request_bytes() {
        let bytes = encode(REQ_STATUS, &[]).unwrap();
        assert_eq!(bytes, [0xF5, 0xFA, 0x01, 0x01, 0x00, 0x00, 0xFE, 0x0F]);
    }

    #[test]
    fn test_round_trip() {
        let payload = b"MCAC=2048;RESC=Y;".to_vec();
        let bytes = encode(REQ_TEXT_CONFIG_NO_SAVE, &payload).unwrap();
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.pid, REQ_TEXT_CONFIG_NO_SAVE);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_any_single_byte_flip_is_detected() {
        let bytes = encode(REQ_TEXT_CONFIG_NO_SAVE, b"ABCD").unwrap();
        for i in 0..bytes.len() {
            let mut corrupted = bytes.clone();
            corrupted[i] ^= 0x01;
            assert!(decode(&corrupted).is_err(), "flip at byte {} decoded", i);
        }
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut stream = vec![0x00, 0xF5, 0x13, 0xFA, 0x99];
        stream.extend(encode(REQ_ENABLE_MCA, &[]).unwrap());
        let frame = decode(&stream).unwrap();
        assert_eq!(frame.pid, REQ_ENABLE_MCA);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_resync_past_false_marker() {
        let mut stream = vec![0xF5, 0xFA, 0x01];
        stream.extend(encode(REQ_ENABLE_MCA, &[]).unwrap());
        let frame = decode(&stream).unwrap();
        assert_eq!(frame.pid, REQ_ENABLE_MCA);

        let mut stream = vec![0x07, 0xF5, 0xFA, 0x02, 0x01, 0x00, 0x01, 0xAA, 0x00, 0x00];
        stream.extend(encode(REQ_STATUS, b"ok").unwrap());
        assert_eq!(decode(&stream).unwrap().payload, b"ok");
    }

    #[test]
    fn test_truncated_and_missing_marker() {
        let bytes = encode(REQ_STATUS, b"xyz").unwrap();
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(FrameError::Truncated { .. })
        ));
        assert_eq!(decode(&[1, 2, 3]), Err(FrameError::NoSync(3)));
    }

    #[test]
    fn test_bad_length_field() {
        let bytes = [0xF5, 0xFA, 0x81, 0x01, 0xFF, 0xFF];
        assert!(matches!(decode(&bytes), Err(FrameError::BadLength { .. })));
    }

    #[test]
    fn test_request_payload_limit() {
        let big = vec![b'A'; MAX_REQUEST_DATA + 1];
        assert!(matches!(
            encode(REQ_TEXT_CONFIG, &big),
            Err(FrameError::PayloadTooLarge { .. })
        ));
        let reply = Frame::new(Pid::new(RESP_SPECTRUM_PID1, 0x07), big);
        assert!(reply.to_bytes().is_ok());
    }

    #[test]
    fn test_decoder_byte_at_a_time() {
        let bytes = encode(REQ_COMM_TEST_ECHO, b"hello").unwrap();
        let mut decoder = FrameDecoder::new();
        for (i, b) in bytes.iter().enumerate() {
            decoder.push(&[*b]);
            let got = decoder.next_frame().unwrap();
            if i + 1 < bytes.len() {
                assert!(got.is_none());
            } else {
                assert_eq!(got.unwrap().payload, b"hello");
            }
        }
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_recovers_after_corruption() {
        let mut bad = encode(REQ_STATUS, b"abc").unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let good = encode(REQ_DISABLE_MCA, &[]).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&bad);
        decoder.push(&good);
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::Checksum { .. })
        ));
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.pid, REQ_DISABLE_MCA);
    }

    #[test]
    fn test_ack_code_of_frame() {
        let frame = Frame::new(Pid::new(ACK_PID1, ACK_BUSY), Vec::new());
        assert_eq!(frame.ack_code(), Some(AckCode::new(ACK_BUSY)));
        assert_eq!(Frame::new(RESP_STATUS, Vec::new()).ack_code(), None);
    }
}
