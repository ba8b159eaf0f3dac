//! Checksum-framed messages
//!
//! Wire format:
//!
//! ```text
//! 0x00 | CODE | BODY | CHK
//! ```
//!
//! - `0x00` prefixes every frame
//! - `CODE`: on requests, the opcode to call; on replies, the body length
//! - `BODY`: at most 254 bytes
//! - `CHK`: `CODE XOR XOR(BODY)`
//!
//! `CODE` 0xFF is reserved and marks an invalid frame.

use super::checksum;
use crate::core::transport::{byte_debug_string, Transport, TransportError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Frame start byte
pub const SYNC: u8 = 0x00;
/// Reserved opcode/length value
pub const RESERVED_CODE: u8 = 0xFF;
/// Longest body a frame can carry
pub const MAX_BODY_LEN: usize = 254;
/// Sync, code and checksum bytes
pub const FRAME_OVERHEAD: usize = 3;
/// Longest encoded frame
pub const MAX_FRAME_LEN: usize = MAX_BODY_LEN + FRAME_OVERHEAD;

/// Framing errors
#[derive(Error, Debug)]
pub enum FrameError {
    /// Body longer than [`MAX_BODY_LEN`]
    #[error("Frame body too long: {0} bytes (maximum {MAX_BODY_LEN})")]
    BodyTooLong(usize),

    /// Opcode 0xFF requested
    #[error("Opcode 0xff is reserved")]
    ReservedOpcode,

    /// Structurally invalid frame
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Checksum does not match message contents
    #[error("Checksum mismatch: expected {expected:#04x}, received {received:#04x}")]
    ChecksumFault {
        /// Checksum computed over the received contents
        expected: u8,
        /// Checksum byte on the wire
        received: u8,
    },

    /// Nothing arrived before the port timeout
    #[error("No response before timeout")]
    NoResponse,

    /// Frame cut short by the port timeout
    #[error("Truncated frame: expected {expected} bytes, received {received}")]
    Truncated {
        /// Bytes the frame header announced
        expected: usize,
        /// Bytes that arrived
        received: usize,
    },

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// I/O error from a buffered stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One frame: code byte plus body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    code: u8,
    body: Bytes,
}

impl Frame {
    /// Build a request frame calling `opcode`
    pub fn new(opcode: u8, body: impl Into<Bytes>) -> Result<Self, FrameError> {
        let body = body.into();
        if body.len() > MAX_BODY_LEN {
            return Err(FrameError::BodyTooLong(body.len()));
        }
        if opcode == RESERVED_CODE {
            return Err(FrameError::ReservedOpcode);
        }
        Ok(Self { code: opcode, body })
    }

    /// Build a reply frame, whose code is the body length
    pub fn reply(body: impl Into<Bytes>) -> Result<Self, FrameError> {
        let body = body.into();
        let len = u8::try_from(body.len()).map_err(|_| FrameError::BodyTooLong(body.len()))?;
        Self::new(len, body)
    }

    /// Opcode or length byte
    pub fn code(&self) -> u8 {
        self.code
    }

    /// Body bytes
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Take the body
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Checksum byte
    pub fn checksum(&self) -> u8 {
        checksum::frame_checksum(self.code, &self.body)
    }

    /// Size on the wire
    pub fn encoded_len(&self) -> usize {
        self.body.len() + FRAME_OVERHEAD
    }

    /// Append the wire form to `dst`
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(SYNC);
        dst.put_u8(self.code);
        dst.put_slice(&self.body);
        dst.put_u8(self.checksum());
    }

    /// Wire form
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }
}

/// Encode `0x00, opcode, body..., checksum`
pub fn encode(opcode: u8, body: &[u8]) -> Result<Bytes, FrameError> {
    Ok(Frame::new(opcode, Bytes::copy_from_slice(body))?.to_bytes())
}

/// Decode one complete length-delimited frame and return its body.
///
/// `frame` must hold exactly one frame: sync byte, length, `length` body
/// bytes, checksum.
pub fn decode(frame: &[u8]) -> Result<Bytes, FrameError> {
    let (&sync, rest) = frame.split_first().ok_or(FrameError::NoResponse)?;
    if sync != SYNC {
        return Err(FrameError::InvalidFrame(format!("expected sync byte 0x00, found {sync:#04x}")));
    }
    let (&len, rest) = rest.split_first().ok_or(FrameError::Truncated {
        expected: FRAME_OVERHEAD,
        received: frame.len(),
    })?;
    if len == RESERVED_CODE {
        return Err(FrameError::InvalidFrame("reserved length byte 0xff".into()));
    }

    let expected = usize::from(len) + FRAME_OVERHEAD;
    if frame.len() < expected {
        return Err(FrameError::Truncated { expected, received: frame.len() });
    }
    if frame.len() > expected {
        return Err(FrameError::InvalidFrame(format!(
            "{} trailing bytes after frame",
            frame.len() - expected
        )));
    }

    let (body, chk) = rest.split_at(usize::from(len));
    check(len, body, chk[0])?;
    Ok(Bytes::copy_from_slice(body))
}

/// Parse one request frame as written by a host in a single write.
///
/// Requests carry an opcode rather than a length, so the body is everything
/// between the opcode and the trailing checksum.
pub fn decode_command(frame: &[u8]) -> Result<Frame, FrameError> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(FrameError::Truncated { expected: FRAME_OVERHEAD, received: frame.len() });
    }
    if frame[0] != SYNC {
        return Err(FrameError::InvalidFrame(format!(
            "expected sync byte 0x00, found {:#04x}",
            frame[0]
        )));
    }
    let opcode = frame[1];
    let body = &frame[2..frame.len() - 1];
    check(opcode, body, frame[frame.len() - 1])?;
    Frame::new(opcode, Bytes::copy_from_slice(body))
}

fn check(code: u8, body: &[u8], received: u8) -> Result<(), FrameError> {
    if checksum::verify(code, body, received) {
        Ok(())
    } else {
        Err(FrameError::ChecksumFault { expected: checksum::frame_checksum(code, body), received })
    }
}

/// Send one request frame over `transport`
pub fn write_frame(transport: &mut dyn Transport, opcode: u8, body: &[u8]) -> Result<(), FrameError> {
    let bytes = encode(opcode, body)?;
    transport.write(&bytes)?;
    Ok(())
}

/// Receive one reply frame from `transport` and return its body.
///
/// Bytes ahead of the sync byte are skipped, up to one maximum-size frame.
/// Every read is bounded by the transport timeout. A checksum fault drops
/// the frame; nothing is re-requested.
pub fn read_frame(transport: &mut dyn Transport) -> Result<Bytes, FrameError> {
    let mut skipped = 0usize;
    loop {
        let byte = transport.read(1)?;
        match byte.first() {
            Some(&SYNC) => break,
            Some(_) => {
                skipped += 1;
                if skipped > MAX_FRAME_LEN {
                    return Err(FrameError::InvalidFrame(format!(
                        "no sync byte within {MAX_FRAME_LEN} bytes"
                    )));
                }
            }
            None if skipped == 0 => return Err(FrameError::NoResponse),
            None => {
                return Err(FrameError::InvalidFrame(format!(
                    "{skipped} stray bytes and no sync byte"
                )))
            }
        }
    }
    if skipped > 0 {
        debug!("{}: skipped {} bytes ahead of frame", transport.port(), skipped);
    }

    let len = match transport.read(1)?.first() {
        Some(&RESERVED_CODE) => {
            return Err(FrameError::InvalidFrame("reserved length byte 0xff".into()))
        }
        Some(&len) => len,
        None => return Err(FrameError::Truncated { expected: FRAME_OVERHEAD, received: 1 }),
    };

    let wanted = usize::from(len) + 1;
    let mut rest = transport.read(wanted)?;
    if rest.len() < wanted {
        return Err(FrameError::Truncated {
            expected: wanted + 2,
            received: rest.len() + 2,
        });
    }

    let chk = rest[usize::from(len)];
    rest.truncate(usize::from(len));
    debug!("{}.read: {}", transport.port(), byte_debug_string(&rest));

    if let Err(e) = check(len, &rest, chk) {
        debug!("{}: checksum does not match message contents", transport.port());
        return Err(e);
    }
    Ok(rest)
}

/// Codec for reply frames on buffered byte streams
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let skip = src.iter().position(|&b| b == SYNC).unwrap_or(src.len());
        if skip > 0 {
            debug!("skipping {} bytes ahead of frame", skip);
            src.advance(skip);
        }
        if src.len() < 2 {
            return Ok(None);
        }

        let len = src[1];
        if len == RESERVED_CODE {
            src.advance(2);
            return Err(FrameError::InvalidFrame("reserved length byte 0xff".into()));
        }

        let total = usize::from(len) + FRAME_OVERHEAD;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(2);
        let chk = frame[usize::from(len)];
        frame.truncate(usize::from(len));
        let body = frame.freeze();
        check(len, &body, chk)?;
        Ok(Some(Frame { code: len, body }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        frame.write_to(dst);
        Ok(())
    }
}
