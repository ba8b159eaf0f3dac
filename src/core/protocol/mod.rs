//! Device protocol
//!
//! Checksum-framed opcode/body messages exchanged with a device:
//! - XOR checksum over the code byte and body
//! - Framing, streaming receive and a `tokio_util` codec

pub mod checksum;
pub mod framing;

pub use checksum::{frame_checksum, xor_checksum};
pub use framing::{
    decode, decode_command, encode, read_frame, write_frame, Frame, FrameCodec, FrameError,
    MAX_BODY_LEN,
};

/// Opcode of the identity query every device answers with its logical ID
pub const IDENTITY_QUERY: u8 = 0x00;
