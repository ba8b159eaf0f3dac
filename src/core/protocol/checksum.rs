//! Frame checksum
//!
//! The checksum is a rolling XOR over the opcode/length byte and the body.
//! Two identical bit flips at the same bit position cancel out and go
//! undetected.

/// XOR of all bytes
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Checksum byte for a frame: `code XOR XOR(body)`
pub fn frame_checksum(code: u8, body: &[u8]) -> u8 {
    code ^ xor_checksum(body)
}

/// Verify a received checksum byte against the frame contents
pub fn verify(code: u8, body: &[u8], checksum: u8) -> bool {
    frame_checksum(code, body) == checksum
}
