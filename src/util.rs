//! Byte helpers shared by the handshake and frame layers.
//!
//! Every multi-byte integer that crosses the wire is big-endian. These helpers
//! work on byte slices so nothing depends on the host integer layout.

/// Size of a 256-bit value (nonces, secrets, digests).
pub type H256 = [u8; 32];

/// Encodes `value` as a 2-byte big-endian prefix.
pub fn write_u16_be(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

/// Reads a 2-byte big-endian prefix. Returns `None` when fewer than 2 bytes exist.
pub fn read_u16_be(bytes: &[u8]) -> Option<u16> {
    match bytes {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Encodes the low 24 bits of `value` big-endian. Returns `None` if it does not fit.
pub fn write_u24_be(value: usize) -> Option<[u8; 3]> {
    if value > 0x00ff_ffff {
        return None;
    }
    Some([(value >> 16) as u8, (value >> 8) as u8, value as u8])
}

/// Reads a 3-byte big-endian length.
pub fn read_u24_be(bytes: &[u8]) -> Option<usize> {
    match bytes {
        [a, b, c, ..] => Some(((*a as usize) << 16) | ((*b as usize) << 8) | *c as usize),
        _ => None,
    }
}

/// XOR of two 32-byte values.
pub fn xor32(a: &H256, b: &H256) -> H256 {
    let mut out = [0u8; 32];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

/// Rounds `len` up to the next multiple of 16 (AES block size).
pub fn pad16(len: usize) -> usize {
    if len % 16 == 0 {
        len
    } else {
        len + 16 - len % 16
    }
}
