//! Explicit-width little-endian integer codec.
//!
//! Unlike LEB-style varints the width is not embedded in the payload: the
//! caller stores it out of band (frame head bits, record head bits) and both
//! sides agree on `k` bytes, `k` in `1..=8`.

/// Minimum number of bytes able to represent `value`, always at least 1.
pub const fn size(value: u64) -> usize {
    match value {
        0 => 1,
        v => 8 - (v.leading_zeros() as usize / 8),
    }
}

/// Like [`size`] but returns 0 when `value` is zero.
///
/// Zero-width fields are elided on the wire; a zero width always decodes
/// back to the value 0.
pub const fn zsize(value: u64) -> usize {
    if value == 0 {
        0
    } else {
        size(value)
    }
}

/// Write the low `width` bytes of `value` into `buf` in little-endian order.
///
/// # Panics
///
/// Panics if `buf` is shorter than `width` or `width > 8`.
pub fn encode_into(buf: &mut [u8], width: usize, value: u64) {
    let bytes = value.to_le_bytes();
    buf[..width].copy_from_slice(&bytes[..width]);
}

/// Read a `width`-byte little-endian integer from the front of `buf`.
///
/// A zero width yields 0 without touching the buffer.
///
/// # Panics
///
/// Panics if `buf` is shorter than `width` or `width > 8`.
pub fn decode(buf: &[u8], width: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..width].copy_from_slice(&buf[..width]);
    u64::from_le_bytes(bytes)
}

/// [`decode`] narrowed to u32 fields (frame lengths, record lengths).
pub fn decode_u32(buf: &[u8], width: usize) -> u32 {
    debug_assert!(width <= 4);
    decode(buf, width) as u32
}

/// Minimum number of bytes able to represent a u32 `value`, at least 1.
pub const fn size_u32(value: u32) -> usize {
    size(value as u64)
}

/// Like [`size_u32`] but 0 for a zero value.
pub const fn zsize_u32(value: u32) -> usize {
    zsize(value as u64)
}
