//! WebSocket payload masking
//!
//! The masking key is kept as four separate bytes and applied by index,
//! so the same routine masks and unmasks.

/// XOR `data` in place with the repeating 4-byte `key`.
///
/// Byte `i` is combined with `key[i % 4]`, where `key[0]` is the first key
/// byte received on the wire.
#[inline]
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}
