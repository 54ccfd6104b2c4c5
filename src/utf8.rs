//! UTF-8 validation for text messages and close reasons
//!
//! Backed by `simdutf8`, which picks a SIMD implementation for the host
//! and falls back to `std` elsewhere.

/// Validate that the input is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Validate the prefix of a fragmented text message.
///
/// A multi-byte sequence cut off at the end of `data` is accepted, since
/// the next fragment may complete it. Any other invalid sequence fails.
#[inline]
pub fn validate_utf8_incomplete(data: &[u8]) -> bool {
    match simdutf8::compat::from_utf8(data) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    }
}
