//! UTF-8 validation for text payloads and close reasons
//!
//! Validation is SIMD-accelerated via `simdutf8` on the platforms it
//! supports and falls back to the std validator elsewhere. Fragmented text
//! messages are validated once, on aggregation, so multi-byte codepoints may
//! straddle fragment boundaries freely.

/// Validate that the input is UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}
