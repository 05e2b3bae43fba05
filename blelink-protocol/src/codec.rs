//! Byte value codec
//!
//! Stateless conversion between raw characteristic payloads and the hex /
//! UTF-8 text forms shown to (and typed by) users.

use crate::error::{Result, SessionError};

/// Encode bytes as lowercase base-16 text.
///
/// Deterministic, total length is always twice the input length.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Best-effort UTF-8 rendering of a byte payload.
///
/// Returns an empty string when the bytes are not valid UTF-8; this is a
/// presentation convenience, not a correctness-critical decode.
pub fn to_display_text(bytes: &[u8]) -> String {
    std::str::from_utf8(bytes).map(str::to_string).unwrap_or_default()
}

/// Decode base-16 text into bytes.
///
/// Empty input yields an empty byte sequence ("nothing to write"), not an
/// error. Odd-length or non-hex input fails with
/// [`SessionError::MalformedInput`].
pub fn from_hex(text: &str) -> Result<Vec<u8>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    hex::decode(text).map_err(|e| SessionError::MalformedInput(e.to_string()))
}
