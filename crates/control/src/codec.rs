//! Multi-part frame codec.
//!
//! A frame body is a JSON array of strings: `["progress","0.5"]`. The
//! transport delimits frames with a single `\n`; JSON string escaping keeps
//! raw newlines out of the body, so every part round-trips byte-for-byte,
//! empty parts included.

use crate::error::{CodecError, DecodingError};

/// Frame delimiter on the wire.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Default upper bound for a single inbound frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Encode `parts` into a frame body (without delimiter).
pub fn encode<S: AsRef<str>>(parts: &[S]) -> Result<Vec<u8>, CodecError> {
    if parts.is_empty() {
        return Err(CodecError::Encoding("frame has no parts".into()));
    }
    let refs: Vec<&str> = parts.iter().map(AsRef::as_ref).collect();
    serde_json::to_vec(&refs).map_err(|e| CodecError::Encoding(e.to_string()))
}

/// Decode a frame body into its parts.
pub fn decode(frame: &[u8]) -> Result<Vec<String>, DecodingError> {
    let parts: Vec<String> =
        serde_json::from_slice(frame).map_err(|e| DecodingError::Malformed(e.to_string()))?;
    if parts.is_empty() {
        return Err(DecodingError::Empty);
    }
    Ok(parts)
}

/// Like [`decode`], rejecting frames above `limit` bytes before parsing.
pub fn decode_bounded(frame: &[u8], limit: usize) -> Result<Vec<String>, DecodingError> {
    if frame.len() > limit {
        return Err(DecodingError::Oversized {
            size: frame.len(),
            limit,
        });
    }
    decode(frame)
}

/// Encode and append the delimiter, ready for the transport.
pub fn encode_line<S: AsRef<str>>(parts: &[S]) -> Result<Vec<u8>, CodecError> {
    let mut line = encode(parts)?;
    line.push(FRAME_DELIMITER);
    Ok(line)
}
