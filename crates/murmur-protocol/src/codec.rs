//! Codec for encoding and decoding murmur frames.
//!
//! Frames travel as WebSocket text messages holding one JSON object each.

use thiserror::Error;

use crate::frames::{ClientFrame, ServerFrame};

/// Default maximum accepted frame size (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Unknown `type`, missing required field, or invalid JSON.
    #[error("Malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Decode a client frame from a text message.
///
/// # Errors
///
/// Returns an error if the text is larger than `max_size` or does not match
/// any known frame variant.
pub fn decode(text: &str, max_size: usize) -> Result<ClientFrame, ProtocolError> {
    if text.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: max_size,
        });
    }

    serde_json::from_str(text).map_err(ProtocolError::Malformed)
}

/// Encode a server frame to a text message.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(frame: &ServerFrame) -> Result<String, ProtocolError> {
    serde_json::to_string(frame).map_err(ProtocolError::Encode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_frame() {
        let frame = decode(
            r#"{"type":"call_initiate","receiver_id":5,"call_type":"video"}"#,
            DEFAULT_MAX_FRAME_SIZE,
        )
        .unwrap();
        assert_eq!(frame.kind(), "call_initiate");
    }

    #[test]
    fn test_decode_unknown_type() {
        match decode(r#"{"type":"teleport","to":1}"#, DEFAULT_MAX_FRAME_SIZE) {
            Err(ProtocolError::Malformed(_)) => {}
            other => panic!("Expected Malformed error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_missing_field() {
        match decode(r#"{"type":"call_offer","call_id":1}"#, DEFAULT_MAX_FRAME_SIZE) {
            Err(ProtocolError::Malformed(_)) => {}
            other => panic!("Expected Malformed error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let content = "a".repeat(128);
        let raw = format!(r#"{{"type":"message","receiver_id":1,"content":"{}"}}"#, content);

        match decode(&raw, 64) {
            Err(ProtocolError::FrameTooLarge { max: 64, .. }) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_error_frame() {
        let text = encode(&ServerFrame::error(403, "not a member")).unwrap();
        assert_eq!(
            text,
            r#"{"type":"error","code":403,"message":"not a member"}"#
        );
    }
}
