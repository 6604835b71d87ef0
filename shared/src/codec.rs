//! Payload codec for the strip UART characteristic
//!
//! Outbound payloads are opaque bytes, written in a single characteristic
//! write, so they must fit into [`link::MAX_WRITE_LEN`]:
//! ```text
//! [ N bytes: ASCII command ][ '\n' ]
//! ```
//!
//! Inbound notifications are surfaced as (lossy) UTF-8 text.

use bytes::Bytes;
use thiserror::Error;

use crate::link;

/// Errors that can occur while preparing a payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Payload is empty")]
    EmptyPayload,

    #[error("Payload too large: {0} bytes (max: {})", link::MAX_WRITE_LEN)]
    PayloadTooLarge(usize),
}

/// Validate an outbound payload for a single characteristic write
pub fn encode(payload: impl Into<Bytes>) -> Result<Bytes, CodecError> {
    let payload = payload.into();

    if payload.is_empty() {
        return Err(CodecError::EmptyPayload);
    }

    if payload.len() > link::MAX_WRITE_LEN {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    Ok(payload)
}

/// Text of an inbound notification
pub fn decode_text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

/// Short human-readable form of a payload for log lines
pub fn describe(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_accepts_command() {
        let encoded = encode(Bytes::from_static(b"ON\n")).expect("encode failed");
        assert_eq!(&encoded[..], b"ON\n");
    }

    #[test]
    fn test_encode_rejects_empty() {
        assert_eq!(encode(Bytes::new()), Err(CodecError::EmptyPayload));
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let payload = vec![b'A'; link::MAX_WRITE_LEN + 1];
        assert_eq!(
            encode(payload),
            Err(CodecError::PayloadTooLarge(link::MAX_WRITE_LEN + 1))
        );
    }

    #[test]
    fn test_decode_text_is_lossy() {
        assert_eq!(decode_text(b"STATE:ON\n"), "STATE:ON\n");
        assert_eq!(decode_text(&[0x4f, 0xff, 0x4b]), "O\u{fffd}K");
    }

    #[test]
    fn test_describe_trims() {
        assert_eq!(describe(b"PING\n"), "PING");
    }
}
