//! Wire framing: `[37-byte correlation id][payload][0x04]`.
//!
//! Frames are laid back-to-back on the socket with no length prefix;
//! boundaries are discovered by scanning for the delimiter byte, so valid
//! payloads must never contain it. No escaping is performed: that is a
//! protocol constraint on producers, not something the transport enforces.

use std::fmt;

use crate::error::{Error, Result};

/// Fixed width of a correlation id on the wire.
pub const CORRELATION_ID_LEN: usize = 37;

/// End-of-transmission byte terminating every frame.
pub const FRAME_DELIMITER: u8 = 0x04;

/// Opaque token pairing a request with its eventual response.
///
/// Thirty-six characters of a lowercase hyphenated UUID followed by a
/// single `0x00` byte. The trailing byte is carried on the wire for
/// compatibility and never interpreted.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId([u8; CORRELATION_ID_LEN]);

impl CorrelationId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; CORRELATION_ID_LEN];
        let uuid = uuid::Uuid::new_v4();
        uuid.hyphenated()
            .encode_lower(&mut bytes[..CORRELATION_ID_LEN - 1]);
        bytes[CORRELATION_ID_LEN - 1] = 0;
        CorrelationId(bytes)
    }

    /// Build an id from exactly [`CORRELATION_ID_LEN`] raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CORRELATION_ID_LEN {
            return Err(Error::TruncatedFrame(bytes.len()));
        }
        let mut id = [0u8; CORRELATION_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(CorrelationId(id))
    }

    pub fn as_bytes(&self) -> &[u8; CORRELATION_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trimmed = match self.0.iter().position(|&b| b == 0) {
            Some(n) => &self.0[..n],
            None => &self.0[..],
        };
        write!(f, "{}", String::from_utf8_lossy(trimmed))
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self)
    }
}

/// Pack an id and payload into a complete wire frame.
///
/// Total length is `CORRELATION_ID_LEN + payload.len() + 1`.
pub fn encode_frame(id: &CorrelationId, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(CORRELATION_ID_LEN + payload.len() + 1);
    frame.extend_from_slice(id.as_bytes());
    frame.extend_from_slice(payload);
    frame.push(FRAME_DELIMITER);
    frame
}

/// Unpack a frame body (the bytes between delimiters, delimiter excluded).
///
/// The first [`CORRELATION_ID_LEN`] bytes are the id, the remainder is the
/// payload. Bodies shorter than the id are rejected rather than silently
/// misrouted.
pub fn decode_frame(body: &[u8]) -> Result<(CorrelationId, Vec<u8>)> {
    if body.len() < CORRELATION_ID_LEN {
        return Err(Error::TruncatedFrame(body.len()));
    }
    let id = CorrelationId::from_bytes(&body[..CORRELATION_ID_LEN])?;
    Ok((id, body[CORRELATION_ID_LEN..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_shape() {
        let id = CorrelationId::generate();
        let bytes = id.as_bytes();
        assert_eq!(bytes.len(), CORRELATION_ID_LEN);
        assert_eq!(bytes[CORRELATION_ID_LEN - 1], 0);
        // 36 visible characters: 8-4-4-4-12 hyphenated
        let text = id.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(text.matches('-').count(), 4);
    }

    #[test]
    fn test_generate_unique() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_round_trip() {
        let id = CorrelationId::generate();
        let payload = b"blah blah".to_vec();

        let frame = encode_frame(&id, &payload);
        assert_eq!(frame.len(), CORRELATION_ID_LEN + payload.len() + 1);
        assert_eq!(*frame.last().unwrap(), FRAME_DELIMITER);

        let (got_id, got_payload) = decode_frame(&frame[..frame.len() - 1]).unwrap();
        assert_eq!(got_id, id);
        assert_eq!(got_payload, payload);
    }

    #[test]
    fn test_round_trip_empty_payload() {
        let id = CorrelationId::generate();
        let frame = encode_frame(&id, b"");
        assert_eq!(frame.len(), CORRELATION_ID_LEN + 1);

        let (got_id, got_payload) = decode_frame(&frame[..frame.len() - 1]).unwrap();
        assert_eq!(got_id, id);
        assert!(got_payload.is_empty());
    }

    #[test]
    fn test_decode_too_short() {
        let err = decode_frame(b"way too short").unwrap_err();
        assert!(matches!(err, Error::TruncatedFrame(13)));
    }

    #[test]
    fn test_from_bytes_rejects_wrong_width() {
        assert!(CorrelationId::from_bytes(&[0u8; 36]).is_err());
        assert!(CorrelationId::from_bytes(&[0u8; 38]).is_err());
    }
}
