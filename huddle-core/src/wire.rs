//! Envelope framing for peer links: 4-byte big-endian length prefix +
//! JSON-encoded message.

use crate::protocol::PeerMessage;

const LEN_SIZE: usize = 4;

/// Cap on one envelope's payload. A peer claiming more is disconnected
/// instead of buffered.
pub const DEFAULT_MAX_ENVELOPE: usize = 16 * 1024 * 1024;

/// Encode a message into a single envelope: 4-byte big-endian length +
/// JSON payload.
pub fn encode_envelope(
    msg: &PeerMessage,
    max_len: usize,
) -> Result<Vec<u8>, EnvelopeEncodeError> {
    let payload = serde_json::to_vec(msg).map_err(EnvelopeEncodeError::Encode)?;
    if payload.len() > max_len {
        return Err(EnvelopeEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("envelope too large")]
    TooLarge,
}

/// Decode one envelope from the front of `bytes`. Returns the message and
/// the number of bytes consumed; `NeedMore` until a full envelope is
/// buffered.
pub fn decode_envelope(
    bytes: &[u8],
    max_len: usize,
) -> Result<(PeerMessage, usize), EnvelopeDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(EnvelopeDecodeError::NeedMore);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > max_len {
        return Err(EnvelopeDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(EnvelopeDecodeError::NeedMore);
    }
    let msg = serde_json::from_slice(&bytes[LEN_SIZE..LEN_SIZE + len])
        .map_err(EnvelopeDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("envelope too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatMessage, User};
    use uuid::Uuid;

    fn sample_message() -> PeerMessage {
        PeerMessage::ChatMessage(ChatMessage::new(
            "hello over the wire",
            User::new("alice"),
            Uuid::new_v4(),
        ))
    }

    #[test]
    fn round_trip() {
        let msg = sample_message();
        let envelope = encode_envelope(&msg, DEFAULT_MAX_ENVELOPE).unwrap();
        let (decoded, n) = decode_envelope(&envelope, DEFAULT_MAX_ENVELOPE).unwrap();
        assert_eq!(n, envelope.len());
        match decoded {
            PeerMessage::ChatMessage(m) => {
                assert_eq!(m.content, "hello over the wire");
                assert_eq!(m.sender.username, "alice");
            }
            other => panic!("expected ChatMessage, got {other:?}"),
        }
    }

    // Feeding the envelope one byte at a time must produce exactly one
    // decoded message, with NeedMore on every proper prefix.
    #[test]
    fn byte_at_a_time_single_delivery() {
        let envelope = encode_envelope(&sample_message(), DEFAULT_MAX_ENVELOPE).unwrap();
        let mut buf = Vec::new();
        let mut delivered = 0;
        for &b in &envelope {
            buf.push(b);
            match decode_envelope(&buf, DEFAULT_MAX_ENVELOPE) {
                Ok((_, n)) => {
                    delivered += 1;
                    assert_eq!(n, envelope.len());
                    buf.drain(..n);
                }
                Err(EnvelopeDecodeError::NeedMore) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(delivered, 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_length_claim_rejected() {
        let mut bytes = (DEFAULT_MAX_ENVELOPE as u32 + 1).to_be_bytes().to_vec();
        bytes.extend_from_slice(b"whatever");
        assert!(matches!(
            decode_envelope(&bytes, DEFAULT_MAX_ENVELOPE),
            Err(EnvelopeDecodeError::TooLarge)
        ));
    }

    #[test]
    fn encode_respects_cap() {
        let msg = PeerMessage::ChatMessage(ChatMessage::new(
            &"x".repeat(1024),
            User::new("bob"),
            Uuid::new_v4(),
        ));
        assert!(matches!(
            encode_envelope(&msg, 16),
            Err(EnvelopeEncodeError::TooLarge)
        ));
    }

    #[test]
    fn two_envelopes_back_to_back() {
        let a = encode_envelope(&PeerMessage::Ping, DEFAULT_MAX_ENVELOPE).unwrap();
        let b = encode_envelope(&PeerMessage::Pong, DEFAULT_MAX_ENVELOPE).unwrap();
        let mut buf = a.clone();
        buf.extend_from_slice(&b);
        let (m1, n1) = decode_envelope(&buf, DEFAULT_MAX_ENVELOPE).unwrap();
        let (m2, n2) = decode_envelope(&buf[n1..], DEFAULT_MAX_ENVELOPE).unwrap();
        assert!(matches!(m1, PeerMessage::Ping));
        assert!(matches!(m2, PeerMessage::Pong));
        assert_eq!(n1 + n2, buf.len());
    }

    #[test]
    fn malformed_payload_rejected() {
        let mut bytes = 4u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"}{!(");
        assert!(matches!(
            decode_envelope(&bytes, DEFAULT_MAX_ENVELOPE),
            Err(EnvelopeDecodeError::Decode(_))
        ));
    }
}
