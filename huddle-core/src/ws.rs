//! WebSocket handshake and frame codec, RFC 6455.
//!
//! The decoder handles 7-bit, 16-bit and 64-bit payload lengths and
//! client-side masking; the encoder emits unmasked server frames with the
//! correct length form for any payload size.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::ProtocolError;

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Cap on a single frame's payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Sec-WebSocket-Accept value for a client's Sec-WebSocket-Key.
pub fn accept_key(sec_websocket_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sec_websocket_key.trim().as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Frame type, from the opcode nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl FrameKind {
    fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    fn opcode(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }
}

/// One decoded frame. Payload is already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Payload as text. Only meaningful for `FrameKind::Text`.
    pub fn text(&self) -> Result<&str, ProtocolError> {
        std::str::from_utf8(&self.payload).map_err(|_| ProtocolError::InvalidTextPayload)
    }
}

/// Decode one frame from the front of `buf`. Returns the frame and the
/// number of bytes consumed, or `None` when the buffer does not yet hold a
/// complete frame.
pub fn decode(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = buf[0] & 0x0F;
    let kind = FrameKind::from_opcode(opcode).ok_or(ProtocolError::UnknownOpcode(opcode))?;
    let masked = buf[1] & 0x80 != 0;
    let base_len = (buf[1] & 0x7F) as u64;

    let mut offset = 2usize;
    let payload_len = match base_len {
        126 => {
            if buf.len() < offset + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as u64;
            offset += 2;
            len
        }
        127 => {
            if buf.len() < offset + 8 {
                return Ok(None);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[offset..offset + 8]);
            offset += 8;
            u64::from_be_bytes(bytes)
        }
        n => n,
    };
    if payload_len > max_payload as u64 {
        return Err(ProtocolError::FrameTooLarge {
            len: payload_len,
            max: max_payload,
        });
    }
    let payload_len = payload_len as usize;

    let mask_key = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < offset + payload_len {
        return Ok(None);
    }
    let mut payload = buf[offset..offset + payload_len].to_vec();
    if let Some(key) = mask_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Ok(Some((
        Frame { fin, kind, payload },
        offset + payload_len,
    )))
}

/// Encode an unmasked FIN=1 text frame. Any payload size is emitted with
/// the correct length form, including the 8-byte extended form.
pub fn encode_text(text: &str) -> Vec<u8> {
    encode(FrameKind::Text, text.as_bytes())
}

/// Encode an unmasked FIN=1 frame of the given kind.
pub fn encode(kind: FrameKind, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 10);
    frame.push(0x80 | kind.opcode());
    match payload.len() {
        len if len < 126 => frame.push(len as u8),
        len if len <= u16::MAX as usize => {
            frame.push(126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            frame.push(127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(payload);
    frame
}
