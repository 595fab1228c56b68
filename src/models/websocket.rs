//! WebSocket message models
//!
//! Represents WebSocket frames captured while relaying a MITM'd connection.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Maximum number of payload bytes rendered in a binary hex preview.
const HEX_PREVIEW_BYTES: usize = 256;

/// WebSocket frame opcode (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebSocketOpcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl WebSocketOpcode {
    /// Parse from the raw opcode nibble. Unrecognized opcodes yield `None`
    /// and are relayed without being recorded.
    pub fn from_u8(opcode: u8) -> Option<Self> {
        match opcode & 0x0F {
            0 => Some(WebSocketOpcode::Continuation),
            1 => Some(WebSocketOpcode::Text),
            2 => Some(WebSocketOpcode::Binary),
            8 => Some(WebSocketOpcode::Close),
            9 => Some(WebSocketOpcode::Ping),
            10 => Some(WebSocketOpcode::Pong),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WebSocketOpcode::Continuation => "CONTINUATION",
            WebSocketOpcode::Text => "TEXT",
            WebSocketOpcode::Binary => "BINARY",
            WebSocketOpcode::Close => "CLOSE",
            WebSocketOpcode::Ping => "PING",
            WebSocketOpcode::Pong => "PONG",
        }
    }
}

/// Direction of a relayed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDirection {
    ClientToServer,
    ServerToClient,
}

/// One captured WebSocket frame. The payload is unmasked and truncated to the
/// configured capture limit before it lands here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketMessage {
    pub id: String,
    pub direction: MessageDirection,
    pub opcode: WebSocketOpcode,
    pub payload: Vec<u8>,
    /// Length of the frame on the wire, which may exceed `payload.len()`.
    pub payload_length: u64,
    /// Millisecond timestamp of capture; used to merge both directions into
    /// one ordered list.
    pub timestamp: i64,
    pub is_final: bool,
}

impl WebSocketMessage {
    pub fn new(
        direction: MessageDirection,
        opcode: WebSocketOpcode,
        payload: Vec<u8>,
        payload_length: u64,
        is_final: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            opcode,
            payload,
            payload_length,
            timestamp: Utc::now().timestamp_millis(),
            is_final,
        }
    }

    /// Human-readable rendering of the payload: UTF-8 for the text family,
    /// a capped hex dump for binary frames.
    pub fn preview(&self) -> String {
        match self.opcode {
            WebSocketOpcode::Text | WebSocketOpcode::Continuation => {
                String::from_utf8_lossy(&self.payload).into_owned()
            }
            WebSocketOpcode::Binary => hex_preview(&self.payload),
            WebSocketOpcode::Close => {
                if self.payload.len() >= 2 {
                    let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
                    let reason = String::from_utf8_lossy(&self.payload[2..]);
                    format!("Close: {} {}", code, reason)
                } else {
                    "Close".to_string()
                }
            }
            WebSocketOpcode::Ping => "Ping".to_string(),
            WebSocketOpcode::Pong => "Pong".to_string(),
        }
    }
}

fn hex_preview(payload: &[u8]) -> String {
    let shown = &payload[..payload.len().min(HEX_PREVIEW_BYTES)];
    let mut out = String::with_capacity(shown.len() * 3);
    for (i, byte) in shown.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02x}", byte));
    }
    if payload.len() > HEX_PREVIEW_BYTES {
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_opcode_is_none() {
        assert_eq!(WebSocketOpcode::from_u8(3), None);
        assert_eq!(WebSocketOpcode::from_u8(0x81 & 0x0F), Some(WebSocketOpcode::Text));
    }

    #[test]
    fn binary_preview_is_capped_hex() {
        let msg = WebSocketMessage::new(
            MessageDirection::ServerToClient,
            WebSocketOpcode::Binary,
            vec![0xde; 300],
            300,
            true,
        );
        let preview = msg.preview();
        assert!(preview.starts_with("de de"));
        assert!(preview.ends_with('…'));
        assert_eq!(preview.matches("de").count(), 256);
    }

    #[test]
    fn close_preview_includes_code_and_reason() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        let msg = WebSocketMessage::new(
            MessageDirection::ClientToServer,
            WebSocketOpcode::Close,
            payload,
            5,
            true,
        );
        assert_eq!(msg.preview(), "Close: 1000 bye");
    }
}
