//! kbridge wire protocol
//!
//! Every message between the client and the daemon is one frame:
//!
//! ```text
//! ┌──────────┬──────────────┬──────────────────────┐
//! │   Type   │    Length    │   Payload (UTF-8)    │
//! │ (1 byte) │  (4 bytes)   │  (variable length)   │
//! └──────────┴──────────────┴──────────────────────┘
//! ```
//!
//! The type is a signed byte, the length an unsigned little-endian integer.
//! There is no version field and no padding.
//!
//! `Failure` payloads carry a [`FailureReport`]: the error message, optionally
//! followed by structured traceback frames.

use crate::error::{BridgeError, Result};
use crate::kernel::traceback::TracebackFrame;
use tracing::debug;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 5;

/// Line separating a failure message from its encoded traceback frames
pub const TRACEBACK_MARKER: &str = "--- traceback ---";

/// Frame type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum MessageType {
    /// Code to execute (client → daemon)
    Request = 1,
    /// Execution output (daemon → client)
    Success = 2,
    /// Execution error (daemon → client)
    Failure = 3,
}

impl MessageType {
    pub fn as_i8(self) -> i8 {
        self as i8
    }
}

impl TryFrom<i8> for MessageType {
    type Error = BridgeError;

    fn try_from(tag: i8) -> Result<Self> {
        match tag {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Success),
            3 => Ok(MessageType::Failure),
            other => Err(BridgeError::Protocol(format!(
                "unknown message type {}",
                other
            ))),
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Payload as text; invalid UTF-8 is replaced rather than rejected
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Validate a payload length against the 32-bit length field
pub fn checked_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| BridgeError::Protocol(format!("payload too large: {} bytes", len)))
}

/// Encode a frame into the wire format
///
/// Format: [1-byte type][4-byte LE length][payload]
pub fn encode(kind: MessageType, payload: &[u8]) -> Result<Vec<u8>> {
    let len = checked_len(payload.len())?;

    let mut buffer = Vec::with_capacity(HEADER_LEN + payload.len());
    buffer.push(kind.as_i8() as u8);
    buffer.extend_from_slice(&len.to_le_bytes());
    buffer.extend_from_slice(payload);

    Ok(buffer)
}

/// Decode a frame header
///
/// Returns (type, payload length)
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(MessageType, u32)> {
    let kind = MessageType::try_from(header[0] as i8)?;
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    Ok((kind, len))
}

/// Decode one complete frame from a byte slice
///
/// The slice must hold exactly one frame; trailing or missing bytes are a
/// protocol violation.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    let header: &[u8; HEADER_LEN] = bytes
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| BridgeError::Protocol("truncated header".to_string()))?;
    let (kind, len) = decode_header(header)?;

    let body = &bytes[HEADER_LEN..];
    if body.len() != len as usize {
        return Err(BridgeError::Protocol(format!(
            "length field says {} bytes, frame carries {}",
            len,
            body.len()
        )));
    }

    Ok(Message::new(kind, body))
}

/// Error message plus traceback frames, as carried in a `Failure` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub message: String,
    pub frames: Vec<TracebackFrame>,
}

impl FailureReport {
    /// Render the payload: message first, then one JSON frame per line
    ///
    /// The marker is always written when the message itself contains it, so
    /// that decoding splits at the last marker.
    pub fn encode(&self) -> String {
        let marker = format!("\n{}", TRACEBACK_MARKER);
        if self.frames.is_empty() && !self.message.contains(&marker) {
            return self.message.clone();
        }

        let mut out = self.message.clone();
        out.push('\n');
        out.push_str(TRACEBACK_MARKER);
        for frame in &self.frames {
            // A frame holds only strings and an integer, so this cannot fail
            if let Ok(line) = serde_json::to_string(frame) {
                out.push('\n');
                out.push_str(&line);
            }
        }
        out
    }

    /// Split a payload back into message and frames
    ///
    /// Payloads without the marker are a bare message. Frame lines are
    /// single-line JSON, so the last marker is the real one. Frame lines that
    /// do not parse are skipped.
    pub fn decode(payload: &str) -> Self {
        let marker = format!("\n{}", TRACEBACK_MARKER);
        let Some((message, rest)) = payload.rsplit_once(&marker) else {
            return Self {
                message: payload.to_string(),
                frames: Vec::new(),
            };
        };

        let frames = rest
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<TracebackFrame>(line) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    debug!(error = %e, "skipping unparsable traceback frame line");
                    None
                }
            })
            .collect();

        Self {
            message: message.to_string(),
            frames,
        }
    }
}
