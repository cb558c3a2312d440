//! JSON framing for the control channel and incremental UTF-8 decoding of
//! terminal output.
//!
//! Wire format: one JSON object per transport text frame.

use crate::error::{BastionError, BastionResult};
use crate::messages::{ClientMessage, ServerMessage};

/// Largest inbound frame accepted from a client (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Parse an inbound client frame.
///
/// Any structural problem (invalid JSON, unknown `type`, missing or mistyped
/// fields) is reported as [`BastionError::InvalidMessage`].
pub fn decode_client(frame: &str) -> BastionResult<ClientMessage> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(BastionError::InvalidMessage(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            frame.len()
        )));
    }
    serde_json::from_str(frame).map_err(|e| BastionError::InvalidMessage(e.to_string()))
}

/// Serialize an outbound frame.
pub fn encode_server(msg: &ServerMessage) -> BastionResult<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Streaming UTF-8 decoder for terminal output.
///
/// A multi-byte sequence split across chunks is held back until the rest
/// arrives, so concatenating every decoded chunk yields the same text as
/// decoding the whole stream at once. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Decode the next chunk, carrying an incomplete trailing sequence.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut rest: &[u8] = &buf;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is still held back.
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}
