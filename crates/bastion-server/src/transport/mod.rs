//! Client-facing transports.
//!
//! The WebSocket route on the HTTP API and the optional standalone listener
//! both feed the same per-transport loop through [`FrameSocket`].

pub mod websocket;

use async_trait::async_trait;
use bastion_core::{BastionResult, ServerMessage};

/// Largest WebSocket message either listener buffers (4 MiB).
///
/// Messages between the codec's frame limit and this cap are answered with
/// `MALFORMED_MESSAGE` and the transport stays up. Anything larger cannot be
/// buffered, so the peer is closed with status 1009 (message too big).
pub const MAX_WS_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// A message-oriented client connection carrying JSON control frames.
#[async_trait]
pub trait FrameSocket: Send {
    /// Next text frame, or `None` once the peer closed.
    async fn recv_text(&mut self) -> BastionResult<Option<String>>;

    /// Send one control message.
    async fn send(&mut self, msg: &ServerMessage) -> BastionResult<()>;

    /// Close from our side.
    async fn close(&mut self);
}
