//! Standalone WebSocket listener using tokio-tungstenite.
//!
//! Each accepted connection carries JSON control frames as text messages.

use super::MAX_WS_MESSAGE_SIZE;
use async_trait::async_trait;
use bastion_core::{encode_server, BastionError, BastionResult, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> BastionResult<mpsc::Receiver<WebSocketConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| BastionError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr().unwrap_or(bind_addr);

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let mut config = WebSocketConfig::default();
                        config.max_message_size = Some(MAX_WS_MESSAGE_SIZE);
                        match tokio_tungstenite::accept_async_with_config(stream, Some(config))
                            .await
                        {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(rx)
}

/// Send one control message as a text frame.
pub async fn ws_send<S>(ws: &mut WebSocketStream<S>, msg: &ServerMessage) -> BastionResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = encode_server(msg)?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| BastionError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next control frame.
///
/// Returns `None` once the peer closed. Binary messages are decoded as
/// UTF-8, with invalid sequences replaced. A message over
/// [`MAX_WS_MESSAGE_SIZE`] closes the peer with status 1009.
pub async fn ws_recv_text<S>(ws: &mut WebSocketStream<S>) -> BastionResult<Option<String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
            Some(Ok(Message::Binary(data))) => {
                return Ok(Some(String::from_utf8_lossy(&data).into_owned()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(WsError::Capacity(e))) => {
                warn!(error = %e, "WebSocket message over size cap, closing");
                let frame = CloseFrame {
                    code: CloseCode::Size,
                    reason: "message too big".into(),
                };
                let _ = ws.close(Some(frame)).await;
                return Ok(None);
            }
            Some(Err(e)) => {
                return Err(BastionError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

#[async_trait]
impl<S> super::FrameSocket for WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv_text(&mut self) -> BastionResult<Option<String>> {
        ws_recv_text(self).await
    }

    async fn send(&mut self, msg: &ServerMessage) -> BastionResult<()> {
        ws_send(self, msg).await
    }

    async fn close(&mut self) {
        let _ = WebSocketStream::close(self, None).await;
    }
}
