//! HTTP API: target listing, health and the WebSocket transport route.
//!
//! `GET /` upgrades to a WebSocket carrying the JSON control protocol, so the
//! browser page and its transport share one port.

use crate::server::{serve_transport, Gateway};
use crate::transport::{FrameSocket, MAX_WS_MESSAGE_SIZE};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use bastion_core::{encode_server, BastionError, BastionResult, ServerMessage};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ApiState {
    gateway: Arc<Gateway>,
    shutdown: broadcast::Sender<()>,
}

pub fn router(gateway: Arc<Gateway>, shutdown: broadcast::Sender<()>) -> Router {
    Router::new()
        .route("/", get(upgrade))
        .route("/api/targets", get(list_targets))
        .route("/api/health", get(health))
        .with_state(ApiState { gateway, shutdown })
}

pub async fn serve(
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown: broadcast::Sender<()>,
) -> BastionResult<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| BastionError::Transport(format!("HTTP bind failed: {e}")))?;
    info!(addr = %addr, "HTTP API listening");
    axum::serve(listener, router(gateway, shutdown).into_make_service())
        .await
        .map_err(|e| BastionError::Transport(format!("HTTP server failed: {e}")))
}

async fn upgrade(State(state): State<ApiState>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |mut socket| async move {
            let shutdown_rx = state.shutdown.subscribe();
            if let Err(e) = serve_transport(state.gateway, &mut socket, shutdown_rx).await {
                warn!(error = %e, "WebSocket connection error");
            }
        })
}

#[async_trait]
impl FrameSocket for WebSocket {
    async fn recv_text(&mut self) -> BastionResult<Option<String>> {
        loop {
            match self.recv().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(String::from_utf8_lossy(&data).into_owned()));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(BastionError::Transport(format!("WS recv failed: {e}")));
                }
            }
        }
    }

    async fn send(&mut self, msg: &ServerMessage) -> BastionResult<()> {
        let text = encode_server(msg)?;
        WebSocket::send(self, Message::Text(text.into()))
            .await
            .map_err(|e| BastionError::Transport(format!("WS send failed: {e}")))
    }

    async fn close(&mut self) {
        let _ = WebSocket::send(self, Message::Close(None)).await;
    }
}

async fn list_targets(State(state): State<ApiState>) -> Json<Value> {
    let gateway = &state.gateway;
    let targets = gateway.resolver().list().await;
    Json(json!({
        "mode": gateway.mode(),
        "targets": targets,
    }))
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    let gateway = &state.gateway;
    Json(json!({
        "status": "ok",
        "mode": gateway.mode(),
        "uptimeSecs": gateway.uptime().as_secs(),
        "sessions": gateway.registry().count().await,
    }))
}
