//! Per-transport protocol handler.
//!
//! Turns inbound client frames into registry/backend operations and backend
//! events into outbound frames. One instance per transport connection; the
//! transport loop feeds it frames and events in arrival order and writes
//! whatever it returns.

use crate::connection::{
    ConnectionState, EventSink, LaunchRequest, SessionEvent, ShellEvent, EVENT_QUEUE_CAPACITY,
};
use crate::server::Gateway;
use crate::session::TransportId;
use bastion_core::messages::OpenPayload;
use bastion_core::{
    decode_client, ClientMessage, ErrorCode, ErrorPayload, ServerMessage, Utf8Decoder,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct TransportHandler {
    transport: TransportId,
    gateway: Arc<Gateway>,
    events_tx: mpsc::Sender<SessionEvent>,
    // sessions opened here and not yet released, with their output decoders
    decoders: HashMap<String, Utf8Decoder>,
    alive: bool,
}

impl TransportHandler {
    /// Create a handler and the receiver its sessions report on.
    pub fn new(gateway: Arc<Gateway>) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let transport = gateway.registry().register_transport();
        let handler = Self {
            transport,
            gateway,
            events_tx,
            decoders: HashMap::new(),
            alive: true,
        };
        (handler, events_rx)
    }

    pub fn transport(&self) -> TransportId {
        self.transport
    }

    /// Handle one inbound text frame.
    pub async fn on_frame(&mut self, frame: &str) -> Vec<ServerMessage> {
        let replies = match decode_client(frame) {
            Ok(msg) => self.dispatch(msg).await,
            Err(e) => {
                debug!(transport = self.transport, error = %e, "malformed frame");
                vec![ServerMessage::error(ErrorPayload::new(
                    ErrorCode::MalformedMessage,
                    e.to_string(),
                ))]
            }
        };
        self.deliver(replies)
    }

    /// Handle one event reported by a session backend.
    pub async fn on_event(&mut self, event: SessionEvent) -> Vec<ServerMessage> {
        let SessionEvent { session_id, event } = event;
        let replies = match event {
            ShellEvent::Output(bytes) => match self.decoders.get_mut(&session_id) {
                Some(decoder) => {
                    let text = decoder.decode(&bytes);
                    if text.is_empty() {
                        Vec::new()
                    } else {
                        vec![ServerMessage::output(session_id, text)]
                    }
                }
                None => Vec::new(),
            },
            ShellEvent::Transition(state) => self.on_transition(session_id, state).await,
        };
        self.deliver(replies)
    }

    /// The transport went away: release everything it owned.
    pub async fn on_disconnect(&mut self) {
        self.alive = false;
        self.decoders.clear();
        let released = self
            .gateway
            .registry()
            .on_transport_closed(self.transport)
            .await;
        info!(
            transport = self.transport,
            sessions = released.len(),
            "transport closed"
        );
    }

    async fn dispatch(&mut self, msg: ClientMessage) -> Vec<ServerMessage> {
        match msg {
            ClientMessage::Open(payload) => self.open(payload).await,
            ClientMessage::Input(payload) => {
                if self.owns(&payload.session_id).await {
                    self.gateway
                        .registry()
                        .forward_input(&payload.session_id, payload.data.into_bytes())
                        .await;
                }
                Vec::new()
            }
            ClientMessage::Resize(payload) => {
                if payload.cols == 0 || payload.rows == 0 {
                    debug!(session_id = %payload.session_id, "ignoring empty resize");
                } else if self.owns(&payload.session_id).await {
                    self.gateway
                        .registry()
                        .forward_resize(&payload.session_id, payload.cols, payload.rows)
                        .await;
                }
                Vec::new()
            }
            ClientMessage::Close(payload) => {
                if self.owns(&payload.session_id).await {
                    info!(session_id = %payload.session_id, "close requested by client");
                    self.release(&payload.session_id).await
                } else {
                    Vec::new()
                }
            }
        }
    }

    async fn open(&mut self, payload: OpenPayload) -> Vec<ServerMessage> {
        if payload.cols == 0 || payload.rows == 0 {
            return vec![ServerMessage::error(ErrorPayload::new(
                ErrorCode::MalformedMessage,
                "cols and rows must be positive",
            ))];
        }

        let target = match self.gateway.resolver().resolve(&payload.target_id).await {
            Ok(t) => t,
            Err(e) => {
                info!(target = %payload.target_id, error = %e, "open for unknown target");
                return vec![ServerMessage::error(ErrorPayload::new(
                    ErrorCode::TargetNotFound,
                    "Target not found",
                ))];
            }
        };

        let registry = self.gateway.registry();
        let session_id = match registry
            .allocate(target.clone(), self.transport, payload.session_id.as_deref())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(target = %target.id, error = %e, "cannot open session");
                return vec![ServerMessage::error(ErrorPayload::new(
                    ErrorCode::SessionLimit,
                    e.to_string(),
                ))];
            }
        };

        info!(
            session_id = %session_id,
            target = %target.id,
            cols = payload.cols,
            rows = payload.rows,
            "opening session"
        );

        self.decoders.insert(session_id.clone(), Utf8Decoder::new());
        let events = EventSink::new(session_id.clone(), self.events_tx.clone());
        let handle = self.gateway.connector().launch(
            LaunchRequest {
                target,
                cols: payload.cols,
                rows: payload.rows,
                password: payload.password,
                accept_host_identity: payload.accept_host_identity,
            },
            events,
        );
        registry.attach_backend(&session_id, handle).await;
        Vec::new()
    }

    async fn on_transition(
        &mut self,
        session_id: String,
        state: ConnectionState,
    ) -> Vec<ServerMessage> {
        if !self.tracks(&session_id) {
            return Vec::new();
        }
        let registry = self.gateway.registry();

        match state {
            ConnectionState::Ready => {
                registry.set_state(&session_id, ConnectionState::Ready).await;
                vec![ServerMessage::ready(session_id)]
            }
            ConnectionState::Failed(reason) => {
                warn!(
                    session_id = %session_id,
                    code = ?reason.code(),
                    error = %reason,
                    "session failed"
                );
                let mut replies = vec![ServerMessage::error(reason.to_payload(&session_id))];
                registry
                    .set_state(&session_id, ConnectionState::Failed(reason))
                    .await;
                replies.extend(self.release(&session_id).await);
                replies
            }
            ConnectionState::Closed => {
                registry.set_state(&session_id, ConnectionState::Closed).await;
                self.release(&session_id).await
            }
            other => {
                registry.set_state(&session_id, other).await;
                Vec::new()
            }
        }
    }

    /// Tear a session down. Emits the final output flush and `close` only
    /// when this call performed the removal.
    async fn release(&mut self, session_id: &str) -> Vec<ServerMessage> {
        let tail = self
            .decoders
            .remove(session_id)
            .map(|mut d| d.finish())
            .unwrap_or_default();

        if !self.gateway.registry().release(session_id).await {
            return Vec::new();
        }

        let mut replies = Vec::with_capacity(2);
        if !tail.is_empty() {
            replies.push(ServerMessage::output(session_id, tail));
        }
        replies.push(ServerMessage::close(session_id));
        replies
    }

    /// Sessions opened here and not yet released.
    fn tracks(&self, session_id: &str) -> bool {
        self.decoders.contains_key(session_id)
    }

    /// A client request may only touch a live session this transport owns.
    async fn owns(&self, session_id: &str) -> bool {
        if !self.tracks(session_id) {
            return false;
        }
        self.gateway
            .registry()
            .lookup(session_id)
            .await
            .is_ok_and(|info| info.transport == self.transport)
    }

    fn deliver(&self, replies: Vec<ServerMessage>) -> Vec<ServerMessage> {
        if self.alive {
            replies
        } else {
            Vec::new()
        }
    }
}
