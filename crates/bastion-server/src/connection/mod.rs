//! Per-session connection state machine and the backends that drive it.
//!
//! A backend (SSH or simulated) runs one task per session. It reports state
//! transitions and raw output through an [`EventSink`] and takes input,
//! resize and close requests from a [`ShellHandle`].
//!
//! ```text
//! Connecting -> AwaitingHostIdentityDecision -> Authenticating -> Ready -> Closing -> Closed
//!      \                  \                          \             \
//!       +------------------+--------------------------+-------------+--> Failed(reason)
//! ```

pub mod credentials;
pub mod host_identity;
pub mod known_hosts;
pub mod simulated;
pub mod ssh;

use bastion_core::{ErrorCode, ErrorPayload, Target};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Capacity of the per-transport event queue shared by its sessions.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Lifecycle state of one session's backend connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    AwaitingHostIdentityDecision,
    Authenticating,
    Ready,
    Closing,
    Closed,
    Failed(FailureReason),
}

impl ConnectionState {
    /// `Closed` and `Failed` admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingHostIdentityDecision => "awaiting_host_identity",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a connection ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("Missing SSH credentials: provide a password or configure an SSH key")]
    AuthMissing,

    #[error("Host identity not accepted")]
    HostIdentityUnverified { fingerprint: String },

    #[error("Authentication rejected")]
    AuthRejected,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Shell error: {0}")]
    ShellError(String),
}

impl FailureReason {
    pub fn code(&self) -> ErrorCode {
        match self {
            FailureReason::AuthMissing => ErrorCode::AuthMissing,
            FailureReason::HostIdentityUnverified { .. } => ErrorCode::HostIdentityUnverified,
            FailureReason::AuthRejected => ErrorCode::AuthRejected,
            FailureReason::NetworkError(_) => ErrorCode::NetworkError,
            FailureReason::ShellError(_) => ErrorCode::ShellError,
        }
    }

    /// Build the `error` frame payload for this failure.
    pub fn to_payload(&self, session_id: &str) -> ErrorPayload {
        let payload = ErrorPayload::new(self.code(), self.to_string()).with_session(session_id);
        match self {
            FailureReason::HostIdentityUnverified { fingerprint } => {
                payload.with_fingerprint(fingerprint.clone())
            }
            _ => payload,
        }
    }
}

/// Something a backend reports about its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Transition(ConnectionState),
    Output(Vec<u8>),
}

/// A [`ShellEvent`] tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session_id: String,
    pub event: ShellEvent,
}

/// Reporting side handed to a backend task.
///
/// Enforces that at most one terminal transition is delivered per session;
/// everything sent after it is dropped.
#[derive(Clone)]
pub struct EventSink {
    session_id: String,
    tx: mpsc::Sender<SessionEvent>,
    settled: Arc<AtomicBool>,
}

impl EventSink {
    pub fn new(session_id: impl Into<String>, tx: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            session_id: session_id.into(),
            tx,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether a terminal transition has already been reported.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Report a state transition. Returns `false` once nobody is listening
    /// or the session already reached a terminal state.
    pub async fn transition(&self, state: ConnectionState) -> bool {
        if state.is_terminal() {
            if self.settled.swap(true, Ordering::SeqCst) {
                return false;
            }
        } else if self.is_settled() {
            return false;
        }
        self.send(ShellEvent::Transition(state)).await
    }

    pub async fn fail(&self, reason: FailureReason) -> bool {
        self.transition(ConnectionState::Failed(reason)).await
    }

    /// Report remote output. Returns `false` once nobody is listening.
    pub async fn output(&self, data: Vec<u8>) -> bool {
        if self.is_settled() {
            return false;
        }
        if data.is_empty() {
            return true;
        }
        self.send(ShellEvent::Output(data)).await
    }

    async fn send(&self, event: ShellEvent) -> bool {
        self.tx
            .send(SessionEvent {
                session_id: self.session_id.clone(),
                event,
            })
            .await
            .is_ok()
    }
}

/// Requests from the gateway to a running backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Input(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Close,
}

/// Control side of a launched backend, owned by the registry.
#[derive(Debug, Clone)]
pub struct ShellHandle {
    commands: mpsc::UnboundedSender<ShellCommand>,
}

impl ShellHandle {
    pub fn new(commands: mpsc::UnboundedSender<ShellCommand>) -> Self {
        Self { commands }
    }

    /// Create a handle and the receiver its backend task reads from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ShellCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn write(&self, data: Vec<u8>) -> bool {
        self.commands.send(ShellCommand::Input(data)).is_ok()
    }

    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        self.commands.send(ShellCommand::Resize { cols, rows }).is_ok()
    }

    pub fn close(&self) -> bool {
        self.commands.send(ShellCommand::Close).is_ok()
    }
}

/// Everything a backend needs to open one shell.
#[derive(Clone)]
pub struct LaunchRequest {
    pub target: Target,
    pub cols: u16,
    pub rows: u16,
    pub password: Option<String>,
    pub accept_host_identity: bool,
}

impl fmt::Debug for LaunchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchRequest")
            .field("target", &self.target.id)
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("accept_host_identity", &self.accept_host_identity)
            .finish()
    }
}

/// Starts backend connections. Implementations spawn a task per session
/// and return immediately.
pub trait ShellConnector: Send + Sync {
    fn launch(&self, request: LaunchRequest, events: EventSink) -> ShellHandle;
}

/// Wait until the gateway asks the backend to stop (or drops the handle).
///
/// Used while a handshake is in flight, when input and resize requests are
/// not yet meaningful.
pub(crate) async fn close_requested(commands: &mut mpsc::UnboundedReceiver<ShellCommand>) {
    while let Some(cmd) = commands.recv().await {
        if cmd == ShellCommand::Close {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_first_terminal_transition_is_delivered() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = EventSink::new("s1", tx);

        assert!(sink.fail(FailureReason::AuthRejected).await);
        assert!(!sink.transition(ConnectionState::Closed).await);
        assert!(!sink.transition(ConnectionState::Ready).await);
        assert!(!sink.output(b"late".to_vec()).await);
        drop(sink);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.session_id, "s1");
        assert_eq!(
            first.event,
            ShellEvent::Transition(ConnectionState::Failed(FailureReason::AuthRejected))
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn clones_share_settlement() {
        let (tx, _rx) = mpsc::channel(8);
        let sink = EventSink::new("s1", tx);
        let other = sink.clone();
        assert!(sink.transition(ConnectionState::Closed).await);
        assert!(other.is_settled());
        assert!(!other.fail(FailureReason::AuthMissing).await);
    }

    #[test]
    fn failure_payload_codes() {
        let p = FailureReason::AuthMissing.to_payload("s1");
        assert_eq!(p.code, Some(ErrorCode::AuthMissing));
        assert_eq!(p.session_id.as_deref(), Some("s1"));
        assert!(p.fingerprint.is_none());

        let p = FailureReason::HostIdentityUnverified {
            fingerprint: "SHA256:xyz".into(),
        }
        .to_payload("s2");
        assert_eq!(p.code, Some(ErrorCode::HostIdentityUnverified));
        assert_eq!(p.fingerprint.as_deref(), Some("SHA256:xyz"));

        let p = FailureReason::NetworkError("connection refused".into()).to_payload("s3");
        assert_eq!(p.code, Some(ErrorCode::NetworkError));
        assert!(p.error.contains("connection refused"));
    }

    #[tokio::test]
    async fn close_requested_skips_other_commands() {
        let (handle, mut rx) = ShellHandle::channel();
        handle.write(b"ls".to_vec());
        handle.resize(80, 24);
        handle.close();
        close_requested(&mut rx).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_requested_returns_when_handle_dropped() {
        let (handle, mut rx) = ShellHandle::channel();
        drop(handle);
        close_requested(&mut rx).await;
    }
}
