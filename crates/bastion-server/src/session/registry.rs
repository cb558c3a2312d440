//! Session registry.
//!
//! Tracks every live session: its target snapshot, connection state, owning
//! transport and backend handle. Removal happens exactly once, so only one
//! caller ever observes a given session being released.

use crate::connection::{ConnectionState, ShellHandle};
use bastion_core::{BastionError, BastionResult, Target};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Identifies one client transport connection.
pub type TransportId = u64;

/// Longest client-proposed session id that is honoured.
const MAX_SESSION_ID_LEN: usize = 64;

pub struct Session {
    pub id: String,
    pub target: Target,
    pub state: ConnectionState,
    pub transport: TransportId,
    pub created_at: Instant,
    backend: Option<ShellHandle>,
}

/// Snapshot returned by lookups and listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub target_id: String,
    pub state: ConnectionState,
    pub transport: TransportId,
    pub age_secs: u64,
}

impl From<&Session> for SessionInfo {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            target_id: s.target.id.clone(),
            state: s.state.clone(),
            transport: s.transport,
            age_secs: s.created_at.elapsed().as_secs(),
        }
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    by_transport: HashMap<TransportId, HashSet<String>>,
}

impl Inner {
    fn remove(&mut self, session_id: &str) -> Option<Session> {
        let session = self.sessions.remove(session_id)?;
        if let Some(ids) = self.by_transport.get_mut(&session.transport) {
            ids.remove(session_id);
            if ids.is_empty() {
                self.by_transport.remove(&session.transport);
            }
        }
        Some(session)
    }
}

pub struct SessionRegistry {
    inner: RwLock<Inner>,
    max_sessions: usize,
    next_transport: AtomicU64,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_sessions,
            next_transport: AtomicU64::new(1),
        }
    }

    /// Hand out an id for a newly accepted transport.
    pub fn register_transport(&self) -> TransportId {
        self.next_transport.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a session in `Connecting` state.
    ///
    /// A client-proposed id is kept when it is well-formed and not live;
    /// otherwise a fresh random id is generated.
    pub async fn allocate(
        &self,
        target: Target,
        transport: TransportId,
        preferred: Option<&str>,
    ) -> BastionResult<String> {
        let mut inner = self.inner.write().await;
        if inner.sessions.len() >= self.max_sessions {
            return Err(BastionError::SessionLimit(self.max_sessions));
        }

        let session_id = match preferred {
            Some(id) if is_valid_session_id(id) && !inner.sessions.contains_key(id) => {
                id.to_string()
            }
            Some(id) => {
                debug!(proposed = %id, "proposed session id unusable, generating one");
                generate_unique_id(&inner.sessions)
            }
            None => generate_unique_id(&inner.sessions),
        };

        inner.sessions.insert(
            session_id.clone(),
            Session {
                id: session_id.clone(),
                target,
                state: ConnectionState::Connecting,
                transport,
                created_at: Instant::now(),
                backend: None,
            },
        );
        inner
            .by_transport
            .entry(transport)
            .or_default()
            .insert(session_id.clone());

        info!(session_id = %session_id, transport, "session allocated");
        Ok(session_id)
    }

    /// Attach the backend handle. Returns `false` (and closes the handle) if
    /// the session was released in the meantime.
    pub async fn attach_backend(&self, session_id: &str, handle: ShellHandle) -> bool {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(session_id) {
            Some(session) => {
                session.backend = Some(handle);
                true
            }
            None => {
                handle.close();
                false
            }
        }
    }

    /// Record a state change. Terminal states are sticky.
    pub async fn set_state(&self, session_id: &str, state: ConnectionState) -> bool {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(session_id) {
            Some(session) if !session.state.is_terminal() => {
                debug!(session_id, from = %session.state, to = %state, "state change");
                session.state = state;
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, session_id: &str) -> BastionResult<SessionInfo> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(session_id)
            .map(SessionInfo::from)
            .ok_or_else(|| BastionError::SessionNotFound(session_id.to_string()))
    }

    /// Forward keystrokes to a `Ready` session. Anything else is dropped.
    pub async fn forward_input(&self, session_id: &str, data: Vec<u8>) -> bool {
        let inner = self.inner.read().await;
        match ready_backend(&inner, session_id) {
            Some(backend) => backend.write(data),
            None => false,
        }
    }

    /// Forward a resize to a `Ready` session. Anything else is dropped.
    pub async fn forward_resize(&self, session_id: &str, cols: u16, rows: u16) -> bool {
        let inner = self.inner.read().await;
        match ready_backend(&inner, session_id) {
            Some(backend) => backend.resize(cols, rows),
            None => false,
        }
    }

    /// Remove a session and tell its backend to shut down.
    ///
    /// Returns `true` only for the call that actually removed it.
    pub async fn release(&self, session_id: &str) -> bool {
        let removed = self.inner.write().await.remove(session_id);
        match removed {
            Some(session) => {
                if let Some(backend) = &session.backend {
                    backend.close();
                }
                info!(
                    session_id,
                    target = %session.target.id,
                    state = %session.state,
                    age_secs = session.created_at.elapsed().as_secs(),
                    "session released"
                );
                true
            }
            None => false,
        }
    }

    /// Release every session owned by a transport that went away.
    pub async fn on_transport_closed(&self, transport: TransportId) -> Vec<String> {
        let removed: Vec<Session> = {
            let mut inner = self.inner.write().await;
            let ids = inner.by_transport.remove(&transport).unwrap_or_default();
            ids.iter().filter_map(|id| inner.remove(id)).collect()
        };

        for session in &removed {
            if let Some(backend) = &session.backend {
                backend.close();
            }
        }
        if !removed.is_empty() {
            info!(
                transport,
                count = removed.len(),
                "released sessions of closed transport"
            );
        }
        removed.into_iter().map(|s| s.id).collect()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.read().await;
        inner.sessions.values().map(SessionInfo::from).collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}

fn ready_backend<'a>(inner: &'a Inner, session_id: &str) -> Option<&'a ShellHandle> {
    let session = inner.sessions.get(session_id)?;
    if session.state != ConnectionState::Ready {
        return None;
    }
    session.backend.as_ref()
}

fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn generate_unique_id(live: &HashMap<String, Session>) -> String {
    loop {
        let id = generate_session_id();
        if !live.contains_key(&id) {
            return id;
        }
    }
}

/// Random session id (16 bytes, hex-encoded).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ShellCommand;
    use bastion_core::AuthHint;

    fn target(id: &str) -> Target {
        Target {
            id: id.into(),
            name: id.into(),
            host: "10.0.0.1".into(),
            port: 22,
            username: "ubuntu".into(),
            auth: AuthHint::Any,
            status: None,
            os: None,
        }
    }

    #[tokio::test]
    async fn allocate_generates_hex_ids() {
        let reg = SessionRegistry::new(10);
        let t = reg.register_transport();
        let a = reg.allocate(target("a"), t, None).await.unwrap();
        let b = reg.allocate(target("a"), t, None).await.unwrap();
        assert_eq!(a.len(), 32);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
        assert_eq!(reg.lookup(&a).await.unwrap().state, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn proposed_id_kept_unless_live_or_malformed() {
        let reg = SessionRegistry::new(10);
        let t = reg.register_transport();
        let first = reg.allocate(target("a"), t, Some("tab-1")).await.unwrap();
        assert_eq!(first, "tab-1");

        let clash = reg.allocate(target("a"), t, Some("tab-1")).await.unwrap();
        assert_ne!(clash, "tab-1");

        let weird = reg
            .allocate(target("a"), t, Some("../etc passwd"))
            .await
            .unwrap();
        assert_ne!(weird, "../etc passwd");
    }

    #[tokio::test]
    async fn limit_is_enforced() {
        let reg = SessionRegistry::new(1);
        let t = reg.register_transport();
        reg.allocate(target("a"), t, None).await.unwrap();
        let err = reg.allocate(target("a"), t, None).await.unwrap_err();
        assert!(matches!(err, BastionError::SessionLimit(1)));
    }

    #[tokio::test]
    async fn input_only_reaches_ready_sessions() {
        let reg = SessionRegistry::new(10);
        let t = reg.register_transport();
        let id = reg.allocate(target("a"), t, None).await.unwrap();
        let (handle, mut rx) = ShellHandle::channel();
        assert!(reg.attach_backend(&id, handle).await);

        assert!(!reg.forward_input(&id, b"early".to_vec()).await);
        assert!(!reg.forward_resize(&id, 100, 30).await);

        reg.set_state(&id, ConnectionState::Ready).await;
        assert!(reg.forward_input(&id, b"ls\n".to_vec()).await);
        assert!(reg.forward_resize(&id, 100, 30).await);
        assert_eq!(rx.recv().await, Some(ShellCommand::Input(b"ls\n".to_vec())));
        assert_eq!(
            rx.recv().await,
            Some(ShellCommand::Resize {
                cols: 100,
                rows: 30
            })
        );

        assert!(!reg.forward_input("nope", b"x".to_vec()).await);
    }

    #[tokio::test]
    async fn release_happens_once_and_closes_backend() {
        let reg = SessionRegistry::new(10);
        let t = reg.register_transport();
        let id = reg.allocate(target("a"), t, None).await.unwrap();
        let (handle, mut rx) = ShellHandle::channel();
        reg.attach_backend(&id, handle).await;

        assert!(reg.release(&id).await);
        assert!(!reg.release(&id).await);
        assert_eq!(rx.recv().await, Some(ShellCommand::Close));
        assert!(reg.lookup(&id).await.is_err());
        assert_eq!(reg.count().await, 0);
    }

    #[tokio::test]
    async fn attach_after_release_closes_handle() {
        let reg = SessionRegistry::new(10);
        let t = reg.register_transport();
        let id = reg.allocate(target("a"), t, None).await.unwrap();
        reg.release(&id).await;

        let (handle, mut rx) = ShellHandle::channel();
        assert!(!reg.attach_backend(&id, handle).await);
        assert_eq!(rx.recv().await, Some(ShellCommand::Close));
    }

    #[tokio::test]
    async fn terminal_state_is_sticky() {
        let reg = SessionRegistry::new(10);
        let t = reg.register_transport();
        let id = reg.allocate(target("a"), t, None).await.unwrap();
        assert!(reg.set_state(&id, ConnectionState::Closed).await);
        assert!(!reg.set_state(&id, ConnectionState::Ready).await);
        assert_eq!(reg.lookup(&id).await.unwrap().state, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn transport_close_releases_only_its_sessions() {
        let reg = SessionRegistry::new(10);
        let t1 = reg.register_transport();
        let t2 = reg.register_transport();
        let a = reg.allocate(target("a"), t1, None).await.unwrap();
        let b = reg.allocate(target("b"), t1, None).await.unwrap();
        let c = reg.allocate(target("c"), t2, None).await.unwrap();

        let mut released = reg.on_transport_closed(t1).await;
        released.sort();
        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(released, expected);

        assert_eq!(reg.count().await, 1);
        assert!(reg.lookup(&c).await.is_ok());
        assert!(!reg.release(&a).await);
        assert!(reg.on_transport_closed(t1).await.is_empty());
    }
}
