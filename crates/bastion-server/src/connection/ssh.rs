//! SSH backend built on russh.
//!
//! One task per session: handshake (bounded by the handshake timeout), host
//! identity check, authentication, PTY + shell, then a pump between the
//! channel and the gateway's commands until either side closes.

use super::credentials::Credentials;
use super::host_identity::HostIdentityPolicy;
use super::known_hosts::KnownHosts;
use super::{
    close_requested, ConnectionState, EventSink, FailureReason, LaunchRequest, ShellCommand,
    ShellConnector, ShellHandle,
};
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::PublicKeyBase64;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const TERM: &str = "xterm-256color";

/// Settings shared by every SSH session.
#[derive(Clone)]
pub struct SshSettings {
    pub key_path: Option<PathBuf>,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_max: usize,
    pub known_hosts: Option<Arc<KnownHosts>>,
}

pub struct SshConnector {
    settings: Arc<SshSettings>,
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

impl ShellConnector for SshConnector {
    fn launch(&self, request: LaunchRequest, events: EventSink) -> ShellHandle {
        let (handle, commands) = ShellHandle::channel();
        let settings = self.settings.clone();
        tokio::spawn(run_session(settings, request, events, commands));
        handle
    }
}

struct ClientHandler {
    policy: HostIdentityPolicy,
    events: EventSink,
    announced: bool,
}

#[async_trait::async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        if !self.announced {
            self.announced = true;
            self.events
                .transition(ConnectionState::AwaitingHostIdentityDecision)
                .await;
        }
        Ok(self
            .policy
            .verify(&server_public_key.public_key_bytes())
            .await)
    }
}

struct Shell {
    handle: client::Handle<ClientHandler>,
    channel: russh::Channel<client::Msg>,
}

async fn run_session(
    settings: Arc<SshSettings>,
    request: LaunchRequest,
    events: EventSink,
    mut commands: mpsc::UnboundedReceiver<ShellCommand>,
) {
    let session_id = events.session_id().to_string();

    let credentials =
        match Credentials::resolve(settings.key_path.as_deref(), request.password.as_deref()) {
            Ok(c) => c,
            Err(reason) => {
                warn!(
                    session_id = %session_id,
                    target = %request.target.id,
                    "no usable credentials"
                );
                events.fail(reason).await;
                return;
            }
        };

    let policy = HostIdentityPolicy::new(
        request.target.address(),
        request.accept_host_identity,
        settings.known_hosts.clone(),
    );

    info!(
        session_id = %session_id,
        target = %request.target.id,
        addr = %request.target.address(),
        auth = credentials.method(),
        "connecting"
    );

    let handshake = tokio::time::timeout(
        settings.handshake_timeout,
        establish(&settings, &request, &credentials, policy, events.clone()),
    );

    let shell = tokio::select! {
        result = handshake => match result {
            Ok(Ok(shell)) => shell,
            Ok(Err(reason)) => {
                warn!(session_id = %session_id, error = %reason, "connection failed");
                events.fail(reason).await;
                return;
            }
            Err(_) => {
                let secs = settings.handshake_timeout.as_secs();
                warn!(session_id = %session_id, timeout_secs = secs, "handshake timed out");
                events
                    .fail(FailureReason::NetworkError(format!(
                        "handshake timed out after {secs}s"
                    )))
                    .await;
                return;
            }
        },
        _ = close_requested(&mut commands) => {
            debug!(session_id = %session_id, "closed during handshake");
            events.transition(ConnectionState::Closed).await;
            return;
        }
    };

    info!(session_id = %session_id, "shell ready");
    events.transition(ConnectionState::Ready).await;
    pump(shell, &events, commands).await;
}

async fn establish(
    settings: &SshSettings,
    request: &LaunchRequest,
    credentials: &Credentials,
    policy: HostIdentityPolicy,
    events: EventSink,
) -> Result<Shell, FailureReason> {
    let config = Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(settings.keepalive_interval),
        keepalive_max: settings.keepalive_max,
        ..Default::default()
    });

    let handler = ClientHandler {
        policy: policy.clone(),
        events: events.clone(),
        announced: false,
    };

    let target = &request.target;
    let addr = (target.host.as_str(), target.port);
    let mut handle = match client::connect(config, addr, handler).await {
        Ok(h) => h,
        Err(e) => {
            return Err(match policy.rejection() {
                Some(fingerprint) => FailureReason::HostIdentityUnverified { fingerprint },
                None => FailureReason::NetworkError(e.to_string()),
            });
        }
    };

    events.transition(ConnectionState::Authenticating).await;
    if !authenticate(&mut handle, &target.username, credentials).await? {
        return Err(FailureReason::AuthRejected);
    }
    debug!(session_id = %events.session_id(), "authenticated");

    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| FailureReason::ShellError(format!("failed to open channel: {e}")))?;
    channel
        .request_pty(
            false,
            TERM,
            u32::from(request.cols),
            u32::from(request.rows),
            0,
            0,
            &[],
        )
        .await
        .map_err(|e| FailureReason::ShellError(format!("pty request failed: {e}")))?;
    channel
        .request_shell(true)
        .await
        .map_err(|e| FailureReason::ShellError(format!("shell request failed: {e}")))?;

    Ok(Shell { handle, channel })
}

/// Key first (when configured), then password. `Ok(false)` means the server
/// refused every offered credential.
async fn authenticate(
    handle: &mut client::Handle<ClientHandler>,
    username: &str,
    credentials: &Credentials,
) -> Result<bool, FailureReason> {
    if let Some(path) = credentials.key() {
        match load_key(path).await {
            Ok(key) => {
                let accepted = handle
                    .authenticate_publickey(username, Arc::new(key))
                    .await
                    .map_err(|e| FailureReason::NetworkError(e.to_string()))?;
                if accepted {
                    return Ok(true);
                }
                debug!(username, "public key rejected");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not load private key");
            }
        }
    }

    if let Some(password) = credentials.password() {
        return handle
            .authenticate_password(username, password)
            .await
            .map_err(|e| FailureReason::NetworkError(e.to_string()));
    }

    Ok(false)
}

async fn load_key(path: &std::path::Path) -> Result<russh_keys::key::KeyPair, String> {
    let pem = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| e.to_string())?;
    russh_keys::decode_secret_key(&pem, None).map_err(|e| e.to_string())
}

async fn pump(
    shell: Shell,
    events: &EventSink,
    mut commands: mpsc::UnboundedReceiver<ShellCommand>,
) {
    let Shell {
        handle,
        mut channel,
    } = shell;
    let session_id = events.session_id();

    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if !events.output(data.to_vec()).await {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if !events.output(data.to_vec()).await {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(session_id, exit_status, "remote shell exited");
                }
                Some(ChannelMsg::Eof) => {
                    debug!(session_id, "remote eof");
                }
                Some(ChannelMsg::Close) | None => {
                    info!(session_id, "remote closed the channel");
                    break;
                }
                Some(_) => {}
            },
            cmd = commands.recv() => match cmd {
                Some(ShellCommand::Input(bytes)) => {
                    if let Err(e) = channel.data(&bytes[..]).await {
                        warn!(session_id, error = %e, "write to channel failed");
                        break;
                    }
                }
                Some(ShellCommand::Resize { cols, rows }) => {
                    if let Err(e) = channel
                        .window_change(u32::from(cols), u32::from(rows), 0, 0)
                        .await
                    {
                        warn!(session_id, error = %e, "window change failed");
                    }
                }
                Some(ShellCommand::Close) | None => {
                    debug!(session_id, "close requested");
                    break;
                }
            },
        }
    }

    events.transition(ConnectionState::Closing).await;
    let _ = channel.close().await;
    let _ = handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await;
    events.transition(ConnectionState::Closed).await;
}
