//! Simulated backend for development and tests.
//!
//! Follows the same credential and host identity rules as the SSH backend
//! (with a host key derived from the target address), then runs a tiny
//! canned shell: input is echoed, a handful of commands produce fixed
//! output, and `exit` closes the session from the remote side.

use super::credentials::Credentials;
use super::host_identity::HostIdentityPolicy;
use super::known_hosts::KnownHosts;
use super::{
    close_requested, ConnectionState, EventSink, FailureReason, LaunchRequest, ShellCommand,
    ShellConnector, ShellHandle,
};
use bastion_core::fingerprint;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const PROMPT: &str = "$ ";
pub const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";
pub const DEFAULT_READY_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct SimulatedSettings {
    pub key_path: Option<PathBuf>,
    pub known_hosts: Option<Arc<KnownHosts>>,
    /// When set, password logins must match it (key logins always pass).
    pub accepted_password: Option<String>,
    pub ready_delay: Duration,
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            key_path: None,
            known_hosts: None,
            accepted_password: None,
            ready_delay: DEFAULT_READY_DELAY,
        }
    }
}

pub struct SimulatedConnector {
    settings: Arc<SimulatedSettings>,
}

impl SimulatedConnector {
    pub fn new(settings: SimulatedSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

impl ShellConnector for SimulatedConnector {
    fn launch(&self, request: LaunchRequest, events: EventSink) -> ShellHandle {
        let (handle, commands) = ShellHandle::channel();
        let settings = self.settings.clone();
        tokio::spawn(run_session(settings, request, events, commands));
        handle
    }
}

/// Deterministic stand-in for a target's host key.
pub fn simulated_host_key(address: &str) -> Vec<u8> {
    format!("simulated-ed25519 {address}").into_bytes()
}

async fn run_session(
    settings: Arc<SimulatedSettings>,
    request: LaunchRequest,
    events: EventSink,
    mut commands: mpsc::UnboundedReceiver<ShellCommand>,
) {
    let session_id = events.session_id().to_string();

    let credentials =
        match Credentials::resolve(settings.key_path.as_deref(), request.password.as_deref()) {
            Ok(c) => c,
            Err(reason) => {
                events.fail(reason).await;
                return;
            }
        };

    let address = request.target.address();
    let host_key = simulated_host_key(&address);
    let policy = HostIdentityPolicy::new(
        address,
        request.accept_host_identity,
        settings.known_hosts.clone(),
    );

    events
        .transition(ConnectionState::AwaitingHostIdentityDecision)
        .await;
    if !policy.verify(&host_key).await {
        let fingerprint = policy
            .rejection()
            .unwrap_or_else(|| fingerprint(&host_key));
        events
            .fail(FailureReason::HostIdentityUnverified { fingerprint })
            .await;
        return;
    }

    events.transition(ConnectionState::Authenticating).await;
    tokio::select! {
        _ = tokio::time::sleep(settings.ready_delay) => {}
        _ = close_requested(&mut commands) => {
            events.transition(ConnectionState::Closed).await;
            return;
        }
    }

    if let Some(expected) = &settings.accepted_password {
        let key_login = credentials.key().is_some();
        if !key_login && credentials.password() != Some(expected.as_str()) {
            events.fail(FailureReason::AuthRejected).await;
            return;
        }
    }

    info!(session_id = %session_id, target = %request.target.id, "simulated shell ready");
    if !events.transition(ConnectionState::Ready).await {
        return;
    }

    let mut shell = SimulatedShell::new(request.target.name.clone(), request.cols, request.rows);
    let banner = format!("{}{PROMPT}", shell.banner());
    events.output(banner.into_bytes()).await;

    loop {
        match commands.recv().await {
            Some(ShellCommand::Input(data)) => {
                let reply = shell.feed(&data);
                if !events.output(reply.into_bytes()).await {
                    break;
                }
                if shell.exited() {
                    debug!(session_id = %session_id, "simulated shell exited");
                    break;
                }
            }
            Some(ShellCommand::Resize { cols, rows }) => shell.resize(cols, rows),
            Some(ShellCommand::Close) | None => break,
        }
    }

    events.transition(ConnectionState::Closing).await;
    events.transition(ConnectionState::Closed).await;
}

/// The canned shell itself, free of any I/O.
#[derive(Debug, Clone)]
pub struct SimulatedShell {
    name: String,
    cols: u16,
    rows: u16,
    line: String,
    after_cr: bool,
    exited: bool,
}

impl SimulatedShell {
    pub fn new(name: impl Into<String>, cols: u16, rows: u16) -> Self {
        Self {
            name: name.into(),
            cols,
            rows,
            line: String::new(),
            after_cr: false,
            exited: false,
        }
    }

    pub fn banner(&self) -> String {
        format!("Welcome to Simulated Terminal ({})\r\n", self.name)
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
    }

    pub fn exited(&self) -> bool {
        self.exited
    }

    /// Handle one input chunk. Characters are echoed and buffered until a
    /// line ends (`\r`, `\n` or `\r\n`), then the line runs and a fresh
    /// prompt follows. Backspace edits the pending line.
    pub fn feed(&mut self, input: &[u8]) -> String {
        let mut out = String::new();
        for ch in String::from_utf8_lossy(input).chars() {
            if self.exited {
                break;
            }
            match ch {
                '\n' if self.after_cr => self.after_cr = false,
                '\r' | '\n' => {
                    self.after_cr = ch == '\r';
                    out.push_str(if ch == '\r' { "\r\n" } else { "\n" });
                    let line = std::mem::take(&mut self.line);
                    self.run(line.trim(), &mut out);
                }
                '\x7f' | '\x08' => {
                    self.after_cr = false;
                    if self.line.pop().is_some() {
                        out.push_str("\x08 \x08");
                    }
                }
                _ => {
                    self.after_cr = false;
                    self.line.push(ch);
                    out.push(ch);
                }
            }
        }
        out
    }

    fn run(&mut self, line: &str, out: &mut String) {
        match line {
            "" => {}
            "ls" | "ls -la" | "ls -l" => out.push_str("file1.txt\nfile2.txt\nfolder1/\n"),
            "pwd" => out.push_str("/home/ubuntu\n"),
            "whoami" => out.push_str("ubuntu\n"),
            "uname" => out.push_str("Linux\n"),
            "uname -a" => out.push_str("Linux mock-container 5.10.0 #1 SMP x86_64 GNU/Linux\n"),
            "clear" => out.push_str(CLEAR_SCREEN),
            "stty size" => out.push_str(&format!("{} {}\n", self.rows, self.cols)),
            "exit" | "logout" => {
                self.exited = true;
                out.push_str("logout\n");
                return;
            }
            _ if line == "cd" || line.starts_with("cd ") => {}
            _ if line.starts_with("echo ") || line == "echo" => {
                out.push_str(line.strip_prefix("echo").unwrap_or("").trim_start());
                out.push('\n');
            }
            _ => out.push_str(&format!("Command not found: {line}\n")),
        }
        out.push_str(PROMPT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{SessionEvent, ShellEvent};
    use bastion_core::{AuthHint, Target};

    fn request(password: Option<&str>, accept: bool) -> LaunchRequest {
        LaunchRequest {
            target: Target {
                id: "ct-01".into(),
                name: "ct-01".into(),
                host: "192.168.1.10".into(),
                port: 22,
                username: "ubuntu".into(),
                auth: AuthHint::Any,
                status: None,
                os: None,
            },
            cols: 80,
            rows: 24,
            password: password.map(str::to_owned),
            accept_host_identity: accept,
        }
    }

    fn fast() -> SimulatedSettings {
        SimulatedSettings {
            ready_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    async fn next_transition(rx: &mut mpsc::Receiver<SessionEvent>) -> ConnectionState {
        loop {
            match rx.recv().await.expect("event stream ended").event {
                ShellEvent::Transition(state) => return state,
                ShellEvent::Output(_) => {}
            }
        }
    }

    async fn next_output(rx: &mut mpsc::Receiver<SessionEvent>) -> String {
        loop {
            match rx.recv().await.expect("event stream ended").event {
                ShellEvent::Output(bytes) => return String::from_utf8(bytes).unwrap(),
                ShellEvent::Transition(_) => {}
            }
        }
    }

    #[test]
    fn shell_echoes_and_answers() {
        let mut shell = SimulatedShell::new("ct-01", 80, 24);
        assert_eq!(shell.feed(b"pwd\n"), "pwd\n/home/ubuntu\n$ ");
        assert_eq!(shell.feed(b"ls\n"), "ls\nfile1.txt\nfile2.txt\nfolder1/\n$ ");
        assert_eq!(shell.feed(b"\n"), "\n$ ");
        assert_eq!(shell.feed(b"cd /tmp\n"), "cd /tmp\n$ ");
    }

    #[test]
    fn keystrokes_are_buffered_until_enter() {
        let mut shell = SimulatedShell::new("ct-01", 80, 24);
        assert_eq!(shell.feed(b"p"), "p");
        assert_eq!(shell.feed(b"w"), "w");
        assert_eq!(shell.feed(b"d"), "d");
        assert_eq!(shell.feed(b"\r"), "\r\n/home/ubuntu\n$ ");
    }

    #[test]
    fn crlf_runs_the_line_once() {
        let mut shell = SimulatedShell::new("ct-01", 80, 24);
        assert_eq!(shell.feed(b"whoami\r\n"), "whoami\r\nubuntu\n$ ");
        assert_eq!(shell.feed(b"\r\n"), "\r\n$ ");
    }

    #[test]
    fn backspace_edits_pending_line() {
        let mut shell = SimulatedShell::new("ct-01", 80, 24);
        assert_eq!(shell.feed(b"pwx\x7fd\r"), "pwx\x08 \x08d\r\n/home/ubuntu\n$ ");
        // nothing left to erase
        assert_eq!(shell.feed(b"\x7f"), "");
    }

    #[test]
    fn shell_unknown_command() {
        let mut shell = SimulatedShell::new("ct-01", 80, 24);
        assert_eq!(
            shell.feed(b"frobnicate --now\n"),
            "frobnicate --now\nCommand not found: frobnicate --now\n$ "
        );
    }

    #[test]
    fn shell_tracks_size() {
        let mut shell = SimulatedShell::new("ct-01", 80, 24);
        shell.resize(132, 50);
        assert_eq!(shell.feed(b"stty size\n"), "stty size\n50 132\n$ ");
    }

    #[test]
    fn shell_exit() {
        let mut shell = SimulatedShell::new("ct-01", 80, 24);
        assert_eq!(shell.feed(b"exit\n"), "exit\nlogout\n");
        assert!(shell.exited());
    }

    #[tokio::test]
    async fn unknown_host_identity_is_rejected_once() {
        let (tx, mut rx) = mpsc::channel(16);
        let connector = SimulatedConnector::new(fast());
        let _h = connector.launch(request(Some("pw"), false), EventSink::new("s1", tx));

        assert_eq!(
            next_transition(&mut rx).await,
            ConnectionState::AwaitingHostIdentityDecision
        );
        let expected = fingerprint(&simulated_host_key("192.168.1.10:22"));
        assert_eq!(
            next_transition(&mut rx).await,
            ConnectionState::Failed(FailureReason::HostIdentityUnverified {
                fingerprint: expected
            })
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn accepted_identity_reaches_ready_with_banner() {
        let (tx, mut rx) = mpsc::channel(16);
        let connector = SimulatedConnector::new(fast());
        let h = connector.launch(request(Some("pw"), true), EventSink::new("s1", tx));

        assert_eq!(
            next_transition(&mut rx).await,
            ConnectionState::AwaitingHostIdentityDecision
        );
        assert_eq!(next_transition(&mut rx).await, ConnectionState::Authenticating);
        assert_eq!(next_transition(&mut rx).await, ConnectionState::Ready);
        assert_eq!(
            next_output(&mut rx).await,
            "Welcome to Simulated Terminal (ct-01)\r\n$ "
        );

        h.write(b"whoami\n".to_vec());
        assert_eq!(next_output(&mut rx).await, "whoami\nubuntu\n$ ");

        h.close();
        assert_eq!(next_transition(&mut rx).await, ConnectionState::Closing);
        assert_eq!(next_transition(&mut rx).await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn no_credentials_is_auth_missing() {
        let (tx, mut rx) = mpsc::channel(16);
        let connector = SimulatedConnector::new(fast());
        let _h = connector.launch(request(None, true), EventSink::new("s1", tx));
        assert_eq!(
            next_transition(&mut rx).await,
            ConnectionState::Failed(FailureReason::AuthMissing)
        );
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let (tx, mut rx) = mpsc::channel(16);
        let connector = SimulatedConnector::new(SimulatedSettings {
            accepted_password: Some("right".into()),
            ..fast()
        });
        let _h = connector.launch(request(Some("wrong"), true), EventSink::new("s1", tx));
        loop {
            let state = next_transition(&mut rx).await;
            if state.is_terminal() {
                assert_eq!(state, ConnectionState::Failed(FailureReason::AuthRejected));
                break;
            }
        }
    }

    #[tokio::test]
    async fn exit_closes_from_remote_side() {
        let (tx, mut rx) = mpsc::channel(16);
        let connector = SimulatedConnector::new(fast());
        let h = connector.launch(request(Some("pw"), true), EventSink::new("s1", tx));
        while next_transition(&mut rx).await != ConnectionState::Ready {}
        next_output(&mut rx).await;

        h.write(b"exit\n".to_vec());
        assert_eq!(next_output(&mut rx).await, "exit\nlogout\n");
        assert_eq!(next_transition(&mut rx).await, ConnectionState::Closing);
        assert_eq!(next_transition(&mut rx).await, ConnectionState::Closed);
    }
}
