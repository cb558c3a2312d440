//! bastion-server: web SSH bastion.
//!
//! Accepts WebSocket connections from the browser, opens SSH shells on
//! inventory targets on their behalf, and serves a small HTTP API listing
//! those targets.

mod config;
mod connection;
mod handler;
mod http;
mod inventory;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{BackendMode, CliOverrides, ServerConfig};
use server::BastionServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// bastion-server: web SSH bastion
#[derive(Parser, Debug)]
#[command(name = "bastion-server", version, about = "Web SSH bastion")]
struct Cli {
    /// HTTP API port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Extra standalone WebSocket port (the HTTP port always serves `/`)
    #[arg(long, env = "WS_PORT")]
    ws_port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.bastion/config.toml")]
    config: String,

    /// Backend: ssh or simulated (detected when unset)
    #[arg(long, env = "SSH_MODE")]
    mode: Option<BackendMode>,

    /// Default SSH username for targets that do not name one
    #[arg(long, env = "SSH_USER")]
    ssh_user: Option<String>,

    /// Default SSH port for targets that do not name one
    #[arg(long, env = "SSH_PORT")]
    ssh_port: Option<u16>,

    /// Private key used for SSH logins
    #[arg(long, env = "SSH_KEY_PATH")]
    key_path: Option<String>,

    /// Trust store for accepted host identities
    #[arg(long, env = "KNOWN_HOSTS")]
    known_hosts: Option<String>,

    /// Inventory endpoint returning the target list
    #[arg(long, env = "INVENTORY_URL")]
    inventory_url: Option<String>,

    /// Bearer token for the inventory endpoint
    #[arg(long, env = "INVENTORY_TOKEN", hide_env_values = true)]
    inventory_token: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            host: self.host.clone(),
            port: self.port,
            ws_port: self.ws_port,
            max_sessions: self.max_sessions,
            mode: self.mode,
            ssh_user: self.ssh_user.clone(),
            ssh_port: self.ssh_port,
            key_path: self.key_path.clone(),
            known_hosts: self.known_hosts.clone(),
            inventory_url: self.inventory_url.clone(),
            inventory_token: self.inventory_token.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting bastion-server");

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &cli.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        mode = %server_config.mode,
        host = %server_config.host,
        port = server_config.port,
        targets = server_config.targets.len(),
        "configuration loaded"
    );

    let server = match BastionServer::new(server_config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            server.shutdown();
        }
    }

    let open = server.gateway().registry().list().await;
    for session in &open {
        info!(
            session_id = %session.id,
            target = %session.target_id,
            state = ?session.state,
            transport = session.transport,
            age_secs = session.age_secs,
            "releasing session at shutdown"
        );
        server.gateway().registry().release(&session.id).await;
    }
    info!(released = open.len(), "bastion-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
