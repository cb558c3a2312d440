//! Core server: owns the gateway and runs the HTTP listener, which also
//! upgrades WebSocket transports, plus an optional standalone WebSocket port.
//!
//! The [`Gateway`] bundles the session registry, target resolver and shell
//! connector. It is built once at startup and shared with every transport
//! and the HTTP API.

use crate::config::{BackendMode, ServerConfig};
use crate::connection::known_hosts::KnownHosts;
use crate::connection::simulated::{SimulatedConnector, SimulatedSettings, DEFAULT_READY_DELAY};
use crate::connection::ssh::{SshConnector, SshSettings};
use crate::connection::ShellConnector;
use crate::handler::TransportHandler;
use crate::http;
use crate::inventory::{HttpInventory, InventoryResolver, TargetResolver};
use crate::session::SessionRegistry;
use crate::transport::{websocket, FrameSocket};
use bastion_core::{BastionError, BastionResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::lookup_host;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Shared services behind every transport connection.
pub struct Gateway {
    registry: Arc<SessionRegistry>,
    resolver: Arc<dyn TargetResolver>,
    connector: Arc<dyn ShellConnector>,
    mode: BackendMode,
    started: Instant,
}

impl Gateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        resolver: Arc<dyn TargetResolver>,
        connector: Arc<dyn ShellConnector>,
        mode: BackendMode,
    ) -> Self {
        Self {
            registry,
            resolver,
            connector,
            mode,
            started: Instant::now(),
        }
    }

    /// Wire up registry, resolver and connector from configuration.
    pub fn from_config(config: &ServerConfig) -> BastionResult<Self> {
        let registry = Arc::new(SessionRegistry::new(config.max_sessions));

        let remote = match &config.inventory_url {
            Some(url) => {
                info!(url = %url, "using HTTP inventory");
                Some(HttpInventory::new(
                    url.clone(),
                    config.inventory_token.clone(),
                    config.inventory_timeout,
                )?)
            }
            None => None,
        };
        let resolver = Arc::new(InventoryResolver::new(
            remote,
            config.targets.clone(),
            config.target_defaults.clone(),
        ));

        let known_hosts = config.known_hosts.as_ref().map(|path| {
            let store = KnownHosts::new(path);
            info!(path = %store.path().display(), "persisting accepted host identities");
            Arc::new(store)
        });

        let key_path = Some(config.key_path.clone());
        if !config.key_path.is_file() {
            warn!(
                path = %config.key_path.display(),
                "SSH key not found, sessions will need a password"
            );
        }

        let connector: Arc<dyn ShellConnector> = match config.mode {
            BackendMode::Ssh => Arc::new(SshConnector::new(SshSettings {
                key_path,
                handshake_timeout: config.handshake_timeout,
                keepalive_interval: config.keepalive_interval,
                keepalive_max: config.keepalive_max,
                known_hosts,
            })),
            BackendMode::Simulated => Arc::new(SimulatedConnector::new(SimulatedSettings {
                key_path,
                known_hosts,
                accepted_password: config.simulated_password.clone(),
                ready_delay: DEFAULT_READY_DELAY,
            })),
        };

        Ok(Self::new(registry, resolver, connector, config.mode))
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &dyn TargetResolver {
        self.resolver.as_ref()
    }

    pub fn connector(&self) -> &dyn ShellConnector {
        self.connector.as_ref()
    }

    pub fn mode(&self) -> BackendMode {
        self.mode
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// The bastion server instance.
pub struct BastionServer {
    config: ServerConfig,
    gateway: Arc<Gateway>,
    shutdown_tx: broadcast::Sender<()>,
}

impl BastionServer {
    pub fn new(config: ServerConfig) -> BastionResult<Self> {
        let gateway = Arc::new(Gateway::from_config(&config)?);
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            gateway,
            shutdown_tx,
        })
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Tell every open transport to wind down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the listeners until they fail.
    pub async fn run(self: Arc<Self>) -> BastionResult<()> {
        let http_addr = resolve_bind(&self.config.host, self.config.port).await?;
        let api = http::serve(http_addr, self.gateway.clone(), self.shutdown_tx.clone());

        info!(
            http_port = self.config.port,
            ws_port = ?self.config.ws_port,
            max_sessions = self.gateway.registry().max_sessions(),
            mode = %self.gateway.mode(),
            "bastion-server ready"
        );

        let Some(ws_port) = self.config.ws_port else {
            return api.await;
        };
        let ws_addr = resolve_bind(&self.config.host, ws_port).await?;
        let mut ws_rx = websocket::start_listener(ws_addr).await?;

        let accept = async {
            while let Some(mut conn) = ws_rx.recv().await {
                let gateway = self.gateway.clone();
                let shutdown_rx = self.shutdown_tx.subscribe();
                tokio::spawn(async move {
                    let remote = conn.remote_addr;
                    info!(remote = %remote, "standalone WebSocket connected");
                    let served = serve_transport(gateway, &mut conn.ws_stream, shutdown_rx).await;
                    if let Err(e) = served {
                        warn!(remote = %remote, error = %e, "WebSocket connection error");
                    }
                });
            }
            info!("WebSocket listener closed");
        };

        tokio::select! {
            result = api => result,
            _ = accept => Ok(()),
        }
    }
}

/// Message loop for one client transport.
///
/// Runs until the peer closes, a send fails or shutdown is broadcast, then
/// releases every session the transport owned.
pub async fn serve_transport<S: FrameSocket>(
    gateway: Arc<Gateway>,
    socket: &mut S,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> BastionResult<()> {
    let (mut handler, mut events_rx) = TransportHandler::new(gateway);
    info!(transport = handler.transport(), "transport connected");

    let result = loop {
        let replies = tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(transport = handler.transport(), "shutdown, closing transport");
                socket.close().await;
                break Ok(());
            }
            frame = socket.recv_text() => match frame {
                Ok(Some(text)) => handler.on_frame(&text).await,
                Ok(None) => {
                    debug!(transport = handler.transport(), "peer closed");
                    break Ok(());
                }
                Err(e) => break Err(e),
            },
            Some(event) = events_rx.recv() => handler.on_event(event).await,
        };

        let mut send_failed = None;
        for msg in &replies {
            if let Err(e) = socket.send(msg).await {
                send_failed = Some(e);
                break;
            }
        }
        if let Some(e) = send_failed {
            break Err(e);
        }
    };

    handler.on_disconnect().await;
    result
}

async fn resolve_bind(host: &str, port: u16) -> BastionResult<SocketAddr> {
    lookup_host((host, port))
        .await
        .map_err(|e| BastionError::Config(format!("cannot resolve {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| BastionError::Config(format!("no address for {host}:{port}")))
}
