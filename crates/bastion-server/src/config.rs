//! Server configuration: TOML file + CLI overrides.

use crate::inventory::{builtin_targets, targets_from_records, TargetDefaults, TargetRecord};
use bastion_core::{BastionError, BastionResult, Target};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Which backend opens shells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    #[serde(alias = "real")]
    Ssh,
    #[serde(alias = "mock")]
    Simulated,
}

impl BackendMode {
    /// Real SSH when running inside an LXC container, simulated otherwise.
    pub fn detect() -> Self {
        if is_likely_lxc() {
            BackendMode::Ssh
        } else {
            BackendMode::Simulated
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendMode::Ssh => "ssh",
            BackendMode::Simulated => "simulated",
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendMode {
    type Err = BastionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ssh" | "real" => Ok(BackendMode::Ssh),
            "simulated" | "mock" => Ok(BackendMode::Simulated),
            other => Err(BastionError::Config(format!("unknown ssh mode: {other}"))),
        }
    }
}

fn is_likely_lxc() -> bool {
    let cgroup = std::fs::read_to_string("/proc/1/cgroup").unwrap_or_default();
    if cgroup.contains("lxc") || cgroup.contains("pve") {
        return true;
    }
    std::fs::read("/proc/1/environ")
        .map(|env| env.split(|b| *b == 0).any(|var| var == b"container=lxc"))
        .unwrap_or(false)
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub ssh: SshSection,
    #[serde(default)]
    pub inventory: InventorySection,
    #[serde(default)]
    pub targets: Vec<TargetRecord>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Extra standalone WebSocket listener. The HTTP port always serves the
    /// WebSocket route at `/`.
    #[serde(default)]
    pub ws_port: Option<u16>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_port: None,
            max_sessions: default_max_sessions(),
        }
    }
}

/// `[ssh]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SshSection {
    #[serde(default)]
    pub mode: Option<BackendMode>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_key_path")]
    pub key_path: String,
    /// Persisted trust store. Host identities are not pinned when unset.
    #[serde(default)]
    pub known_hosts: Option<String>,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,
    /// Simulated mode only: password that password logins must match.
    #[serde(default)]
    pub simulated_password: Option<String>,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            mode: None,
            user: default_user(),
            port: default_ssh_port(),
            key_path: default_key_path(),
            known_hosts: None,
            handshake_timeout: default_handshake_timeout(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
            simulated_password: None,
        }
    }
}

/// `[inventory]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct InventorySection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_inventory_timeout")]
    pub timeout_secs: u64,
}

impl Default for InventorySection {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout_secs: default_inventory_timeout(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_max_sessions() -> usize {
    100
}
fn default_user() -> String {
    "ubuntu".to_string()
}
fn default_ssh_port() -> u16 {
    22
}
fn default_key_path() -> String {
    "/keys/id_ed25519".to_string()
}
fn default_handshake_timeout() -> u64 {
    20
}
fn default_keepalive_interval() -> u64 {
    10
}
fn default_keepalive_max() -> usize {
    3
}
fn default_inventory_timeout() -> u64 {
    10
}

/// Values supplied on the command line (or via environment fallbacks).
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ws_port: Option<u16>,
    pub max_sessions: Option<usize>,
    pub mode: Option<BackendMode>,
    pub ssh_user: Option<String>,
    pub ssh_port: Option<u16>,
    pub key_path: Option<String>,
    pub known_hosts: Option<String>,
    pub inventory_url: Option<String>,
    pub inventory_token: Option<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ws_port: Option<u16>,
    pub max_sessions: usize,
    pub mode: BackendMode,
    pub target_defaults: TargetDefaults,
    pub key_path: PathBuf,
    pub known_hosts: Option<PathBuf>,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_max: usize,
    pub simulated_password: Option<String>,
    pub inventory_url: Option<String>,
    pub inventory_token: Option<String>,
    pub inventory_timeout: Duration,
    pub targets: Vec<Target>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> BastionResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::from_parts(file_config, cli)
    }

    /// Merge a parsed file with CLI overrides.
    pub fn from_parts(file: ConfigFile, cli: &CliOverrides) -> BastionResult<Self> {
        let port = cli.port.unwrap_or(file.server.port);
        let ws_port = cli.ws_port.or(file.server.ws_port);
        if ws_port == Some(port) {
            return Err(BastionError::Config(format!(
                "ws_port must differ from port ({port})"
            )));
        }

        let max_sessions = cli.max_sessions.unwrap_or(file.server.max_sessions);
        if max_sessions == 0 {
            return Err(BastionError::Config("max_sessions must be at least 1".into()));
        }

        let mode = cli
            .mode
            .or(file.ssh.mode)
            .unwrap_or_else(BackendMode::detect);

        let target_defaults = TargetDefaults {
            username: cli.ssh_user.clone().unwrap_or(file.ssh.user),
            port: cli.ssh_port.unwrap_or(file.ssh.port),
        };

        let targets = if file.targets.is_empty() {
            builtin_targets(&target_defaults)
        } else {
            targets_from_records(file.targets, &target_defaults)
        };

        let key_path = cli.key_path.clone().unwrap_or(file.ssh.key_path);
        let known_hosts = cli.known_hosts.clone().or(file.ssh.known_hosts);

        Ok(Self {
            host: cli.host.clone().unwrap_or(file.server.host),
            port,
            ws_port,
            max_sessions,
            mode,
            target_defaults,
            key_path: expand_tilde_str(&key_path),
            known_hosts: known_hosts.as_deref().map(expand_tilde_str),
            handshake_timeout: Duration::from_secs(file.ssh.handshake_timeout),
            keepalive_interval: Duration::from_secs(file.ssh.keepalive_interval),
            keepalive_max: file.ssh.keepalive_max,
            simulated_password: file.ssh.simulated_password,
            inventory_url: cli
                .inventory_url
                .clone()
                .or(file.inventory.url)
                .filter(|u| !u.is_empty()),
            inventory_token: cli.inventory_token.clone().or(file.inventory.token),
            inventory_timeout: Duration::from_secs(file.inventory.timeout_secs),
            targets,
        })
    }
}

fn parse(content: &str) -> BastionResult<ConfigFile> {
    toml::from_str(content).map_err(|e| BastionError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulated() -> CliOverrides {
        CliOverrides {
            mode: Some(BackendMode::Simulated),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_without_file() {
        let cfg = ServerConfig::from_parts(ConfigFile::default(), &simulated()).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.ws_port, None);
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.key_path, PathBuf::from("/keys/id_ed25519"));
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(20));
        assert_eq!(cfg.keepalive_interval, Duration::from_secs(10));
        assert_eq!(cfg.keepalive_max, 3);
        assert!(cfg.known_hosts.is_none());
        assert_eq!(cfg.targets.len(), 3);
        assert_eq!(cfg.targets[0].username, "ubuntu");
    }

    #[test]
    fn file_sections_parse() {
        let file = parse(
            r#"
            [server]
            host = "0.0.0.0"
            port = 8080
            ws_port = 8443
            max_sessions = 5

            [ssh]
            mode = "ssh"
            user = "admin"
            port = 2222
            known_hosts = "/var/lib/bastion/known_hosts"
            handshake_timeout = 5

            [inventory]
            url = "http://inventory.lan/targets"
            token = "abc"

            [[targets]]
            id = "web"
            host = "10.0.0.20"

            [[targets]]
            id = 7
            ip = "10.0.0.21"
            user = "root"
            port = 22
            "#,
        )
        .unwrap();
        let cfg = ServerConfig::from_parts(file, &CliOverrides::default()).unwrap();
        assert_eq!(cfg.mode, BackendMode::Ssh);
        assert_eq!((cfg.port, cfg.ws_port, cfg.max_sessions), (8080, Some(8443), 5));
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(5));
        assert_eq!(
            cfg.known_hosts,
            Some(PathBuf::from("/var/lib/bastion/known_hosts"))
        );
        assert_eq!(cfg.inventory_url.as_deref(), Some("http://inventory.lan/targets"));

        assert_eq!(cfg.targets.len(), 2);
        assert_eq!(cfg.targets[0].username, "admin");
        assert_eq!(cfg.targets[0].port, 2222);
        assert_eq!(cfg.targets[1].id, "7");
        assert_eq!(cfg.targets[1].username, "root");
        assert_eq!(cfg.targets[1].port, 22);
    }

    #[test]
    fn cli_overrides_file() {
        let file = parse("[server]\nport = 8080\n[ssh]\nuser = \"admin\"\n").unwrap();
        let cli = CliOverrides {
            port: Some(9000),
            ssh_user: Some("ops".into()),
            key_path: Some("/tmp/key".into()),
            ..simulated()
        };
        let cfg = ServerConfig::from_parts(file, &cli).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.ws_port, None);
        assert_eq!(cfg.target_defaults.username, "ops");
        assert_eq!(cfg.key_path, PathBuf::from("/tmp/key"));
        assert_eq!(cfg.mode, BackendMode::Simulated);
    }

    #[test]
    fn rejects_bad_values() {
        let same_port = CliOverrides {
            port: Some(4000),
            ws_port: Some(4000),
            ..simulated()
        };
        assert!(ServerConfig::from_parts(ConfigFile::default(), &same_port).is_err());

        let zero = CliOverrides {
            max_sessions: Some(0),
            ..simulated()
        };
        assert!(ServerConfig::from_parts(ConfigFile::default(), &zero).is_err());

        assert!(parse("[ssh]\nmode = \"telnet\"\n").is_err());
    }

    #[test]
    fn mode_names() {
        assert_eq!("mock".parse::<BackendMode>().unwrap(), BackendMode::Simulated);
        assert_eq!("real".parse::<BackendMode>().unwrap(), BackendMode::Ssh);
        assert_eq!("SSH".parse::<BackendMode>().unwrap(), BackendMode::Ssh);
        assert!("telnet".parse::<BackendMode>().is_err());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::load(Some(&dir.path().join("nope.toml")), &simulated()).unwrap();
        assert_eq!(cfg.port, 3000);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nmax_sessions = 2\n").unwrap();
        let cfg = ServerConfig::load(Some(&path), &simulated()).unwrap();
        assert_eq!(cfg.max_sessions, 2);
    }
}
