//! Target resolution: an optional HTTP inventory with a static fallback.

use async_trait::async_trait;
use bastion_core::messages::string_or_number;
use bastion_core::{AuthHint, BastionError, BastionResult, Target};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Maps target ids to connection parameters.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    /// Every target currently offered to clients.
    async fn list(&self) -> Vec<Target>;

    async fn resolve(&self, target_id: &str) -> BastionResult<Target> {
        self.list()
            .await
            .into_iter()
            .find(|t| t.id == target_id)
            .ok_or_else(|| BastionError::TargetNotFound(target_id.to_string()))
    }
}

/// Per-target values used when a record leaves them out.
#[derive(Debug, Clone)]
pub struct TargetDefaults {
    pub username: String,
    pub port: u16,
}

/// A target as written in config files or returned by the inventory.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, alias = "user")]
    pub username: Option<String>,
    #[serde(default)]
    pub auth: Option<AuthHint>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
}

impl TargetRecord {
    /// Fill gaps from `defaults`. Records without an address are unusable.
    pub fn into_target(self, defaults: &TargetDefaults) -> Option<Target> {
        let host = self.ip.or(self.host).filter(|h| !h.is_empty())?;
        Some(Target {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            host,
            port: self.port.unwrap_or(defaults.port),
            username: self.username.unwrap_or_else(|| defaults.username.clone()),
            auth: self.auth.unwrap_or_default(),
            status: self.status,
            os: self.os,
        })
    }
}

/// Inventory responses are either a bare list or `{ "targets": [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InventoryDocument {
    List(Vec<TargetRecord>),
    Wrapped { targets: Vec<TargetRecord> },
}

impl InventoryDocument {
    fn into_records(self) -> Vec<TargetRecord> {
        match self {
            InventoryDocument::List(records) => records,
            InventoryDocument::Wrapped { targets } => targets,
        }
    }
}

/// Turn records into targets, skipping unusable ones.
pub fn targets_from_records(records: Vec<TargetRecord>, defaults: &TargetDefaults) -> Vec<Target> {
    records
        .into_iter()
        .filter_map(|record| {
            let id = record.id.clone();
            let target = record.into_target(defaults);
            if target.is_none() {
                warn!(target = %id, "skipping target without host");
            }
            target
        })
        .collect()
}

/// The three containers offered when nothing else is configured.
pub fn builtin_targets(defaults: &TargetDefaults) -> Vec<Target> {
    (1..=3)
        .map(|n| Target {
            id: format!("ct-0{n}"),
            name: format!("Container {n}"),
            host: format!("192.168.1.{}", 9 + n),
            port: defaults.port,
            username: defaults.username.clone(),
            auth: AuthHint::Any,
            status: Some("running".into()),
            os: Some("Ubuntu 24.04".into()),
        })
        .collect()
}

/// HTTP inventory client.
pub struct HttpInventory {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpInventory {
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> BastionResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BastionError::Inventory(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    pub async fn fetch(&self) -> BastionResult<Vec<TargetRecord>> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BastionError::Inventory(e.to_string()))?;
        let document: InventoryDocument = response
            .json()
            .await
            .map_err(|e| BastionError::Inventory(format!("bad inventory response: {e}")))?;
        Ok(document.into_records())
    }
}

/// Queries the inventory when one is configured, otherwise (or when the
/// query fails) serves the static list.
pub struct InventoryResolver {
    remote: Option<HttpInventory>,
    fallback: Vec<Target>,
    defaults: TargetDefaults,
}

impl InventoryResolver {
    pub fn new(
        remote: Option<HttpInventory>,
        fallback: Vec<Target>,
        defaults: TargetDefaults,
    ) -> Self {
        Self {
            remote,
            fallback,
            defaults,
        }
    }
}

#[async_trait]
impl TargetResolver for InventoryResolver {
    async fn list(&self) -> Vec<Target> {
        let Some(remote) = &self.remote else {
            return self.fallback.clone();
        };
        match remote.fetch().await {
            Ok(records) => {
                let targets = targets_from_records(records, &self.defaults);
                debug!(count = targets.len(), "inventory answered");
                targets
            }
            Err(e) => {
                warn!(error = %e, "inventory query failed, using static targets");
                self.fallback.clone()
            }
        }
    }
}
