//! Targets: remote hosts a shell can be opened on.

use serde::{Deserialize, Serialize};

/// Credential the target is expected to accept. Informational only; the
/// connection always tries the key first, then the password.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthHint {
    Key,
    Password,
    #[default]
    Any,
}

/// Immutable snapshot of a target, taken when a session is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub auth: AuthHint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

impl Target {
    /// `host:port` used for connecting and for trust-store keys.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str) -> Target {
        Target {
            id: "t".into(),
            name: "t".into(),
            host: host.into(),
            port: 22,
            username: "ubuntu".into(),
            auth: AuthHint::Any,
            status: None,
            os: None,
        }
    }

    #[test]
    fn address_v4_and_name() {
        assert_eq!(target("10.0.0.10").address(), "10.0.0.10:22");
        assert_eq!(target("web-01").address(), "web-01:22");
    }

    #[test]
    fn address_v6_is_bracketed() {
        assert_eq!(target("fe80::1").address(), "[fe80::1]:22");
    }
}
