//! Credential selection for backend connections.
//!
//! The configured private key is used when the file exists; a non-empty
//! password supplied with `open` is tried alongside it (or on its own). With
//! neither, the connection fails before any network traffic.

use super::FailureReason;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Clone)]
pub struct Credentials {
    key: Option<PathBuf>,
    password: Option<String>,
}

impl Credentials {
    pub fn resolve(key_path: Option<&Path>, password: Option<&str>) -> Result<Self, FailureReason> {
        let key = key_path.filter(|p| p.is_file()).map(Path::to_path_buf);
        let password = password.filter(|p| !p.is_empty()).map(str::to_owned);
        if key.is_none() && password.is_none() {
            return Err(FailureReason::AuthMissing);
        }
        Ok(Self { key, password })
    }

    pub fn key(&self) -> Option<&Path> {
        self.key.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Label for log lines.
    pub fn method(&self) -> &'static str {
        match (&self.key, &self.password) {
            (Some(_), Some(_)) => "key+password",
            (Some(_), None) => "key",
            _ => "password",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.key)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
