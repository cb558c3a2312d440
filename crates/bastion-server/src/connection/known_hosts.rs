//! Persisted trust store of pinned host identities.
//!
//! Format: one `host:port fingerprint` pair per line, `#` comments allowed.
//! The file is written with mode 0600.

use bastion_core::{BastionError, BastionResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Result of checking a presented fingerprint against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostStatus {
    /// Pinned and matching.
    Known,
    /// Never pinned.
    Unknown,
    /// Pinned with a different fingerprint.
    Changed { expected: String },
}

pub struct KnownHosts {
    path: PathBuf,
    // serializes read-modify-write cycles between concurrent sessions
    write_lock: Mutex<()>,
}

impl KnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn verify_host(&self, host: &str, fingerprint: &str) -> BastionResult<HostStatus> {
        let entries = self.load_entries()?;
        match entries.iter().find(|(h, _)| h == host) {
            Some((_, fp)) if fp == fingerprint => Ok(HostStatus::Known),
            Some((_, fp)) => Ok(HostStatus::Changed {
                expected: fp.clone(),
            }),
            None => Ok(HostStatus::Unknown),
        }
    }

    /// Pin `fingerprint` for `host`, replacing any previous entry.
    pub fn add_host(&self, host: &str, fingerprint: &str) -> BastionResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| BastionError::Other("known_hosts lock poisoned".into()))?;
        let mut entries = self.load_entries()?;
        entries.retain(|(h, _)| h != host);
        entries.push((host.to_string(), fingerprint.to_string()));
        self.save_entries(&entries)
    }

    fn load_entries(&self) -> BastionResult<Vec<(String, String)>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)?;
        let entries = content
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return None;
                }
                let (host, fp) = line.split_once(char::is_whitespace)?;
                let fp = fp.trim();
                if fp.is_empty() {
                    return None;
                }
                Some((host.to_string(), fp.to_string()))
            })
            .collect();

        Ok(entries)
    }

    fn save_entries(&self, entries: &[(String, String)]) -> BastionResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
                }
            }
        }

        let mut content = String::new();
        for (host, fp) in entries {
            content.push_str(host);
            content.push(' ');
            content.push_str(fp);
            content.push('\n');
        }
        fs::write(&self.path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}
