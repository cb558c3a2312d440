//! Trust-on-first-use decision for a presented host key.
//!
//! A key is accepted when the client set `acceptHostIdentity` (and is then
//! pinned if a trust store is configured) or when the store already pins the
//! same fingerprint. Anything else is rejected, and the first rejected
//! fingerprint is remembered so the failure can be reported exactly once
//! even if the transport checks the key again.

use super::known_hosts::{HostStatus, KnownHosts};
use bastion_core::{fingerprint, short_fingerprint, BastionError, BastionResult};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct HostIdentityPolicy {
    address: String,
    accept: bool,
    trust: Option<Arc<KnownHosts>>,
    rejected: Arc<OnceLock<String>>,
}

impl HostIdentityPolicy {
    pub fn new(
        address: impl Into<String>,
        accept: bool,
        trust: Option<Arc<KnownHosts>>,
    ) -> Self {
        Self {
            address: address.into(),
            accept,
            trust,
            rejected: Arc::new(OnceLock::new()),
        }
    }

    /// Decide on a raw host key blob. Trust store access runs on the
    /// blocking pool.
    pub async fn verify(&self, host_key: &[u8]) -> bool {
        let fp = fingerprint(host_key);

        if self.accept {
            info!(
                host = %self.address,
                fingerprint = short_fingerprint(&fp),
                "host identity accepted by client"
            );
            if let Some(store) = &self.trust {
                let (host, pin) = (self.address.clone(), fp.clone());
                if let Err(e) = with_store(store, move |kh| kh.add_host(&host, &pin)).await {
                    warn!(host = %self.address, error = %e, "failed to pin host identity");
                }
            }
            return true;
        }

        if let Some(store) = &self.trust {
            let (host, presented) = (self.address.clone(), fp.clone());
            match with_store(store, move |kh| kh.verify_host(&host, &presented)).await {
                Ok(HostStatus::Known) => {
                    debug!(host = %self.address, "host identity matches pinned fingerprint");
                    return true;
                }
                Ok(HostStatus::Changed { expected }) => {
                    warn!(
                        host = %self.address,
                        expected = short_fingerprint(&expected),
                        presented = short_fingerprint(&fp),
                        "HOST IDENTITY CHANGED"
                    );
                }
                Ok(HostStatus::Unknown) => {}
                Err(e) => {
                    warn!(host = %self.address, error = %e, "trust store unreadable");
                }
            }
        }

        if self.rejected.set(fp).is_ok() {
            info!(host = %self.address, "host identity not yet accepted");
        }
        false
    }

    /// Fingerprint of the first rejected key, if any.
    pub fn rejection(&self) -> Option<String> {
        self.rejected.get().cloned()
    }
}

async fn with_store<T, F>(store: &Arc<KnownHosts>, op: F) -> BastionResult<T>
where
    T: Send + 'static,
    F: FnOnce(&KnownHosts) -> BastionResult<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| BastionError::Other(format!("trust store task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_unknown_without_flag() {
        let policy = HostIdentityPolicy::new("web:22", false, None);
        assert!(!policy.verify(b"key-a").await);
        assert_eq!(policy.rejection(), Some(fingerprint(b"key-a")));
    }

    #[tokio::test]
    async fn accepts_with_flag() {
        let policy = HostIdentityPolicy::new("web:22", true, None);
        assert!(policy.verify(b"key-a").await);
        assert!(policy.rejection().is_none());
    }

    #[tokio::test]
    async fn repeated_check_keeps_first_rejection() {
        let policy = HostIdentityPolicy::new("web:22", false, None);
        let again = policy.clone();
        assert!(!policy.verify(b"key-a").await);
        assert!(!again.verify(b"key-b").await);
        assert_eq!(policy.rejection(), Some(fingerprint(b"key-a")));
    }

    #[tokio::test]
    async fn accepted_key_is_pinned_and_later_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KnownHosts::new(dir.path().join("known_hosts")));

        let first = HostIdentityPolicy::new("web:22", true, Some(store.clone()));
        assert!(first.verify(b"key-a").await);

        let second = HostIdentityPolicy::new("web:22", false, Some(store.clone()));
        assert!(second.verify(b"key-a").await);

        let changed = HostIdentityPolicy::new("web:22", false, Some(store));
        assert!(!changed.verify(b"key-b").await);
        assert_eq!(changed.rejection(), Some(fingerprint(b"key-b")));
    }

    #[tokio::test]
    async fn unreadable_store_rejects() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be read as a trust file
        let store = Arc::new(KnownHosts::new(dir.path()));
        let policy = HostIdentityPolicy::new("web:22", false, Some(store));
        assert!(!policy.verify(b"key-a").await);
        assert_eq!(policy.rejection(), Some(fingerprint(b"key-a")));
    }
}
