//! Host identity fingerprints.
//!
//! fingerprint = `SHA256:` + standard base64 (with `=` padding) of the
//! SHA-256 digest of the raw host key blob.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Prefix identifying the hash algorithm.
pub const FINGERPRINT_PREFIX: &str = "SHA256:";

/// Compute the fingerprint of a raw public host key blob.
pub fn fingerprint(host_key: &[u8]) -> String {
    let hash = Sha256::digest(host_key);
    format!("{FINGERPRINT_PREFIX}{}", STANDARD.encode(hash))
}

/// Short form for log lines: prefix plus the first 8 hash characters.
pub fn short_fingerprint(fp: &str) -> &str {
    let end = (FINGERPRINT_PREFIX.len() + 8).min(fp.len());
    fp.get(..end).unwrap_or(fp)
}
