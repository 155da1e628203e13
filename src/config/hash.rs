//! Order-independent content hashing and stable binding ids.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::error::ConfigResult;
use super::types::DataplaneConfig;

/// SHA-256 digest identifying the content of a configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

fn digest_of<T: Serialize>(tag: &str, value: &T) -> ConfigResult<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(value)?);
    Ok(hasher.finalize().into())
}

/// Hash the content of a configuration so that reordering bindings or vaults
/// does not change the result.
///
/// Each entry is hashed on its own, the digests are sorted, and the sorted
/// list is hashed.
///
/// # Errors
///
/// Returns [`super::ConfigError::HashError`] if an entry cannot be encoded.
pub fn content_hash(config: &DataplaneConfig) -> ConfigResult<ContentHash> {
    let mut digests = Vec::with_capacity(1 + config.vaults.len() + config.bindings.len());
    digests.push(digest_of("engine", &config.engine)?);
    for vault in &config.vaults {
        digests.push(digest_of("vault", vault)?);
    }
    for binding in &config.bindings {
        digests.push(digest_of("binding", binding)?);
    }
    digests.sort_unstable();

    let mut hasher = Sha256::new();
    for digest in &digests {
        hasher.update(digest);
    }
    Ok(ContentHash(hasher.finalize().into()))
}

/// Stable id for a binding name within a namespace. Never 0.
#[must_use]
pub fn binding_id(namespace: &str, name: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(b":");
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes).max(1)
}
