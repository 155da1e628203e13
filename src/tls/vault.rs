//! Key and trust material for TLS bindings.
//!
//! Vaults are read when a binding attaches, never per stream. Anything
//! missing or malformed fails the attach of the binding that named it.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls_pemfile::{certs, private_key};
use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::RootCertStore;
use tracing::{debug, info};

use super::error::{TlsError, TlsResult};
use crate::config::{DataplaneConfig, KeyEntry, VaultEntry};

/// A certificate chain with its private key.
pub struct CertificateBundle {
    name: String,
    certificates: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    sni_names: Vec<String>,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("name", &self.name)
            .field("certificates_count", &self.certificates.len())
            .field("sni_names", &self.sni_names)
            .finish()
    }
}

impl Clone for CertificateBundle {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            certificates: self.certificates.clone(),
            private_key: self.private_key.clone_key(),
            sni_names: self.sni_names.clone(),
        }
    }
}

impl CertificateBundle {
    /// Load a bundle from the files named by a vault key entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate or key cannot be loaded.
    pub fn load(name: &str, entry: &KeyEntry) -> TlsResult<Self> {
        info!(name = %name, cert_path = %entry.cert_path.display(), "Loading certificate bundle");

        let mut certificates = load_certificates(&entry.cert_path)?;
        if let Some(chain_path) = &entry.chain_path {
            certificates.extend(load_certificates(chain_path)?);
        }
        if certificates.is_empty() {
            return Err(TlsError::CertificateLoadError {
                path: entry.cert_path.display().to_string(),
                message: "No certificates found in file".to_string(),
            });
        }

        let private_key = load_private_key(&entry.key_path)?;

        debug!(
            name = %name,
            cert_count = certificates.len(),
            sni_names = ?entry.sni_names,
            "Certificate bundle loaded"
        );

        Ok(Self {
            name: name.to_string(),
            certificates,
            private_key,
            sni_names: entry.sni_names.clone(),
        })
    }

    /// Build a bundle from PEM text.
    ///
    /// # Errors
    ///
    /// Returns an error if either PEM block is missing or malformed.
    pub fn from_pem(name: &str, cert_pem: &str, key_pem: &str) -> TlsResult<Self> {
        let certificates = certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::CertificateLoadError {
                path: name.to_string(),
                message: e.to_string(),
            })?;
        if certificates.is_empty() {
            return Err(TlsError::CertificateLoadError {
                path: name.to_string(),
                message: "No certificates found".to_string(),
            });
        }

        let private_key = private_key(&mut key_pem.as_bytes())
            .map_err(|e| TlsError::PrivateKeyLoadError {
                path: name.to_string(),
                message: e.to_string(),
            })?
            .ok_or_else(|| TlsError::PrivateKeyLoadError {
                path: name.to_string(),
                message: "No private key found".to_string(),
            })?;

        Ok(Self {
            name: name.to_string(),
            certificates,
            private_key,
            sni_names: Vec::new(),
        })
    }

    /// Present this bundle for the given server names.
    #[must_use]
    pub fn with_sni_names(mut self, names: &[&str]) -> Self {
        self.sni_names = names.iter().map(|n| (*n).to_string()).collect();
        self
    }

    /// Bundle name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Certificate chain, leaf first.
    #[must_use]
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    /// Private key.
    #[must_use]
    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }

    /// Server names this bundle is presented for.
    #[must_use]
    pub fn sni_names(&self) -> &[String] {
        &self.sni_names
    }

    /// Check if this bundle matches an SNI name.
    #[must_use]
    pub fn matches_sni(&self, sni: &str) -> bool {
        self.sni_names.iter().any(|pattern| sni_matches(pattern, sni))
    }

    /// Signing form used by rustls.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::InvalidCertificateChain`] if the key type is not
    /// supported.
    pub fn certified_key(&self) -> TlsResult<Arc<CertifiedKey>> {
        let signing_key =
            any_supported_type(&self.private_key).map_err(|e| TlsError::InvalidCertificateChain {
                message: format!("{}: {e}", self.name),
            })?;
        Ok(Arc::new(CertifiedKey::new(
            self.certificates.clone(),
            signing_key,
        )))
    }
}

/// `*.example.com` matches exactly one extra label.
fn sni_matches(pattern: &str, hostname: &str) -> bool {
    if pattern.eq_ignore_ascii_case(hostname) {
        return true;
    }
    let (Some(suffix), Some(dot)) = (pattern.strip_prefix("*."), hostname.find('.')) else {
        return false;
    };
    dot > 0 && hostname[dot + 1..].eq_ignore_ascii_case(suffix)
}

fn load_certificates(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| TlsError::CertificateLoadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);

    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateLoadError {
            path: path.display().to_string(),
            message: e.to_string(),
        })
}

fn load_private_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| TlsError::PrivateKeyLoadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);

    private_key(&mut reader)
        .map_err(|e| TlsError::PrivateKeyLoadError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| TlsError::PrivateKeyLoadError {
            path: path.display().to_string(),
            message: "No private key found in file".to_string(),
        })
}

/// Root store from the trust aliases of a binding, plus every trust
/// certificate in the vault when `include_all` is set.
///
/// # Errors
///
/// Returns an error for a missing alias or a certificate rustls rejects.
pub fn root_store(vault: &dyn Vault, aliases: &[String], include_all: bool) -> TlsResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for alias in aliases {
        for certificate in vault.trust(alias)? {
            roots.add(certificate)?;
        }
    }
    if include_all {
        for certificate in vault.trust_all()? {
            roots.add(certificate)?;
        }
    }
    Ok(roots)
}

/// Source of keys and trust anchors.
pub trait Vault: Send + Sync {
    /// Vault name.
    fn name(&self) -> &str;

    /// Key bundle stored under `alias`.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::MissingKey`] if there is none, or a load error.
    fn key(&self, alias: &str) -> TlsResult<CertificateBundle>;

    /// Trust certificates stored under `alias`.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::MissingTrust`] if there are none, or a load error.
    fn trust(&self, alias: &str) -> TlsResult<Vec<CertificateDer<'static>>>;

    /// Every trust certificate in the vault.
    ///
    /// # Errors
    ///
    /// Returns a load error for malformed material.
    fn trust_all(&self) -> TlsResult<Vec<CertificateDer<'static>>>;
}

/// Vault backed by PEM files named in configuration.
#[derive(Debug, Clone)]
pub struct FileVault {
    entry: VaultEntry,
}

impl FileVault {
    /// Create a vault over a configuration entry. Files are read on use.
    #[must_use]
    pub fn new(entry: VaultEntry) -> Self {
        Self { entry }
    }
}

impl Vault for FileVault {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn key(&self, alias: &str) -> TlsResult<CertificateBundle> {
        let entry = self.entry.keys.get(alias).ok_or_else(|| TlsError::MissingKey {
            vault: self.entry.name.clone(),
            name: alias.to_string(),
        })?;
        CertificateBundle::load(alias, entry)
    }

    fn trust(&self, alias: &str) -> TlsResult<Vec<CertificateDer<'static>>> {
        let path = self.entry.trust.get(alias).ok_or_else(|| TlsError::MissingTrust {
            vault: self.entry.name.clone(),
            name: alias.to_string(),
        })?;
        let certificates = load_certificates(path)?;
        if certificates.is_empty() {
            return Err(TlsError::MissingTrust {
                vault: self.entry.name.clone(),
                name: alias.to_string(),
            });
        }
        Ok(certificates)
    }

    fn trust_all(&self) -> TlsResult<Vec<CertificateDer<'static>>> {
        let mut all = Vec::new();
        for path in self.entry.trust.values() {
            all.extend(load_certificates(path)?);
        }
        Ok(all)
    }
}

/// Vault held in memory, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryVault {
    name: String,
    keys: HashMap<String, CertificateBundle>,
    trust: HashMap<String, Vec<CertificateDer<'static>>>,
}

impl MemoryVault {
    /// Create an empty vault.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Store a key bundle under `alias`.
    #[must_use]
    pub fn with_key(mut self, alias: &str, bundle: CertificateBundle) -> Self {
        self.keys.insert(alias.to_string(), bundle);
        self
    }

    /// Store trust certificates under `alias`.
    #[must_use]
    pub fn with_trust(mut self, alias: &str, certificates: Vec<CertificateDer<'static>>) -> Self {
        self.trust.insert(alias.to_string(), certificates);
        self
    }
}

impl Vault for MemoryVault {
    fn name(&self) -> &str {
        &self.name
    }

    fn key(&self, alias: &str) -> TlsResult<CertificateBundle> {
        self.keys
            .get(alias)
            .cloned()
            .ok_or_else(|| TlsError::MissingKey {
                vault: self.name.clone(),
                name: alias.to_string(),
            })
    }

    fn trust(&self, alias: &str) -> TlsResult<Vec<CertificateDer<'static>>> {
        self.trust
            .get(alias)
            .filter(|certificates| !certificates.is_empty())
            .cloned()
            .ok_or_else(|| TlsError::MissingTrust {
                vault: self.name.clone(),
                name: alias.to_string(),
            })
    }

    fn trust_all(&self) -> TlsResult<Vec<CertificateDer<'static>>> {
        Ok(self.trust.values().flatten().cloned().collect())
    }
}

/// Vaults by name.
#[derive(Clone, Default)]
pub struct VaultRegistry {
    vaults: HashMap<String, Arc<dyn Vault>>,
}

impl fmt::Debug for VaultRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultRegistry")
            .field("vaults", &self.vaults.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl VaultRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// File vaults for every vault in the configuration.
    #[must_use]
    pub fn from_config(config: &DataplaneConfig) -> Self {
        config
            .vaults
            .iter()
            .fold(Self::new(), |registry, entry| {
                registry.with_vault(Arc::new(FileVault::new(entry.clone())))
            })
    }

    /// Register a vault under its own name.
    #[must_use]
    pub fn with_vault(mut self, vault: Arc<dyn Vault>) -> Self {
        self.vaults.insert(vault.name().to_string(), vault);
        self
    }

    /// Look a vault up by name.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::UnknownVault`] if it is not registered.
    pub fn get(&self, name: &str) -> TlsResult<Arc<dyn Vault>> {
        self.vaults
            .get(name)
            .cloned()
            .ok_or_else(|| TlsError::UnknownVault(name.to_string()))
    }

    /// Number of vaults.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vaults.len()
    }

    /// Whether no vault is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }
}
