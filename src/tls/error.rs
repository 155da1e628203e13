//! TLS binding error types.

use thiserror::Error;

/// Errors raised while attaching a TLS binding or running a handshake.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Failed to load certificate.
    #[error("failed to load certificate from '{path}': {message}")]
    CertificateLoadError {
        /// The certificate path.
        path: String,
        /// Error message.
        message: String,
    },

    /// Failed to load private key.
    #[error("failed to load private key from '{path}': {message}")]
    PrivateKeyLoadError {
        /// The private key path.
        path: String,
        /// Error message.
        message: String,
    },

    /// Invalid certificate chain or key pair.
    #[error("invalid certificate chain: {message}")]
    InvalidCertificateChain {
        /// Error message.
        message: String,
    },

    /// A key named in the options is not in the vault.
    #[error("key '{name}' not found in vault '{vault}'")]
    MissingKey {
        /// Vault searched.
        vault: String,
        /// Key name.
        name: String,
    },

    /// A trust certificate named in the options is not in the vault.
    #[error("trust certificate '{name}' not found in vault '{vault}'")]
    MissingTrust {
        /// Vault searched.
        vault: String,
        /// Certificate name.
        name: String,
    },

    /// The binding names a vault that is not registered.
    #[error("vault '{0}' not found")]
    UnknownVault(String),

    /// TLS handshake failed.
    #[error("TLS handshake failed: {message}")]
    HandshakeError {
        /// Error message.
        message: String,
    },

    /// Configuration error.
    #[error("configuration error: {message}")]
    ConfigError {
        /// Error message.
        message: String,
    },

    /// rustls rejected the configuration or a record.
    #[error("rustls error: {0}")]
    Rustls(#[from] tokio_rustls::rustls::Error),
}

/// Result type alias for TLS operations.
pub type TlsResult<T> = Result<T, TlsError>;
