//! TLS Binding
//!
//! This module terminates and originates TLS on streams. It provides:
//! - Vault-backed keys and trust anchors, loaded once at attach time
//! - SNI-based key selection with the first key as fallback
//! - Route-driven ALPN negotiation
//! - Mutual TLS with optional or required client certificates
//! - A handshake deadline per stream

mod alpn;
mod client;
mod config;
mod error;
mod server;
mod session;
mod vault;

pub use alpn::{select_alpn, AlpnSelection};
pub use client::{client_config, TlsClientBinding};
pub use config::{TlsMutual, TlsOptions};
pub use error::{TlsError, TlsResult};
pub use server::{server_config, TlsServerBinding, HANDSHAKE_TIMEOUT};
pub use session::TlsSession;
pub use vault::{root_store, CertificateBundle, FileVault, MemoryVault, Vault, VaultRegistry};
