//! TLS binding options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Peer certificate policy of a server binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMutual {
    /// Do not ask for a client certificate.
    #[default]
    None,
    /// Ask for a client certificate but accept its absence.
    Requested,
    /// Require a client certificate; the handshake fails without one.
    Required,
}

/// Options of a `tls` binding, read from the binding's `options` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// Key aliases in the binding's vault. The first key is the fallback.
    pub keys: Vec<String>,

    /// Trust certificate aliases in the binding's vault.
    pub trust: Vec<String>,

    /// Server names. A server only selects ALPN for these; a client sends the
    /// first one.
    pub sni: Option<Vec<String>>,

    /// Application protocols. A server only selects among these; a client
    /// offers them.
    pub alpn: Option<Vec<String>>,

    /// Client certificate policy (server only).
    pub mutual: TlsMutual,

    /// Trust every certificate in the vault's trust section.
    pub trustcacerts: bool,

    /// Seconds a handshake may take before the stream is aborted.
    pub handshake_timeout_secs: u64,

    /// Window granted on each stream direction this binding reads.
    pub window: u32,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            trust: Vec::new(),
            sni: None,
            alpn: None,
            mutual: TlsMutual::None,
            trustcacerts: false,
            handshake_timeout_secs: 10,
            window: 65536,
        }
    }
}

impl TlsOptions {
    /// Handshake timeout as a duration.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Whether `server_name` may take part in ALPN selection.
    #[must_use]
    pub fn accepts_sni(&self, server_name: &str) -> bool {
        self.sni.as_ref().map_or(true, |names| {
            names.iter().any(|n| n.eq_ignore_ascii_case(server_name))
        })
    }

    /// Whether `protocol` may be selected or offered.
    #[must_use]
    pub fn accepts_alpn(&self, protocol: &str) -> bool {
        self.alpn
            .as_ref()
            .map_or(true, |protocols| protocols.iter().any(|p| p == protocol))
    }
}
