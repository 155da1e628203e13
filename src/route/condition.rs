//! Route conditions over hostname, protocol name and port.

use super::error::RouteResult;
use super::pattern::{matches_optional, Pattern};
use super::ports::PortSet;
use crate::config::ConditionConfig;

/// A single matchable predicate. Every absent constraint matches anything,
/// so a condition with no constraints matches unconditionally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Condition {
    authority: Option<Pattern>,
    alpn: Option<Pattern>,
    ports: Option<PortSet>,
}

impl Condition {
    /// A condition with no constraints.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Constrain the hostname.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern does not compile.
    pub fn with_authority(mut self, pattern: &str) -> RouteResult<Self> {
        self.authority = Some(Pattern::hostname(pattern)?);
        Ok(self)
    }

    /// Constrain the protocol name.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern does not compile.
    pub fn with_alpn(mut self, pattern: &str) -> RouteResult<Self> {
        self.alpn = Some(Pattern::new(pattern)?);
        Ok(self)
    }

    /// Constrain the port.
    #[must_use]
    pub fn with_ports(mut self, ports: PortSet) -> Self {
        self.ports = Some(ports);
        self
    }

    /// Build from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid pattern or port range.
    pub fn from_config(config: &ConditionConfig) -> RouteResult<Self> {
        Ok(Self {
            authority: config.authority.as_deref().map(Pattern::hostname).transpose()?,
            alpn: config.alpn.as_deref().map(Pattern::new).transpose()?,
            ports: config.port.as_ref().map(PortSet::from_config).transpose()?,
        })
    }

    /// Whether the condition has no constraints.
    #[must_use]
    pub fn is_unconstrained(&self) -> bool {
        self.authority.is_none() && self.alpn.is_none() && self.ports.is_none()
    }

    /// Hostname check alone.
    #[must_use]
    pub fn matches_authority(&self, hostname: Option<&str>) -> bool {
        matches_optional(self.authority.as_ref(), hostname)
    }

    /// Protocol-name check alone.
    #[must_use]
    pub fn matches_alpn(&self, protocol: Option<&str>) -> bool {
        matches_optional(self.alpn.as_ref(), protocol)
    }

    /// Port check alone, usable before hostname and protocol are known.
    /// An empty port set never matches.
    #[must_use]
    pub fn matches_port_only(&self, port: Option<u16>) -> bool {
        match (&self.ports, port) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(ports), Some(port)) => ports.contains(port),
        }
    }

    /// All three checks.
    #[must_use]
    pub fn matches(&self, hostname: Option<&str>, protocol: Option<&str>, port: Option<u16>) -> bool {
        self.matches_port_only(port)
            && self.matches_authority(hostname)
            && self.matches_alpn(protocol)
    }
}
