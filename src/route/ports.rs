//! Flat port membership sets.

use std::collections::BTreeSet;

use super::error::{RouteError, RouteResult};
use crate::config::PortsConfig;

/// Explicit ports and inclusive ranges normalized into one membership set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSet {
    ports: BTreeSet<u16>,
}

impl PortSet {
    /// An empty set, which matches no port.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.ports.insert(port);
        self
    }

    /// Add an inclusive range.
    #[must_use]
    pub fn with_range(mut self, low: u16, high: u16) -> Self {
        self.ports.extend(low..=high);
        self
    }

    /// Parse `"443"` or `"8000-8080"`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPortRange`] for anything else, including
    /// inverted ranges.
    pub fn parse(text: &str) -> RouteResult<Self> {
        let (low, high) = parse_range(text)?;
        Ok(Self::new().with_range(low, high))
    }

    /// Build from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPortRange`] for an invalid entry.
    pub fn from_config(config: &PortsConfig) -> RouteResult<Self> {
        let mut set = Self::new();
        for spec in config.specs() {
            let (low, high) = spec
                .bounds()
                .map_err(|_| RouteError::InvalidPortRange(format!("{spec:?}")))?;
            set = set.with_range(low, high);
        }
        Ok(set)
    }

    /// Whether `port` is in the set.
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    /// Whether the set has no ports.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Number of member ports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ports.len()
    }
}

fn parse_range(text: &str) -> RouteResult<(u16, u16)> {
    let invalid = || RouteError::InvalidPortRange(text.to_string());
    let (low, high) = match text.split_once('-') {
        Some((low, high)) => (low.trim(), high.trim()),
        None => (text.trim(), text.trim()),
    };
    let low: u16 = low.parse().map_err(|_| invalid())?;
    let high: u16 = high.parse().map_err(|_| invalid())?;
    if low > high {
        return Err(invalid());
    }
    Ok((low, high))
}
