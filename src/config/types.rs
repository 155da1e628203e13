//! Configuration types for the dataplane.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::error::{ConfigError, ConfigResult};

/// Root configuration: engine settings, credential vaults and bindings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataplaneConfig {
    /// Engine settings.
    pub engine: EngineSection,

    /// Credential vaults referenced by bindings.
    pub vaults: Vec<VaultEntry>,

    /// Bindings, each a configured protocol adapter.
    pub bindings: Vec<BindingEntry>,
}

impl DataplaneConfig {
    /// Find a binding by name.
    #[must_use]
    pub fn binding(&self, name: &str) -> Option<&BindingEntry> {
        self.bindings.iter().find(|b| b.name == name)
    }

    /// Find a vault by name.
    #[must_use]
    pub fn vault(&self, name: &str) -> Option<&VaultEntry> {
        self.vaults.iter().find(|v| v.name == name)
    }
}

/// Engine section configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Number of worker shards.
    pub workers: usize,

    /// Capacity of each inter-shard lane.
    pub lane_capacity: usize,

    /// Namespace mixed into binding ids.
    pub namespace: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            workers: 1,
            lane_capacity: 1024,
            namespace: "default".to_string(),
        }
    }
}

/// A named set of keys and trust anchors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultEntry {
    /// Vault name referenced by bindings.
    pub name: String,

    /// Certificate/key pairs by alias.
    pub keys: BTreeMap<String, KeyEntry>,

    /// PEM trust anchors by alias.
    pub trust: BTreeMap<String, PathBuf>,
}

/// Certificate and private key files for one alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEntry {
    /// Path to the PEM certificate.
    pub cert_path: PathBuf,

    /// Path to the PEM private key.
    pub key_path: PathBuf,

    /// Optional PEM intermediate chain.
    #[serde(default)]
    pub chain_path: Option<PathBuf>,

    /// Server names this key is presented for. A key with no names is only
    /// used as the fallback.
    #[serde(default)]
    pub sni_names: Vec<String>,
}

/// Which side of a connection a binding plays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingKind {
    /// Accepts streams and terminates them.
    #[default]
    Server,
    /// Originates streams towards a peer.
    Client,
    /// Relays streams unchanged.
    Proxy,
}

impl std::fmt::Display for BindingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
            Self::Proxy => write!(f, "proxy"),
        }
    }
}

/// A configured binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingEntry {
    /// Binding name (used for identification and as route exit).
    pub name: String,

    /// Binding type (e.g., "tls", "proxy", "echo").
    #[serde(rename = "type")]
    pub binding_type: String,

    /// Binding kind.
    #[serde(default)]
    pub kind: BindingKind,

    /// Vault providing credentials.
    #[serde(default)]
    pub vault: Option<String>,

    /// Type-specific options.
    #[serde(default)]
    pub options: toml::Table,

    /// Ordered routes.
    #[serde(default)]
    pub routes: Vec<RouteEntry>,

    /// Fallback exit taken when no route matches.
    #[serde(default)]
    pub exit: Option<String>,
}

impl BindingEntry {
    /// Create a new binding entry.
    pub fn new(name: &str, binding_type: &str, kind: BindingKind) -> Self {
        Self {
            name: name.to_string(),
            binding_type: binding_type.to_string(),
            kind,
            vault: None,
            options: toml::Table::new(),
            routes: Vec::new(),
            exit: None,
        }
    }

    /// Add a route.
    #[must_use]
    pub fn with_route(mut self, route: RouteEntry) -> Self {
        self.routes.push(route);
        self
    }

    /// Set the vault.
    #[must_use]
    pub fn with_vault(mut self, vault: &str) -> Self {
        self.vault = Some(vault.to_string());
        self
    }

    /// Set the fallback exit.
    #[must_use]
    pub fn with_exit(mut self, exit: &str) -> Self {
        self.exit = Some(exit.to_string());
        self
    }

    /// Set the options table.
    #[must_use]
    pub fn with_options(mut self, options: toml::Table) -> Self {
        self.options = options;
        self
    }

    /// Deserialize the options table into a typed options struct.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the table does not fit `T`.
    pub fn options_as<T>(&self) -> ConfigResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        toml::Value::Table(self.options.clone())
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::InvalidValue {
                field: format!("bindings.{}.options", self.name),
                message: e.to_string(),
            })
    }
}

/// A route: conditions, optional guard and the exit binding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteEntry {
    /// Target binding name.
    pub exit: String,

    /// Conditions, any of which selects the route. Empty matches everything.
    pub when: Vec<ConditionConfig>,

    /// Guard protecting the route.
    pub guarded: Option<GuardedConfig>,
}

impl RouteEntry {
    /// Create a route to `exit` with no conditions.
    pub fn to(exit: &str) -> Self {
        Self {
            exit: exit.to_string(),
            ..Self::default()
        }
    }

    /// Add a condition.
    #[must_use]
    pub fn when(mut self, condition: ConditionConfig) -> Self {
        self.when.push(condition);
        self
    }

    /// Protect the route with a guard.
    #[must_use]
    pub fn guarded(mut self, guard: &str, roles: &[&str]) -> Self {
        self.guarded = Some(GuardedConfig {
            guard: guard.to_string(),
            roles: roles.iter().map(|r| (*r).to_string()).collect(),
        });
        self
    }
}

/// Guard reference with required roles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardedConfig {
    /// Guard name.
    pub guard: String,

    /// Roles the caller must hold.
    pub roles: Vec<String>,
}

/// A single route condition. Absent fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionConfig {
    /// Hostname wildcard pattern.
    pub authority: Option<String>,

    /// Protocol-name wildcard pattern.
    pub alpn: Option<String>,

    /// Port, range, or list of ports and ranges.
    pub port: Option<PortsConfig>,
}

impl ConditionConfig {
    /// Condition on authority only.
    pub fn authority(pattern: &str) -> Self {
        Self {
            authority: Some(pattern.to_string()),
            ..Self::default()
        }
    }

    /// Add an ALPN pattern.
    #[must_use]
    pub fn with_alpn(mut self, pattern: &str) -> Self {
        self.alpn = Some(pattern.to_string());
        self
    }

    /// Add explicit ports.
    #[must_use]
    pub fn with_ports(mut self, ports: &[u16]) -> Self {
        self.port = Some(PortsConfig::Many(
            ports.iter().copied().map(PortSpec::Single).collect(),
        ));
        self
    }
}

/// Port constraint as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortsConfig {
    /// A list of ports and ranges.
    Many(Vec<PortSpec>),
    /// A single port or range.
    One(PortSpec),
}

impl PortsConfig {
    /// All specs as a slice-like list.
    #[must_use]
    pub fn specs(&self) -> Vec<&PortSpec> {
        match self {
            Self::Many(specs) => specs.iter().collect(),
            Self::One(spec) => vec![spec],
        }
    }
}

/// A port number or an inclusive `"lo-hi"` range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    /// Single port.
    Single(u16),
    /// Range such as `"8000-8080"`, or a single port written as a string.
    Range(String),
}

impl PortSpec {
    /// Inclusive bounds of this spec.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unparsable or inverted ranges.
    pub fn bounds(&self) -> ConfigResult<(u16, u16)> {
        let invalid = |message: String| ConfigError::InvalidValue {
            field: "port".to_string(),
            message,
        };
        match self {
            Self::Single(port) => Ok((*port, *port)),
            Self::Range(text) => {
                let (low, high) = match text.split_once('-') {
                    Some((low, high)) => (low.trim(), high.trim()),
                    None => (text.trim(), text.trim()),
                };
                let low: u16 = low
                    .parse()
                    .map_err(|_| invalid(format!("'{text}' is not a port or range")))?;
                let high: u16 = high
                    .parse()
                    .map_err(|_| invalid(format!("'{text}' is not a port or range")))?;
                if low > high {
                    return Err(invalid(format!("range '{text}' is inverted")));
                }
                Ok((low, high))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DataplaneConfig::default();
        assert_eq!(config.engine.workers, 1);
        assert_eq!(config.engine.namespace, "default");
        assert!(config.bindings.is_empty());
    }

    #[test]
    fn test_parse_bindings() {
        let config: DataplaneConfig = toml::from_str(
            r#"
            [engine]
            workers = 4

            [[bindings]]
            name = "tls_server"
            type = "tls"
            kind = "server"
            vault = "server"
            exit = "fallback"

            [bindings.options]
            keys = ["localhost"]
            alpn = ["h2", "http/1.1"]

            [[bindings.routes]]
            exit = "app"

            [[bindings.routes.when]]
            authority = "*.example.com"
            port = [443, "8000-8080"]

            [[bindings.routes.when]]
            alpn = "h2"
            port = 8443
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.workers, 4);
        let binding = config.binding("tls_server").unwrap();
        assert_eq!(binding.kind, BindingKind::Server);
        assert_eq!(binding.vault.as_deref(), Some("server"));
        assert_eq!(binding.routes[0].when.len(), 2);

        let first = binding.routes[0].when[0].port.as_ref().unwrap();
        let bounds: Vec<_> = first
            .specs()
            .into_iter()
            .map(|s| s.bounds().unwrap())
            .collect();
        assert_eq!(bounds, vec![(443, 443), (8000, 8080)]);

        let second = binding.routes[0].when[1].port.as_ref().unwrap();
        assert_eq!(second, &PortsConfig::One(PortSpec::Single(8443)));
    }

    #[test]
    fn test_port_range_errors() {
        assert!(PortSpec::Range("90-80".into()).bounds().is_err());
        assert!(PortSpec::Range("http".into()).bounds().is_err());
        assert_eq!(PortSpec::Range("22".into()).bounds().unwrap(), (22, 22));
    }

    #[test]
    fn test_options_as() {
        #[derive(Debug, Deserialize)]
        struct Options {
            window: u32,
        }

        let mut options = toml::Table::new();
        options.insert("window".into(), toml::Value::Integer(4096));
        let binding = BindingEntry::new("echo", "echo", BindingKind::Server).with_options(options);

        let parsed: Options = binding.options_as().unwrap();
        assert_eq!(parsed.window, 4096);

        let bad = BindingEntry::new("echo", "echo", BindingKind::Server);
        let result: ConfigResult<Options> = bad.options_as();
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
