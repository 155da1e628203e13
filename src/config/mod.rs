//! # Configuration System
//!
//! TOML-based configuration for the dataplane: engine settings, credential
//! vaults and bindings with their ordered routes. It includes parsing,
//! validation, order-independent content hashing and hot-reload support.
//!
//! ## Example Configuration
//!
//! ```toml
//! [engine]
//! workers = 2
//!
//! [[vaults]]
//! name = "server"
//!
//! [vaults.keys.localhost]
//! cert_path = "certs/localhost.pem"
//! key_path = "certs/localhost.key"
//!
//! [[bindings]]
//! name = "tls_server"
//! type = "tls"
//! kind = "server"
//! vault = "server"
//!
//! [bindings.options]
//! keys = ["localhost"]
//!
//! [[bindings.routes]]
//! exit = "app"
//!
//! [[bindings.routes.when]]
//! authority = "localhost"
//! alpn = "h2"
//!
//! [[bindings]]
//! name = "app"
//! type = "echo"
//! ```

mod error;
mod hash;
mod loader;
mod types;
mod validation;
mod watcher;

pub use error::{ConfigError, ConfigResult};
pub use hash::{binding_id, content_hash, ContentHash};
pub use loader::ConfigLoader;
pub use types::{
    BindingEntry, BindingKind, ConditionConfig, DataplaneConfig, EngineSection, GuardedConfig,
    KeyEntry, PortSpec, PortsConfig, RouteEntry, VaultEntry,
};
pub use validation::{BasicValidator, ValidationError, ValidationResult, ValidationSeverity, Validator};
pub use watcher::{ConfigEvent, ConfigWatcher, WatcherConfig};
