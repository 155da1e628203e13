//! Binding type registry.
//!
//! Maps a configured `type` name to the constructor that turns a
//! [`BindingEntry`] into a running [`BindingHandler`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::contract::BindingHandler;
use super::echo::{EchoBinding, EchoOptions};
use super::error::AttachError;
use super::proxy::ProxyBinding;
use crate::config::{BindingEntry, BindingKind};
use crate::route::{build_resolver, GuardRegistry, RouteResolver};
use crate::tls::{MemoryVault, TlsClientBinding, TlsOptions, TlsServerBinding, Vault, VaultRegistry};

/// What a constructor may consult while attaching one binding.
pub struct AttachContext<'a> {
    /// Namespace the binding ids were derived in.
    pub namespace: &'a str,
    /// Id of the binding being attached.
    pub binding_id: u64,
    /// Ids of every binding in the configuration, by name.
    pub binding_ids: &'a HashMap<String, u64>,
    /// Credential sources.
    pub vaults: &'a VaultRegistry,
    /// Route guards.
    pub guards: &'a GuardRegistry,
}

impl AttachContext<'_> {
    /// Routes of `entry` with exits resolved to binding ids.
    ///
    /// # Errors
    ///
    /// Returns [`AttachError::Route`] for invalid conditions, unknown exits
    /// or unknown guards.
    pub fn resolver(&self, entry: &BindingEntry) -> Result<RouteResolver, AttachError> {
        Ok(build_resolver(entry, self.binding_ids, self.guards)?)
    }

    /// The vault named by `entry`, or an empty one when it names none.
    ///
    /// # Errors
    ///
    /// Returns [`AttachError::Credential`] if the vault is not registered.
    pub fn vault(&self, entry: &BindingEntry) -> Result<Arc<dyn Vault>, AttachError> {
        match &entry.vault {
            Some(name) => Ok(self.vaults.get(name)?),
            None => Ok(Arc::new(MemoryVault::new(&entry.name))),
        }
    }
}

/// Builds a binding from its configuration.
pub type BindingConstructor =
    fn(&BindingEntry, &AttachContext<'_>) -> Result<Arc<dyn BindingHandler>, AttachError>;

fn unsupported(entry: &BindingEntry) -> AttachError {
    AttachError::UnsupportedKind {
        binding_type: entry.binding_type.clone(),
        kind: entry.kind.to_string(),
    }
}

fn attach_proxy(
    entry: &BindingEntry,
    ctx: &AttachContext<'_>,
) -> Result<Arc<dyn BindingHandler>, AttachError> {
    if entry.kind != BindingKind::Proxy {
        return Err(unsupported(entry));
    }
    Ok(Arc::new(ProxyBinding::new(ctx.binding_id, ctx.resolver(entry)?)))
}

fn attach_echo(
    entry: &BindingEntry,
    ctx: &AttachContext<'_>,
) -> Result<Arc<dyn BindingHandler>, AttachError> {
    if entry.kind != BindingKind::Server {
        return Err(unsupported(entry));
    }
    let options: EchoOptions = entry.options_as()?;
    Ok(Arc::new(EchoBinding::new(ctx.binding_id, options)))
}

fn attach_tls(
    entry: &BindingEntry,
    ctx: &AttachContext<'_>,
) -> Result<Arc<dyn BindingHandler>, AttachError> {
    let options: TlsOptions = entry.options_as()?;
    let resolver = ctx.resolver(entry)?;
    let vault = ctx.vault(entry)?;
    match entry.kind {
        BindingKind::Server => Ok(Arc::new(TlsServerBinding::new(
            ctx.binding_id,
            options,
            resolver,
            vault.as_ref(),
        )?)),
        BindingKind::Client => Ok(Arc::new(TlsClientBinding::new(
            ctx.binding_id,
            options,
            resolver,
            vault.as_ref(),
        )?)),
        BindingKind::Proxy => Err(unsupported(entry)),
    }
}

/// Registry of binding constructors by type name.
#[derive(Clone)]
pub struct BindingFactory {
    constructors: HashMap<String, BindingConstructor>,
}

impl fmt::Debug for BindingFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.constructors.keys().collect();
        types.sort();
        f.debug_struct("BindingFactory").field("types", &types).finish()
    }
}

impl Default for BindingFactory {
    fn default() -> Self {
        Self::empty()
            .with_type("proxy", attach_proxy)
            .with_type("echo", attach_echo)
            .with_type("tls", attach_tls)
    }
}

impl BindingFactory {
    /// Registry with the built-in `proxy`, `echo` and `tls` types.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with no types.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Register or replace a type.
    #[must_use]
    pub fn with_type(mut self, binding_type: &str, constructor: BindingConstructor) -> Self {
        self.constructors
            .insert(binding_type.to_string(), constructor);
        self
    }

    /// Whether `binding_type` is registered.
    #[must_use]
    pub fn contains(&self, binding_type: &str) -> bool {
        self.constructors.contains_key(binding_type)
    }

    /// Build the handler for one binding.
    ///
    /// # Errors
    ///
    /// Returns [`AttachError::UnknownType`] for an unregistered type, or
    /// whatever the constructor reports.
    pub fn attach(
        &self,
        entry: &BindingEntry,
        ctx: &AttachContext<'_>,
    ) -> Result<Arc<dyn BindingHandler>, AttachError> {
        let constructor = self
            .constructors
            .get(&entry.binding_type)
            .ok_or_else(|| AttachError::UnknownType(entry.binding_type.clone()))?;
        constructor(entry, ctx)
    }
}
