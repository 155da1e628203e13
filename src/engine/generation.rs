//! Immutable snapshot of attached bindings.
//!
//! A generation is built once per configuration and shared by every shard.
//! New streams look their binding up in the current generation; streams that
//! already exist keep whatever their handler captured when it was created.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{error, info};

use super::error::EngineResult;
use crate::binding::{AttachContext, AttachError, BindingFactory, BindingHandler};
use crate::config::{binding_id, content_hash, BindingKind, ContentHash, DataplaneConfig};
use crate::route::GuardRegistry;
use crate::tls::VaultRegistry;

/// A binding that attached successfully.
pub struct AttachedBinding {
    /// Configured name.
    pub name: String,
    /// Stable id derived from namespace and name.
    pub binding_id: u64,
    /// Configured type.
    pub binding_type: String,
    /// Configured kind.
    pub kind: BindingKind,
    /// Handler creating the binding's streams.
    pub handler: Arc<dyn BindingHandler>,
}

impl fmt::Debug for AttachedBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedBinding")
            .field("name", &self.name)
            .field("binding_id", &self.binding_id)
            .field("binding_type", &self.binding_type)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Outcome of attaching every binding of a configuration.
#[derive(Debug, Default)]
pub struct AttachReport {
    /// Names of bindings that attached.
    pub attached: Vec<String>,
    /// Bindings left out, with the reason.
    pub failed: Vec<(String, AttachError)>,
}

impl AttachReport {
    /// Whether every binding attached.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Bindings by id, immutable once built.
#[derive(Debug, Default)]
pub struct Generation {
    revision: u64,
    content_hash: ContentHash,
    bindings: HashMap<u64, Arc<AttachedBinding>>,
}

impl Generation {
    /// A generation with no bindings.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Attach every binding in `config`.
    ///
    /// A binding that fails to attach is left out and listed in the report;
    /// the others are unaffected.
    ///
    /// # Errors
    ///
    /// Returns an error only if the configuration cannot be hashed.
    pub fn attach(
        config: &DataplaneConfig,
        factory: &BindingFactory,
        vaults: &VaultRegistry,
        guards: &GuardRegistry,
    ) -> EngineResult<(Self, AttachReport)> {
        let namespace = config.engine.namespace.as_str();
        let binding_ids: HashMap<String, u64> = config
            .bindings
            .iter()
            .map(|entry| (entry.name.clone(), binding_id(namespace, &entry.name)))
            .collect();

        let mut generation = Self {
            revision: 0,
            content_hash: content_hash(config)?,
            bindings: HashMap::with_capacity(config.bindings.len()),
        };
        let mut report = AttachReport::default();

        for entry in &config.bindings {
            let id = binding_id(namespace, &entry.name);
            let ctx = AttachContext {
                namespace,
                binding_id: id,
                binding_ids: &binding_ids,
                vaults,
                guards,
            };
            match factory.attach(entry, &ctx) {
                Ok(handler) => {
                    info!(
                        binding = %entry.name,
                        binding_id = id,
                        binding_type = %entry.binding_type,
                        kind = %entry.kind,
                        "Binding attached"
                    );
                    generation.bindings.insert(
                        id,
                        Arc::new(AttachedBinding {
                            name: entry.name.clone(),
                            binding_id: id,
                            binding_type: entry.binding_type.clone(),
                            kind: entry.kind,
                            handler,
                        }),
                    );
                    report.attached.push(entry.name.clone());
                }
                Err(e) => {
                    error!(binding = %entry.name, error = %e, "Binding failed to attach");
                    report.failed.push((entry.name.clone(), e));
                }
            }
        }

        Ok((generation, report))
    }

    /// Set the revision number.
    #[must_use]
    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    /// Add a handler directly, bypassing configuration.
    #[must_use]
    pub fn with_binding(
        mut self,
        name: &str,
        binding_id: u64,
        handler: Arc<dyn BindingHandler>,
    ) -> Self {
        self.bindings.insert(
            binding_id,
            Arc::new(AttachedBinding {
                name: name.to_string(),
                binding_id,
                binding_type: "custom".to_string(),
                kind: BindingKind::Server,
                handler,
            }),
        );
        self
    }

    /// Binding with `binding_id`.
    #[must_use]
    pub fn binding(&self, binding_id: u64) -> Option<&Arc<AttachedBinding>> {
        self.bindings.get(&binding_id)
    }

    /// Binding named `name`.
    #[must_use]
    pub fn binding_named(&self, name: &str) -> Option<&Arc<AttachedBinding>> {
        self.bindings.values().find(|binding| binding.name == name)
    }

    /// Revision number.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Content hash of the configuration this generation was built from.
    #[must_use]
    pub fn content_hash(&self) -> ContentHash {
        self.content_hash
    }

    /// Number of attached bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether no binding is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
