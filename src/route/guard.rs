//! Authorization guards protecting routes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::trace;

/// Decides whether an authorization token may take a guarded route.
pub trait Guard: Send + Sync {
    /// Whether `authorization` holds every role in `roles`.
    fn verify(&self, authorization: u64, roles: &[String]) -> bool;

    /// Resolve the identity behind `authorization`, if known.
    fn identity(&self, _authorization: u64) -> Option<String> {
        None
    }
}

/// A guard backed by a closure.
pub struct FnGuard<F> {
    verify: F,
}

impl<F> FnGuard<F>
where
    F: Fn(u64, &[String]) -> bool + Send + Sync,
{
    /// Wrap a verification closure.
    pub fn new(verify: F) -> Self {
        Self { verify }
    }
}

impl<F> Guard for FnGuard<F>
where
    F: Fn(u64, &[String]) -> bool + Send + Sync,
{
    fn verify(&self, authorization: u64, roles: &[String]) -> bool {
        (self.verify)(authorization, roles)
    }
}

/// Authorization predicate attached to a route.
#[derive(Clone, Default)]
pub enum Authorization {
    /// Any caller may take the route.
    #[default]
    Open,
    /// Only callers the guard accepts for these roles.
    Guarded {
        /// Guard name, for logging.
        name: String,
        /// The guard.
        guard: Arc<dyn Guard>,
        /// Required roles.
        roles: Vec<String>,
    },
}

impl Authorization {
    /// Evaluate the predicate.
    #[must_use]
    pub fn permits(&self, authorization: u64) -> bool {
        match self {
            Self::Open => true,
            Self::Guarded { name, guard, roles } => {
                let permitted = guard.verify(authorization, roles);
                if permitted {
                    let identity = guard.identity(authorization);
                    trace!(
                        guard = %name,
                        identity = identity.as_deref().unwrap_or("-"),
                        "Guarded route permitted"
                    );
                }
                permitted
            }
        }
    }

    /// Identity the guard resolves for `authorization`. Open routes have none.
    #[must_use]
    pub fn identity(&self, authorization: u64) -> Option<String> {
        match self {
            Self::Open => None,
            Self::Guarded { guard, .. } => guard.identity(authorization),
        }
    }
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Guarded { name, roles, .. } => f
                .debug_struct("Guarded")
                .field("name", name)
                .field("roles", roles)
                .finish(),
        }
    }
}

/// Guards by name, consulted when routes are built.
#[derive(Clone, Default)]
pub struct GuardRegistry {
    guards: HashMap<String, Arc<dyn Guard>>,
}

impl GuardRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a guard.
    #[must_use]
    pub fn with_guard(mut self, name: &str, guard: Arc<dyn Guard>) -> Self {
        self.guards.insert(name.to_string(), guard);
        self
    }

    /// Look up a guard.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Guard>> {
        self.guards.get(name).cloned()
    }
}

impl fmt::Debug for GuardRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardRegistry")
            .field("guards", &self.guards.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin_guard() -> Arc<dyn Guard> {
        Arc::new(FnGuard::new(|authorization, roles: &[String]| {
            authorization == 42 && roles.iter().all(|r| r == "admin")
        }))
    }

    #[test]
    fn test_open_permits_all() {
        assert!(Authorization::Open.permits(0));
        assert!(Authorization::Open.permits(u64::MAX));
    }

    #[test]
    fn test_guarded() {
        let authorization = Authorization::Guarded {
            name: "jwt".into(),
            guard: admin_guard(),
            roles: vec!["admin".into()],
        };
        assert!(authorization.permits(42));
        assert!(!authorization.permits(7));
    }

    struct SessionGuard;

    impl Guard for SessionGuard {
        fn verify(&self, authorization: u64, _roles: &[String]) -> bool {
            authorization != 0
        }

        fn identity(&self, authorization: u64) -> Option<String> {
            (authorization != 0).then(|| format!("session-{authorization}"))
        }
    }

    #[test]
    fn test_identity_resolved_through_guard() {
        let authorization = Authorization::Guarded {
            name: "session".into(),
            guard: Arc::new(SessionGuard),
            roles: Vec::new(),
        };
        assert!(authorization.permits(9));
        assert_eq!(authorization.identity(9).as_deref(), Some("session-9"));
        assert_eq!(authorization.identity(0), None);
        assert_eq!(Authorization::Open.identity(9), None);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = GuardRegistry::new().with_guard("jwt", admin_guard());
        assert!(registry.get("jwt").is_some());
        assert!(registry.get("other").is_none());
    }
}
