//! # Route Resolution
//!
//! Every binding picks the downstream target of a new stream the same way:
//! walk its routes in declared order and take the first one whose
//! authorization predicate passes and whose conditions match the stream's
//! hostname, protocol name and port.
//!
//! Routes are built once per configuration generation from
//! [`crate::config::RouteEntry`] and are read-only afterwards.

mod condition;
mod error;
mod guard;
mod pattern;
mod ports;
mod resolver;

pub use condition::Condition;
pub use error::{RouteError, RouteResult};
pub use guard::{Authorization, FnGuard, Guard, GuardRegistry};
pub use pattern::Pattern;
pub use ports::PortSet;
pub use resolver::{Route, RouteResolver};

use std::collections::HashMap;

use crate::config::BindingEntry;

/// Build the resolver for a binding, appending its fallback exit as an
/// unconditional last route.
///
/// # Errors
///
/// Returns an error for invalid conditions, unknown exits or unregistered
/// guards.
pub fn build_resolver(
    binding: &BindingEntry,
    binding_ids: &HashMap<String, u64>,
    guards: &GuardRegistry,
) -> RouteResult<RouteResolver> {
    let exit_id = |name: &str| {
        binding_ids
            .get(name)
            .copied()
            .ok_or_else(|| RouteError::UnknownExit(name.to_string()))
    };

    let mut routes = Vec::with_capacity(binding.routes.len() + 1);
    for (index, entry) in binding.routes.iter().enumerate() {
        let conditions = entry
            .when
            .iter()
            .map(Condition::from_config)
            .collect::<RouteResult<Vec<_>>>()?;

        let authorization = match &entry.guarded {
            None => Authorization::Open,
            Some(guarded) => Authorization::Guarded {
                name: guarded.guard.clone(),
                guard: guards
                    .get(&guarded.guard)
                    .ok_or_else(|| RouteError::UnknownGuard(guarded.guard.clone()))?,
                roles: guarded.roles.clone(),
            },
        };

        routes.push(Route {
            id: index as u64,
            exit: exit_id(&entry.exit)?,
            conditions,
            authorization,
        });
    }

    if let Some(exit) = &binding.exit {
        routes.push(Route::new(routes.len() as u64, exit_id(exit)?));
    }

    Ok(RouteResolver::new(routes))
}
