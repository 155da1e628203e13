//! First-match route selection.

use super::condition::Condition;
use super::guard::Authorization;

/// An ordered rule mapping matched conditions and authorization to an exit
/// binding.
#[derive(Debug, Clone)]
pub struct Route {
    /// Position of the route within its binding.
    pub id: u64,
    /// Binding the stream is sent to.
    pub exit: u64,
    /// Conditions, any of which selects the route. Empty matches everything.
    pub conditions: Vec<Condition>,
    /// Authorization predicate.
    pub authorization: Authorization,
}

impl Route {
    /// Unconditional, unguarded route to `exit`.
    #[must_use]
    pub fn new(id: u64, exit: u64) -> Self {
        Self {
            id,
            exit,
            conditions: Vec::new(),
            authorization: Authorization::Open,
        }
    }

    /// Add a condition.
    #[must_use]
    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Set the authorization predicate.
    #[must_use]
    pub fn guarded(mut self, authorization: Authorization) -> Self {
        self.authorization = authorization;
        self
    }

    /// Whether the caller may take this route.
    #[must_use]
    pub fn authorized(&self, authorization: u64) -> bool {
        self.authorization.permits(authorization)
    }

    /// Whether any condition matches, or there are none.
    #[must_use]
    pub fn matches(&self, hostname: Option<&str>, protocol: Option<&str>, port: Option<u16>) -> bool {
        self.conditions.is_empty()
            || self
                .conditions
                .iter()
                .any(|c| c.matches(hostname, protocol, port))
    }

    /// Port-only variant of [`Route::matches`].
    #[must_use]
    pub fn matches_port_only(&self, port: Option<u16>) -> bool {
        self.conditions.is_empty() || self.conditions.iter().any(|c| c.matches_port_only(port))
    }

    /// Match when no hostname is known: the port check combined with the
    /// protocol matched against a missing hostname, on the same condition.
    #[must_use]
    pub fn matches_unnamed(&self, protocol: Option<&str>, port: Option<u16>) -> bool {
        self.conditions.is_empty()
            || self.conditions.iter().any(|c| {
                c.matches_port_only(port) && c.matches_authority(None) && c.matches_alpn(protocol)
            })
    }
}

/// Immutable, ordered list of routes. The first route that is both
/// authorized and matching wins; there is no backtracking.
#[derive(Debug, Clone, Default)]
pub struct RouteResolver {
    routes: Vec<Route>,
}

impl RouteResolver {
    /// Create a resolver over `routes` in declared order.
    #[must_use]
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Routes in declared order.
    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Whether there are no routes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Resolve a stream once hostname and protocol are known.
    #[must_use]
    pub fn resolve(
        &self,
        authorization: u64,
        hostname: Option<&str>,
        protocol: Option<&str>,
        port: Option<u16>,
    ) -> Option<&Route> {
        self.routes
            .iter()
            .find(|r| r.authorized(authorization) && r.matches(hostname, protocol, port))
    }

    /// Resolve using only the destination port, before negotiation.
    #[must_use]
    pub fn resolve_port_only(&self, authorization: u64, port: Option<u16>) -> Option<&Route> {
        self.routes
            .iter()
            .find(|r| r.authorized(authorization) && r.matches_port_only(port))
    }
}
