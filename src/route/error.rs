//! Route construction error types.

use thiserror::Error;

/// Errors raised while building routes from configuration.
#[derive(Debug, Error)]
pub enum RouteError {
    /// A wildcard pattern did not compile.
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The wildcard pattern as configured.
        pattern: String,
        /// Underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// A port or port range is invalid.
    #[error("invalid port range '{0}'")]
    InvalidPortRange(String),

    /// A route exit does not name a known binding.
    #[error("route exit '{0}' is not a known binding")]
    UnknownExit(String),

    /// A route references an unregistered guard.
    #[error("route guard '{0}' is not registered")]
    UnknownGuard(String),
}

/// Result type alias for route operations.
pub type RouteResult<T> = Result<T, RouteError>;
