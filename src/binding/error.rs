//! Binding and per-stream error types.

use thiserror::Error;

use crate::config::ConfigError;
use crate::flow::FlowError;
use crate::frame::FrameError;
use crate::route::RouteError;
use crate::tls::TlsError;

/// Per-stream failures. None of these cross streams or stop a shard; each
/// ends in Reset and/or Abort of the affected stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A frame failed to decode.
    #[error("malformed frame: {0}")]
    Malformed(#[from] FrameError),

    /// The flow-control invariant was broken.
    #[error("flow control violation: {0}")]
    FlowControlViolation(#[from] FlowError),

    /// No route matched the stream.
    #[error("no route for binding {binding_id} (authority {authority:?}, alpn {alpn:?})")]
    RouteNotFound {
        /// Binding that tried to resolve.
        binding_id: u64,
        /// Hostname used for matching.
        authority: Option<String>,
        /// Protocol used for matching.
        alpn: Option<String>,
    },

    /// A frame arrived that the half-stream state does not allow.
    #[error("protocol violation on stream {stream_id}: {message}")]
    ProtocolViolation {
        /// Offending stream.
        stream_id: u64,
        /// What went wrong.
        message: String,
    },

    /// A TLS handshake failed.
    #[error("handshake failure: {0}")]
    HandshakeFailure(String),
}

/// Result type alias for per-stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Failures attaching a binding. Fatal to that binding only.
#[derive(Debug, Error)]
pub enum AttachError {
    /// No factory is registered for the binding type.
    #[error("unknown binding type '{0}'")]
    UnknownType(String),

    /// The binding type does not support the configured kind.
    #[error("binding type '{binding_type}' does not support kind '{kind}'")]
    UnsupportedKind {
        /// Binding type.
        binding_type: String,
        /// Configured kind.
        kind: String,
    },

    /// Options failed to parse.
    #[error("invalid options: {0}")]
    Options(#[from] ConfigError),

    /// Routes failed to build.
    #[error("invalid routes: {0}")]
    Route(#[from] RouteError),

    /// Credential or trust material is missing or malformed.
    #[error("credential error: {0}")]
    Credential(#[from] TlsError),
}
