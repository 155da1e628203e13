//! Engine status and health reporting.

use std::time::Duration;

use crate::config::ContentHash;

/// Lifecycle state of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    /// Shards are running.
    Running,

    /// Some shards stopped unexpectedly.
    Degraded {
        /// Reason for degradation.
        reason: String,
    },

    /// The engine was shut down.
    Stopped,
}

impl EngineState {
    /// Returns `true` if every shard is running.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns `true` if the engine still accepts frames.
    #[must_use]
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Running | Self::Degraded { .. })
    }

    /// Returns `true` if the engine is stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Degraded { reason } => write!(f, "degraded: {reason}"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot returned by [`super::Engine::status`].
#[derive(Debug, Clone)]
pub struct EngineStatus {
    /// Lifecycle state.
    pub state: EngineState,

    /// Number of shards started.
    pub shards: usize,

    /// Shards whose thread is still alive.
    pub live_shards: usize,

    /// Revision of the generation used for new streams.
    pub revision: u64,

    /// Content hash of that generation.
    pub content_hash: ContentHash,

    /// Bindings attached in that generation.
    pub bindings: usize,

    /// Time since the engine started.
    pub uptime: Duration,
}
