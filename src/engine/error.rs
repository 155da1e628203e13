//! Engine error types and result aliases.

use thiserror::Error;

use crate::config::ConfigError;
use crate::frame::FrameError;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur starting or driving the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Engine settings are unusable.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// A shard thread could not be started.
    #[error("failed to start shard {shard}: {source}")]
    Spawn {
        /// Shard index.
        shard: usize,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A shard has stopped and no longer accepts commands.
    #[error("shard {0} is not running")]
    ShardUnavailable(usize),

    /// The engine was shut down.
    #[error("engine is stopped")]
    Stopped,

    /// A dispatched frame could not be read.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The configuration could not be hashed or loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
