//! # Sharded Stream Engine
//!
//! The engine runs N shards. Each shard owns a [`Worker`]: the handler
//! arena, the stream and throttle tables and the timer queue for every
//! stream whose initial id it owns. Frames for another shard's streams
//! travel over bounded lanes; nothing else is shared except the
//! [`crate::budget::BudgetPool`].
//!
//! Configuration reaches the shards as an immutable [`Generation`]. A new
//! generation only affects streams opened after it is installed.

mod context;
mod error;
mod generation;
mod metrics;
mod runtime;
mod status;
mod table;
mod timer;
mod worker;

#[cfg(test)]
pub(crate) use context::ShardState;

pub use context::StreamContext;
pub use error::{EngineError, EngineResult};
pub use generation::{AttachReport, AttachedBinding, Generation};
pub use metrics::{CounterSink, EventKind, EventSink, NoopSink};
pub use runtime::{EgressReceiver, Engine, EngineConfig};
pub use status::{EngineState, EngineStatus};
pub use table::{Consumer, HandlerArena, HandlerKey, StreamTables};
pub use timer::{Expired, TimerQueue};
pub use worker::{EgressFrame, Worker, WorkerStats};
