//! # Flow Control
//!
//! Credit-based backpressure for a single half-stream. A writer may have at
//! most `maximum` bytes unacknowledged; the reader moves `acknowledge`
//! forward with Window frames as it consumes.

mod error;
mod ledger;

pub use error::{FlowError, FlowResult};
pub use ledger::FlowLedger;
