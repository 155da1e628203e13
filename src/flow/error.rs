//! Flow-control error types.

use thiserror::Error;

/// Violations of the half-stream flow-control invariant
/// `0 <= sequence - acknowledge <= maximum`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// Reserving the bytes would exceed the granted window.
    #[error("window exceeded: sequence {sequence} + {reserved} with acknowledge {acknowledge} exceeds maximum {maximum}")]
    WindowExceeded {
        /// Sequence before the reservation.
        sequence: u64,
        /// Acknowledge at the time of the reservation.
        acknowledge: u64,
        /// Granted window.
        maximum: u32,
        /// Bytes the frame tried to reserve.
        reserved: u64,
    },

    /// A window moved acknowledge backwards.
    #[error("acknowledge regressed from {current} to {proposed}")]
    AcknowledgeRegressed {
        /// Acknowledge already recorded.
        current: u64,
        /// Acknowledge carried by the window.
        proposed: u64,
    },

    /// A window acknowledged bytes that were never sent.
    #[error("acknowledge {acknowledge} is ahead of sequence {sequence}")]
    AcknowledgeAhead {
        /// Acknowledge carried by the window.
        acknowledge: u64,
        /// Current sequence.
        sequence: u64,
    },

    /// A window shrank below the bytes already in flight.
    #[error("window {maximum} is smaller than {outstanding} bytes in flight")]
    WindowShrunk {
        /// Bytes sent but not yet acknowledged.
        outstanding: u64,
        /// Proposed window.
        maximum: u32,
    },

    /// A frame's sequence does not match the receiver's ledger.
    #[error("sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch {
        /// Sequence tracked by the receiver.
        expected: u64,
        /// Sequence carried by the frame.
        actual: u64,
    },
}

/// Result type alias for flow-control operations.
pub type FlowResult<T> = Result<T, FlowError>;
