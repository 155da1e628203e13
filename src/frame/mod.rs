//! # Frame Model
//!
//! Binary representation of stream events. Every frame starts with a
//! [`FrameHeader`] (52 bytes, little-endian) followed by a type-specific tail.
//! Frames are decoded into [`Frame`] views that borrow the caller's buffer and
//! encoded either with [`Frame::encode`] or the staged [`FrameBuilder`].
//!
//! Type ids with bit `0x4000_0000` set are throttle frames: they flow from the
//! reader of a half-stream back to its writer.

mod builder;
mod error;
mod extension;
mod header;
mod types;

pub use builder::{FrameBuilder, Staged, TailStage};
pub use error::{FrameError, FrameResult};
pub use extension::ProxyBeginEx;
pub use header::{FrameHeader, HEADER_SIZE};
pub use types::{
    BeginFrame, ControlFrame, DataFrame, FlushFrame, Frame, SignalFrame, WindowFrame,
};

/// Marks frames flowing against the data direction.
pub const THROTTLE_BIT: u32 = 0x4000_0000;

/// Begin type id.
pub const BEGIN: u32 = 0x0000_0001;
/// Data type id.
pub const DATA: u32 = 0x0000_0002;
/// End type id.
pub const END: u32 = 0x0000_0003;
/// Abort type id.
pub const ABORT: u32 = 0x0000_0004;
/// Flush type id.
pub const FLUSH: u32 = 0x0000_0005;
/// Reset type id.
pub const RESET: u32 = 0x4000_0001;
/// Window type id.
pub const WINDOW: u32 = 0x4000_0002;
/// Signal type id.
pub const SIGNAL: u32 = 0x4000_0003;
/// Challenge type id.
pub const CHALLENGE: u32 = 0x4000_0004;

/// Data frame flag bits.
pub mod data_flags {
    /// Last fragment of a message.
    pub const FIN: u8 = 0x01;
    /// First fragment of a message.
    pub const INIT: u8 = 0x02;
    /// Payload is incomplete.
    pub const INCOMPLETE: u8 = 0x04;
    /// Receiver may skip the payload.
    pub const SKIP: u8 = 0x08;
}

/// Whether `type_id` is a throttle frame.
#[must_use]
pub fn is_throttle(type_id: u32) -> bool {
    type_id & THROTTLE_BIT != 0
}

/// Whether `type_id` names a known frame type.
#[must_use]
pub fn is_known_type(type_id: u32) -> bool {
    matches!(
        type_id,
        BEGIN | DATA | END | ABORT | FLUSH | RESET | WINDOW | SIGNAL | CHALLENGE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_classification() {
        for type_id in [BEGIN, DATA, END, ABORT, FLUSH] {
            assert!(!is_throttle(type_id));
        }
        for type_id in [RESET, WINDOW, SIGNAL, CHALLENGE] {
            assert!(is_throttle(type_id));
        }
    }
}
