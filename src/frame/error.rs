//! Frame codec error types.

use thiserror::Error;

/// Errors raised while decoding or encoding frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// A field or declared length runs past the readable region.
    #[error("malformed frame: need {needed} bytes at offset {offset}, limit is {limit}")]
    Malformed {
        /// Offset of the field that could not be read.
        offset: usize,
        /// Bytes required by the field.
        needed: usize,
        /// End of the readable region.
        limit: usize,
    },

    /// The type id is not one of the known frame types.
    #[error("unknown frame type id {0:#010x}")]
    UnknownType(u32),

    /// The destination buffer cannot hold the encoded frame.
    #[error("frame of {needed} bytes does not fit in {capacity} bytes")]
    Overflow {
        /// Total encoded size.
        needed: usize,
        /// Bytes available in the destination.
        capacity: usize,
    },

    /// A variable-length field is larger than its length prefix allows.
    #[error("{field} of {length} bytes exceeds the maximum of {max}")]
    FieldTooLarge {
        /// Field name.
        field: &'static str,
        /// Actual length.
        length: usize,
        /// Largest encodable length.
        max: usize,
    },

    /// A Begin extension could not be decoded.
    #[error("invalid begin extension: {message}")]
    InvalidExtension {
        /// Error message.
        message: String,
    },
}

/// Result type alias for frame operations.
pub type FrameResult<T> = Result<T, FrameError>;
