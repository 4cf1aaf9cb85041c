//! Error types for the wire primitives.

use thiserror::Error;

/// Errors raised while parsing addresses or decoding frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// A peer address string could not be parsed.
    #[error("invalid peer address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// A frame announced a payload larger than the accepted maximum.
    #[error("payload of {len} bytes exceeds the limit of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    /// A buffer ended before the announced frame was complete.
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    /// A control message (handshake, ping, pong) had the wrong shape.
    #[error("malformed {kind} payload of {len} bytes")]
    MalformedControl { kind: &'static str, len: usize },
}

/// Result type for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;
