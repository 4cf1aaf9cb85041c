//! Error types for the bundled protocols.

use clustersync_core::PeerIdx;
use clustersync_node::SyncError;
use thiserror::Error;

/// Errors raised by [`DataSync`](crate::DataSync) and replicated values.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Only the primary node may write replicated values.
    #[error("peer {local} is not the primary ({primary}); replicated values are read-only here")]
    NotPrimary { local: PeerIdx, primary: PeerIdx },

    /// A received value could not be decoded.
    #[error("cannot decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },

    /// A value could not be encoded.
    #[error("cannot encode value: {0}")]
    Encode(String),

    /// Container indices travel as one byte.
    #[error("at most {max} containers can be synchronized")]
    TooManyContainers { max: usize },

    /// A container belongs to one synchronizer only.
    #[error("container is already bound to a data synchronizer")]
    AlreadyBound,

    /// Node-level failure.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
