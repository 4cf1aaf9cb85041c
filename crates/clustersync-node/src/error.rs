//! Error types for the node.

use clustersync_core::{PeerIdx, WireError};
use thiserror::Error;

/// Errors that can occur while configuring or running a [`SyncNode`](crate::SyncNode).
#[derive(Debug, Error)]
pub enum SyncError {
    /// No peer addresses were configured.
    #[error("cannot connect: no peer addresses configured")]
    NoPeers,

    /// More peers than fit in a one-byte index.
    #[error("{count} peers configured, at most {max} are supported")]
    TooManyPeers { count: usize, max: usize },

    /// The local index does not name a configured peer.
    #[error("invalid local peer idx {idx:?} for {peers} configured peers")]
    InvalidLocalPeerIdx { idx: Option<usize>, peers: usize },

    /// The keepalive timeout is not a positive number of seconds.
    #[error("invalid timeout delay: {0} s")]
    InvalidTimeout(f32),

    /// Configuration changed after `initialize()`.
    #[error("node is already initialized")]
    AlreadyInitialized,

    /// Operation requires `initialize()` first.
    #[error("node is not initialized")]
    NotInitialized,

    /// A peer address did not resolve.
    #[error("cannot resolve {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The local address could not be listened on.
    #[error("cannot listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("config error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// A protocol with this name is already registered.
    #[error("there is already a protocol named {0}")]
    DuplicateProtocolName(String),

    /// A protocol with this id is already registered.
    #[error("there is already a protocol with id {0}")]
    DuplicateProtocolId(u8),

    /// User protocols must use ids outside the internal range.
    #[error("protocol id {0} is reserved for internal protocols")]
    ReservedProtocolId(u8),

    /// The name is bound to a protocol of another type.
    #[error("protocol {0} exists but has the wrong type")]
    ProtocolTypeMismatch(String),

    /// A previously connected peer dropped while the node is configured
    /// to exit in that case.
    #[error("peer {peer} disconnected; exit requested")]
    PeerDisconnected { peer: PeerIdx },

    /// Remote end speaks another networking version.
    #[error("protocol version mismatch: local={local}, peer={peer}")]
    VersionMismatch { local: u8, peer: u8 },

    /// Handshake named another peer than the one dialed, or one that is
    /// not ours to accept.
    #[error("unexpected peer in handshake: expected {expected}, got {got}")]
    UnexpectedPeer { expected: String, got: PeerIdx },

    /// A message other than the handshake arrived first.
    #[error("expected handshake, got protocol id {0}")]
    UnexpectedMessage(u8),

    /// The peer stayed silent for the whole timeout delay.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The node has been shut down.
    #[error("sync node is closed")]
    Closed,

    /// Frame or address decoding failed.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Socket or runtime I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, SyncError>;
