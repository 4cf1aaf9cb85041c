//! # Clustersync Node
//!
//! Full-mesh TCP connectivity between a fixed, ordered list of processes,
//! plus routing of messages to pluggable [`Protocol`]s.
//!
//! Every node is configured with the same peer list. A node accepts
//! connections from the peers listed before it and dials the ones listed
//! after it, so each pair shares exactly one connection. All socket work
//! happens on one reactor thread per node; the application thread only
//! configures, queries and sends.
//!
//! ## Connection lifecycle
//!
//! 1. The dialing side writes a handshake `{ index, version }`.
//! 2. The accepting side checks the version and index, then answers with
//!    its own handshake. Both ends are now connected.
//! 3. Each side pings after half the timeout delay without traffic and
//!    drops the connection after a full timeout delay of silence.
//! 4. A dropped beta connection is redialed after [`RECONNECT_DELAY`].

pub mod config;
pub mod error;
pub mod node;
pub mod peer;
pub mod protocol;
mod reactor;

pub use config::{NodeConfig, DEFAULT_TIMEOUT_DELAY, INITIAL_CONNECT_DELAY, RECONNECT_DELAY};
pub use error::{Result, SyncError};
pub use node::SyncNode;
pub use peer::{PeerRole, PeerState};
pub use protocol::{Protocol, ProtocolAny, SyncHandle};

pub use clustersync_core::{Message, PeerAddress, PeerIdx};
