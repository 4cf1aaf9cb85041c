//! # Clustersync
//!
//! Keeps a cluster of render processes in lock-step and replicates shared
//! state from one primary process to the rest.
//!
//! ## Overview
//!
//! - **[`SyncNode`]**: full-mesh connections between a fixed, ordered list
//!   of processes and routing of messages to registered protocols.
//! - **[`RunSync`]**: a barrier. Every process calls `wait()` once per
//!   frame; nobody leaves a frame before every connected peer entered it.
//! - **[`DataSync`]**: replication of [`SyncValue`] containers written on
//!   the primary, made visible everywhere by `update()`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use clustersync::{synced, DataSync, NodeConfig, RunSync, SyncNode};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let peers = ["127.0.0.1:9000", "127.0.0.1:9001", "127.0.0.1:9002"];
//! let mut node = SyncNode::with_config(NodeConfig::new(peers, 0));
//!
//! let run_sync = node.get_or_add_protocol::<RunSync>()?;
//! let data_sync = node.get_or_add_protocol::<DataSync>()?;
//! let frame = synced(&data_sync, 0i64)?;
//!
//! node.initialize()?;
//! node.wait_for_connection()?;
//!
//! for n in 0.. {
//!     // Only node 0, the primary, may write.
//!     frame.set(n)?;
//!     run_sync.wait()?;
//!     data_sync.update();
//!     assert_eq!(frame.get(), n);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Re-exports
//!
//! - `clustersync::core` - frames, peer indices and addresses
//! - `clustersync::node` - the node, its configuration and the protocol trait

pub mod codec;
pub mod data_sync;
pub mod error;
pub mod run_sync;
pub mod value;

pub use clustersync_core as core;
pub use clustersync_node as node;

pub use codec::{Cbor, FixedWidth, SyncCodec};
pub use data_sync::{DataSync, SyncData, MAX_CONTAINERS};
pub use error::{ProtocolError, Result};
pub use run_sync::RunSync;
pub use value::{
    synced, SyncBool, SyncBoolVec, SyncCbor, SyncFloat32, SyncFloat32Vec, SyncFloat64,
    SyncFloat64Vec, SyncInt32, SyncInt32Vec, SyncInt64, SyncInt64Vec, SyncValue,
};

pub use clustersync_core::{Message, PeerAddress, PeerIdx};
pub use clustersync_node::{NodeConfig, PeerState, Protocol, SyncError, SyncHandle, SyncNode};
