//! The protocol capability set and the node back-reference handed to it.
//!
//! A protocol is a message handler keyed by a one-byte id. The node routes
//! every received message whose id matches to [`Protocol::process_message`],
//! always on the reactor thread and never while holding a node lock, so a
//! protocol may call back into the node (e.g. to reply).

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use clustersync_core::{Message, PeerIdx};

use crate::error::{Result, SyncError};
use crate::node::NodeShared;

/// Type-erasure helper that lets `Arc<dyn Protocol>` be downcast to the
/// concrete protocol type. Implemented for every eligible type.
pub trait ProtocolAny: Any + Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> ProtocolAny for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A pluggable message handler registered with a [`SyncNode`](crate::SyncNode).
///
/// Callbacks run on the reactor thread and must return promptly; heavy
/// work belongs on the application thread.
pub trait Protocol: ProtocolAny {
    /// The id carried in the header of every message of this protocol.
    /// Must be at least [`FIRST_USER_PROTOCOL_ID`](clustersync_core::FIRST_USER_PROTOCOL_ID).
    fn protocol_id(&self) -> u8;

    /// Called once when the protocol is registered.
    fn attach(&self, node: SyncHandle);

    /// A complete message for this protocol arrived.
    fn process_message(&self, message: Message);

    /// The connection to `peer` was lost, or replaced by a new one from
    /// the same peer. A notification only.
    fn lost_peer(&self, _peer: PeerIdx) {}

    /// The node is shutting down. Best-effort cleanup; wake any waiters.
    fn close(&self) {}
}

/// Weak back-reference from a protocol to its node.
///
/// Holding a handle does not keep the node alive; once the node is torn
/// down every operation degrades to a no-op or [`SyncError::Closed`].
#[derive(Clone, Default)]
pub struct SyncHandle {
    shared: Weak<NodeShared>,
}

impl SyncHandle {
    pub(crate) fn new(shared: &Arc<NodeShared>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    /// A handle bound to no node, for protocols used standalone.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Send to one peer or broadcast. Never blocks.
    pub fn send_message(&self, message: Message) {
        match self.shared.upgrade() {
            Some(shared) => shared.send_message(message),
            None => tracing::debug!(
                protocol_id = message.protocol_id,
                "dropping message from a protocol whose node is gone"
            ),
        }
    }

    /// Index of the local node, once initialized.
    pub fn local_peer_idx(&self) -> Option<PeerIdx> {
        self.shared.upgrade().and_then(|s| s.local_peer_idx())
    }

    /// Number of peers, not counting the local one.
    pub fn peers_count(&self) -> usize {
        self.shared.upgrade().map_or(0, |s| s.peers_count())
    }

    /// Indices of the peers currently connected. Applies the node's
    /// exit-on-disconnect policy.
    pub fn connected_peers(&self) -> Result<BTreeSet<PeerIdx>> {
        let shared = self.shared.upgrade().ok_or(SyncError::Closed)?;
        shared.connected_peers()
    }

    /// Whether the node was shut down or dropped.
    pub fn is_closed(&self) -> bool {
        self.shared.upgrade().map_or(true, |s| s.is_stopped())
    }
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("local_peer_idx", &self.local_peer_idx())
            .field("closed", &self.is_closed())
            .finish()
    }
}
