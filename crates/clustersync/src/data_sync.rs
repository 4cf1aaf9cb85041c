//! Primary-to-replica replication of registered value containers.

use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use clustersync_core::{Message, PeerIdx};
use clustersync_node::{Protocol, SyncError, SyncHandle};

use crate::error::{ProtocolError, Result};

/// Containers are addressed by a one-byte index.
pub const MAX_CONTAINERS: usize = 256;

/// A double-buffered container that a [`DataSync`] can replicate.
///
/// Implemented by [`SyncValue`](crate::SyncValue); implement it for a
/// custom container only if it keeps the same front/back semantics.
pub trait SyncData: Send + Sync {
    /// Record the owning synchronizer and this container's index.
    /// Fails if the container is already bound.
    fn bind(&self, sync: Weak<DataSync>, idx: u8) -> Result<()>;

    /// Store an encoded value in the back buffer.
    fn decode(&self, bytes: &[u8]) -> Result<()>;

    /// Make the back value visible.
    fn update(&self);
}

/// Replicates values written on the primary node to every other node.
///
/// Every node registers the same containers in the same order with
/// [`add_data`](Self::add_data). Writes on the primary are broadcast
/// immediately; on every node, primary included, they become readable
/// after the next [`update`](Self::update). Pair `update()` with
/// [`RunSync::wait`](crate::RunSync::wait) so all nodes swap in the same
/// frame.
pub struct DataSync {
    primary: PeerIdx,
    node: OnceLock<SyncHandle>,
    containers: Mutex<Vec<Arc<dyn SyncData>>>,
}

impl Default for DataSync {
    fn default() -> Self {
        Self::with_primary(PeerIdx(0))
    }
}

impl DataSync {
    pub const PROTOCOL_ID: u8 = 11;

    /// A synchronizer whose primary is node 0.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_primary(primary: PeerIdx) -> Self {
        Self {
            primary,
            node: OnceLock::new(),
            containers: Mutex::new(Vec::new()),
        }
    }

    pub fn primary(&self) -> PeerIdx {
        self.primary
    }

    /// Number of registered containers.
    pub fn len(&self) -> usize {
        self.containers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a container. Its index is its registration position.
    pub fn add_data(self: &Arc<Self>, data: Arc<dyn SyncData>) -> Result<()> {
        let mut containers = self.containers.lock();
        let idx = u8::try_from(containers.len()).map_err(|_| ProtocolError::TooManyContainers {
            max: MAX_CONTAINERS,
        })?;
        data.bind(Arc::downgrade(self), idx)?;
        containers.push(data);
        tracing::debug!(idx, "added synchronized data");
        Ok(())
    }

    /// Make every container's latest received or written value visible.
    /// Atomic with respect to incoming values.
    pub fn update(&self) {
        let containers = self.containers.lock();
        for data in containers.iter() {
            data.update();
        }
    }

    /// The node handle to broadcast through, or `None` when this
    /// synchronizer is not registered with a node and values stay local.
    pub(crate) fn writer(&self) -> Result<Option<&SyncHandle>> {
        let Some(node) = self.node.get() else {
            return Ok(None);
        };
        if node.is_closed() {
            return Err(SyncError::Closed.into());
        }
        let local = node.local_peer_idx().ok_or(SyncError::NotInitialized)?;
        if local != self.primary {
            return Err(ProtocolError::NotPrimary {
                local,
                primary: self.primary,
            });
        }
        Ok(Some(node))
    }

    /// Broadcast the encoded value of container `idx`.
    pub(crate) fn send(node: &SyncHandle, payload: Bytes) {
        node.send_message(Message::broadcast(Self::PROTOCOL_ID, payload));
    }
}

impl Protocol for DataSync {
    fn protocol_id(&self) -> u8 {
        Self::PROTOCOL_ID
    }

    fn attach(&self, node: SyncHandle) {
        if self.node.set(node).is_err() {
            tracing::warn!("DataSync is already attached to a node; ignoring");
        }
    }

    fn process_message(&self, message: Message) {
        if message.from != self.primary {
            tracing::warn!(
                from = %message.from,
                primary = %self.primary,
                "dropping data from a peer that is not the primary"
            );
            return;
        }

        let Some((&idx, value)) = message.payload.split_first() else {
            tracing::error!(from = %message.from, "empty data message");
            return;
        };

        let containers = self.containers.lock();
        let Some(data) = containers.get(usize::from(idx)) else {
            tracing::error!(
                idx,
                registered = containers.len(),
                "wrong data index, peers may not agree on data to synchronize"
            );
            return;
        };

        tracing::trace!(from = %message.from, idx, "incoming data");
        if let Err(error) = data.decode(value) {
            tracing::error!(from = %message.from, idx, %error, "cannot decode synchronized data");
        }
    }
}

impl std::fmt::Debug for DataSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSync")
            .field("primary", &self.primary)
            .field("containers", &self.len())
            .finish()
    }
}
