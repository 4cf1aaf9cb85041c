//! Lock-step barrier across the cluster.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use clustersync_core::{Message, PeerIdx};
use clustersync_node::{Protocol, Result, SyncError, SyncHandle};

/// How often a blocked [`RunSync::wait`] rechecks the connected set, so
/// that peers which connect or drop while waiting are noticed.
const RECHECK_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
struct BarrierState {
    /// Local generation; the number of completed or running `wait()` calls.
    generation: u64,
    /// Latest generation announced by each peer.
    announced: HashMap<PeerIdx, u64>,
    /// Peers whose connection dropped or was replaced since they were
    /// last told our generation.
    reconnecting: BTreeSet<PeerIdx>,
    closed: bool,
}

/// Barrier protocol: every node calls [`wait`](Self::wait) once per frame
/// and none returns until all connected peers have reached the same call.
///
/// Each `wait()` bumps the local generation and announces it. The call
/// returns once every *currently connected* peer has announced at least
/// that generation. A peer that drops is excluded, so one crashed node
/// cannot wedge the others.
///
/// Only one thread per node may call `wait()`.
#[derive(Debug, Default)]
pub struct RunSync {
    node: OnceLock<SyncHandle>,
    state: Mutex<BarrierState>,
    arrived: Condvar,
}

impl RunSync {
    pub const PROTOCOL_ID: u8 = 10;

    pub fn new() -> Self {
        Self::default()
    }

    /// The local generation.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// The latest generation `peer` has announced since it connected.
    pub fn peer_generation(&self, peer: PeerIdx) -> Option<u64> {
        self.state.lock().announced.get(&peer).copied()
    }

    /// Block until every connected peer reaches this barrier.
    ///
    /// Fails with [`SyncError::PeerDisconnected`] under the node's
    /// exit-on-disconnect policy, and with [`SyncError::Closed`] once the
    /// node shuts down.
    pub fn wait(&self) -> Result<()> {
        let node = self.node.get().ok_or(SyncError::NotInitialized)?;

        let generation = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SyncError::Closed);
            }
            state.generation += 1;
            state.reconnecting.clear();
            state.generation
        };

        let mut told = node.connected_peers()?;
        tracing::trace!(local = ?node.local_peer_idx(), generation, "announcing barrier");
        node.send_message(announcement(generation, None));

        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(SyncError::Closed);
            }

            let connected = node.connected_peers()?;
            let behind = pending(&state, &connected, generation);
            if behind == 0 {
                break;
            }

            // Peers that connected after the broadcast, or on a new
            // connection since, never saw it.
            for peer in std::mem::take(&mut state.reconnecting) {
                told.remove(&peer);
            }
            for peer in connected.difference(&told) {
                node.send_message(announcement(generation, Some(*peer)));
            }
            told = connected;

            tracing::trace!(generation, behind, "waiting for peers");
            self.arrived.wait_for(&mut state, RECHECK_INTERVAL);
        }

        tracing::trace!(generation, "done waiting");
        Ok(())
    }
}

fn announcement(generation: u64, to: Option<PeerIdx>) -> Message {
    let payload = generation.to_be_bytes().to_vec();
    match to {
        Some(peer) => Message::to_peer(peer, RunSync::PROTOCOL_ID, payload),
        None => Message::broadcast(RunSync::PROTOCOL_ID, payload),
    }
}

/// Number of connected peers still below `generation`.
fn pending(state: &BarrierState, connected: &BTreeSet<PeerIdx>, generation: u64) -> usize {
    connected
        .iter()
        .filter(|peer| state.announced.get(peer).map_or(true, |g| *g < generation))
        .count()
}

impl Protocol for RunSync {
    fn protocol_id(&self) -> u8 {
        Self::PROTOCOL_ID
    }

    fn attach(&self, node: SyncHandle) {
        if self.node.set(node).is_err() {
            tracing::warn!("RunSync is already attached to a node; ignoring");
        }
    }

    fn process_message(&self, message: Message) {
        let Ok(raw) = <[u8; 8]>::try_from(message.payload.as_ref()) else {
            tracing::error!(from = %message.from, len = message.payload.len(), "corrupt barrier message");
            return;
        };
        let generation = u64::from_be_bytes(raw);

        let mut state = self.state.lock();
        let previous = state.announced.insert(message.from, generation);
        match previous {
            Some(previous) if previous == generation => {
                tracing::debug!(from = %message.from, generation, "peer announced the same barrier twice");
                return;
            }
            // Connections are ordered, so a lower generation means the
            // peer process restarted.
            Some(previous) if previous > generation => {
                tracing::info!(from = %message.from, previous, generation, "peer restarted its barrier count")
            }
            _ => {}
        }
        tracing::trace!(from = %message.from, generation, "peer reached barrier");
        self.arrived.notify_all();
    }

    fn lost_peer(&self, peer: PeerIdx) {
        let mut state = self.state.lock();
        state.announced.remove(&peer);
        state.reconnecting.insert(peer);
        self.arrived.notify_all();
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.arrived.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from(peer: u8, generation: u64) -> Message {
        announcement(generation, None).with_sender(PeerIdx(peer))
    }

    #[test]
    fn test_announcement_layout() {
        let message = announcement(258, None);
        assert_eq!(message.protocol_id, RunSync::PROTOCOL_ID);
        assert!(message.is_broadcast());
        assert_eq!(message.payload.as_ref(), &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(announcement(1, Some(PeerIdx(3))).to, Some(PeerIdx(3)));
    }

    #[test]
    fn test_records_latest_generation() {
        let sync = RunSync::new();
        sync.process_message(from(1, 1));
        sync.process_message(from(1, 3));
        sync.process_message(from(1, 3));
        sync.process_message(from(2, 1));

        assert_eq!(sync.peer_generation(PeerIdx(1)), Some(3));
        assert_eq!(sync.peer_generation(PeerIdx(2)), Some(1));
        assert_eq!(sync.peer_generation(PeerIdx(3)), None);

        // A restarted peer counts from one again.
        sync.process_message(from(1, 1));
        assert_eq!(sync.peer_generation(PeerIdx(1)), Some(1));
    }

    #[test]
    fn test_corrupt_message_is_ignored() {
        let sync = RunSync::new();
        sync.process_message(Message::broadcast(RunSync::PROTOCOL_ID, vec![1, 0]).with_sender(PeerIdx(1)));
        assert_eq!(sync.peer_generation(PeerIdx(1)), None);
    }

    #[test]
    fn test_lost_peer_is_forgotten() {
        let sync = RunSync::new();
        sync.process_message(from(2, 5));
        sync.lost_peer(PeerIdx(2));
        assert_eq!(sync.peer_generation(PeerIdx(2)), None);
        assert!(sync.state.lock().reconnecting.contains(&PeerIdx(2)));
    }

    #[test]
    fn test_pending_counts_connected_peers_behind() {
        let sync = RunSync::new();
        sync.process_message(from(0, 2));
        sync.process_message(from(2, 1));
        let connected: BTreeSet<_> = [PeerIdx(0), PeerIdx(2), PeerIdx(3)].into_iter().collect();

        let state = sync.state.lock();
        assert_eq!(pending(&state, &connected, 1), 1);
        assert_eq!(pending(&state, &connected, 2), 2);
        assert_eq!(pending(&state, &BTreeSet::new(), 9), 0);
    }

    #[test]
    fn test_wait_requires_registration() {
        let sync = RunSync::new();
        assert!(matches!(sync.wait(), Err(SyncError::NotInitialized)));
        assert_eq!(sync.generation(), 0);
    }

    #[test]
    fn test_wait_after_close() {
        let sync = RunSync::new();
        sync.attach(SyncHandle::detached());
        sync.close();
        assert!(matches!(sync.wait(), Err(SyncError::Closed)));
    }

    #[test]
    fn test_wait_on_dropped_node() {
        let sync = RunSync::new();
        sync.attach(SyncHandle::detached());
        assert!(matches!(sync.wait(), Err(SyncError::Closed)));
    }
}
