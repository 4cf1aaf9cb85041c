//! The cluster node: configuration, connectivity queries and message routing.
//!
//! [`SyncNode`] is the owner handle used by the application thread. The
//! connection tasks and registered protocols only see the shared state
//! behind it ([`NodeShared`]), through an `Arc` or a weak [`SyncHandle`].
//!
//! Lock order is node registry, then peer. No lock is held while a
//! protocol callback runs.

use std::any::type_name;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::net::TcpSocket;

use clustersync_core::control::is_reserved;
use clustersync_core::{limits, Message, PeerAddress, PeerIdx};

use crate::config::NodeConfig;
use crate::error::{Result, SyncError};
use crate::peer::{Peer, PeerRole, PeerState};
use crate::protocol::{Protocol, SyncHandle};
use crate::reactor::Reactor;

/// Peer slots and timing, fixed at `initialize()`.
pub(crate) struct Topology {
    pub(crate) local: PeerIdx,
    /// Slots `0..local`, accepted inbound.
    pub(crate) alpha: Vec<Arc<Peer>>,
    /// Slots `local+1..`, dialed outbound. Slot `i` is at `i - local - 1`.
    pub(crate) beta: Vec<Arc<Peer>>,
    pub(crate) timeout: Duration,
    pub(crate) protocol_version: u8,
}

impl Topology {
    pub(crate) fn peers(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.alpha.iter().chain(self.beta.iter())
    }

    pub(crate) fn peer(&self, idx: PeerIdx) -> Option<&Arc<Peer>> {
        if idx < self.local {
            self.alpha.get(idx.as_usize())
        } else if idx > self.local {
            self.beta.get(idx.as_usize() - self.local.as_usize() - 1)
        } else {
            None
        }
    }

    pub(crate) fn peers_count(&self) -> usize {
        self.alpha.len() + self.beta.len()
    }
}

#[derive(Default)]
struct Registry {
    protocols: HashMap<u8, Arc<dyn Protocol>>,
    names: HashMap<String, u8>,
    /// Messages for ids with no handler yet, oldest first.
    unprocessed: VecDeque<Message>,
    /// Ids registered but still receiving their backlog. New messages for
    /// them queue behind it.
    draining: HashSet<u8>,
    /// Peers seen connected at least once.
    ever_connected: BTreeSet<PeerIdx>,
    stopped: bool,
}

/// State shared between the owner, the connection tasks and protocols.
pub(crate) struct NodeShared {
    topology: OnceLock<Arc<Topology>>,
    registry: Mutex<Registry>,
    changed: Condvar,
    exit_when_a_peer_is_disconnected: AtomicBool,
}

impl NodeShared {
    fn new(exit_when_a_peer_is_disconnected: bool) -> Self {
        Self {
            topology: OnceLock::new(),
            registry: Mutex::new(Registry::default()),
            changed: Condvar::new(),
            exit_when_a_peer_is_disconnected: AtomicBool::new(exit_when_a_peer_is_disconnected),
        }
    }

    pub(crate) fn topology(&self) -> Option<&Arc<Topology>> {
        self.topology.get()
    }

    pub(crate) fn local_peer_idx(&self) -> Option<PeerIdx> {
        self.topology().map(|t| t.local)
    }

    pub(crate) fn peers_count(&self) -> usize {
        self.topology().map_or(0, |t| t.peers_count())
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.registry.lock().stopped
    }

    /// Stamp the local index and queue on the target connection(s).
    pub(crate) fn send_message(&self, mut message: Message) {
        let Some(topo) = self.topology() else {
            tracing::debug!(protocol_id = message.protocol_id, "dropping message sent before initialize");
            return;
        };

        message.from = topo.local;
        let frame = message.encode();

        match message.to {
            None => {
                for peer in topo.peers() {
                    peer.send(frame.clone());
                }
            }
            Some(target) => match topo.peer(target) {
                Some(peer) => {
                    peer.send(frame);
                }
                None => tracing::warn!(
                    local = %topo.local,
                    target = %target,
                    protocol_id = message.protocol_id,
                    "trying to send a message to an invalid peer"
                ),
            },
        }
    }

    /// Connected peers, applying the exit-on-disconnect policy.
    pub(crate) fn connected_peers(&self) -> Result<BTreeSet<PeerIdx>> {
        let topo = self.topology().ok_or(SyncError::NotInitialized)?;
        let exit_on_loss = self.exit_when_a_peer_is_disconnected.load(Ordering::Relaxed);

        let mut registry = self.registry.lock();
        let mut connected = BTreeSet::new();
        let mut lost = None;
        for peer in topo.peers() {
            if peer.is_connected() {
                connected.insert(peer.idx());
                registry.ever_connected.insert(peer.idx());
            } else if registry.ever_connected.contains(&peer.idx()) && lost.is_none() {
                lost = Some(peer.idx());
            }
        }

        match lost {
            Some(peer) if exit_on_loss => Err(SyncError::PeerDisconnected { peer }),
            _ => Ok(connected),
        }
    }

    fn connected_count(&self, topo: &Topology) -> usize {
        topo.peers().filter(|p| p.is_connected()).count()
    }

    /// Block until every peer is connected or the node is stopped.
    pub(crate) fn wait_for_connection(&self) -> Result<()> {
        let topo = self.topology().ok_or(SyncError::NotInitialized)?;

        let mut registry = self.registry.lock();
        loop {
            if registry.stopped {
                return Ok(());
            }
            if self.connected_count(topo) == topo.peers_count() {
                return Ok(());
            }
            self.changed.wait(&mut registry);
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        match self.topology() {
            Some(topo) => !self.is_stopped() && self.connected_count(topo) == topo.peers_count(),
            None => false,
        }
    }

    pub(crate) fn peer_connected(&self, idx: PeerIdx) {
        let mut registry = self.registry.lock();
        registry.ever_connected.insert(idx);
        self.changed.notify_all();
    }

    /// A session ended. Wake waiters and tell every protocol.
    pub(crate) fn peer_lost(&self, idx: PeerIdx) {
        let protocols: Vec<_> = {
            let registry = self.registry.lock();
            self.changed.notify_all();
            registry.protocols.values().cloned().collect()
        };
        for protocol in protocols {
            protocol.lost_peer(idx);
        }
    }

    /// Hand a received message to its protocol, or hold it until one
    /// registers.
    pub(crate) fn route_message(&self, message: Message) {
        let handler = {
            let mut registry = self.registry.lock();
            if registry.stopped {
                return;
            }
            let id = message.protocol_id;
            let registered = if registry.draining.contains(&id) {
                None
            } else {
                registry.protocols.get(&id).cloned()
            };
            match registered {
                Some(protocol) => protocol,
                None => {
                    if registry.unprocessed.len() >= limits::UNPROCESSED_CAPACITY {
                        if let Some(dropped) = registry.unprocessed.pop_front() {
                            tracing::warn!(
                                protocol_id = dropped.protocol_id,
                                from = %dropped.from,
                                "unprocessed message buffer full, dropping oldest message"
                            );
                        }
                    }
                    tracing::debug!(protocol_id = id, "holding message for unregistered protocol");
                    registry.unprocessed.push_back(message);
                    return;
                }
            }
        };
        handler.process_message(message);
    }

    fn add_protocol(self: &Arc<Self>, name: &str, protocol: Arc<dyn Protocol>) -> Result<()> {
        let id = protocol.protocol_id();
        {
            let mut registry = self.registry.lock();
            if registry.names.contains_key(name) {
                return Err(SyncError::DuplicateProtocolName(name.to_string()));
            }
            if is_reserved(id) {
                return Err(SyncError::ReservedProtocolId(id));
            }
            if registry.protocols.contains_key(&id) {
                return Err(SyncError::DuplicateProtocolId(id));
            }
            registry.names.insert(name.to_string(), id);
            registry.protocols.insert(id, Arc::clone(&protocol));
            registry.draining.insert(id);
        }

        tracing::debug!(name, protocol_id = id, "adding protocol");
        protocol.attach(SyncHandle::new(self));

        // Deliver the backlog in arrival order. Messages arriving meanwhile
        // are queued behind it until `draining` is cleared.
        loop {
            let backlog: VecDeque<Message> = {
                let mut registry = self.registry.lock();
                let (matching, rest): (VecDeque<Message>, VecDeque<Message>) =
                    std::mem::take(&mut registry.unprocessed)
                        .into_iter()
                        .partition(|m| m.protocol_id == id);
                registry.unprocessed = rest;
                if matching.is_empty() {
                    registry.draining.remove(&id);
                    return Ok(());
                }
                matching
            };
            tracing::debug!(protocol_id = id, count = backlog.len(), "delivering held messages");
            for message in backlog {
                protocol.process_message(message);
            }
        }
    }

    fn protocol_by_name(&self, name: &str) -> Option<Arc<dyn Protocol>> {
        let registry = self.registry.lock();
        let id = registry.names.get(name)?;
        registry.protocols.get(id).cloned()
    }

    fn protocol_by_id(&self, id: u8) -> Option<Arc<dyn Protocol>> {
        self.registry.lock().protocols.get(&id).cloned()
    }

    fn protocols(&self) -> Vec<Arc<dyn Protocol>> {
        self.registry.lock().protocols.values().cloned().collect()
    }

    /// Mark stopped and wake every waiter. Returns false if already stopped.
    fn stop(&self) -> bool {
        let mut registry = self.registry.lock();
        if registry.stopped {
            return false;
        }
        registry.stopped = true;
        self.changed.notify_all();
        true
    }

    /// Empty the registry, returning the protocols to close.
    fn take_protocols(&self) -> Vec<Arc<dyn Protocol>> {
        let mut registry = self.registry.lock();
        registry.names.clear();
        registry.draining.clear();
        registry.unprocessed.clear();
        registry.protocols.drain().map(|(_, p)| p).collect()
    }
}

/// Downcast a registered protocol to its concrete type.
fn downcast<T: Protocol>(protocol: Arc<dyn Protocol>) -> Option<Arc<T>> {
    protocol.into_any().downcast::<T>().ok()
}

/// A member of a fully connected cluster.
///
/// Configure it, register protocols, then call [`initialize`](Self::initialize)
/// to start listening for lower-indexed peers and dialing higher-indexed
/// ones on a background reactor thread.
///
/// ```no_run
/// use clustersync_node::{NodeConfig, SyncNode};
///
/// let config = NodeConfig::new(["10.0.0.1", "10.0.0.2", "10.0.0.3"], 1);
/// let mut node = SyncNode::with_config(config);
/// node.initialize()?;
/// node.wait_for_connection()?;
/// # Ok::<(), clustersync_node::SyncError>(())
/// ```
pub struct SyncNode {
    config: NodeConfig,
    shared: Arc<NodeShared>,
    reactor: Mutex<Option<Reactor>>,
}

impl Default for SyncNode {
    fn default() -> Self {
        Self::with_config(NodeConfig::default())
    }
}

impl SyncNode {
    /// An unconfigured node.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: NodeConfig) -> Self {
        let shared = Arc::new(NodeShared::new(config.exit_when_a_peer_is_disconnected));
        Self {
            config,
            shared,
            reactor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn ensure_configurable(&self) -> Result<()> {
        if self.is_initialized() {
            return Err(SyncError::AlreadyInitialized);
        }
        Ok(())
    }

    /// Append a `host[:port]` address to the peer list.
    pub fn add_peer(&mut self, address: impl Into<String>) -> Result<()> {
        self.ensure_configurable()?;
        let address = address.into();
        PeerAddress::parse(&address)?;
        if self.config.peers.len() >= limits::MAX_PEERS {
            return Err(SyncError::TooManyPeers {
                count: self.config.peers.len() + 1,
                max: limits::MAX_PEERS,
            });
        }
        self.config.peers.push(address);
        Ok(())
    }

    pub fn set_local_peer_idx(&mut self, idx: usize) -> Result<()> {
        self.ensure_configurable()?;
        self.config.local_peer_idx = Some(idx);
        Ok(())
    }

    /// Whether `connected_peers()` reports a dropped peer as an error.
    /// Can be changed at any time.
    pub fn set_exit_when_a_peer_is_disconnected(&mut self, exit: bool) {
        self.config.exit_when_a_peer_is_disconnected = exit;
        self.shared
            .exit_when_a_peer_is_disconnected
            .store(exit, Ordering::Relaxed);
    }

    /// Seconds of silence before a peer is dropped.
    pub fn set_timeout_delay(&mut self, seconds: f32) -> Result<()> {
        self.ensure_configurable()?;
        if !(seconds.is_finite() && seconds > 0.0) {
            return Err(SyncError::InvalidTimeout(seconds));
        }
        self.config.timeout_delay = seconds;
        Ok(())
    }

    /// Override the announced networking version.
    pub fn set_protocol_version(&mut self, version: u8) -> Result<()> {
        self.ensure_configurable()?;
        self.config.protocol_version = version;
        Ok(())
    }

    pub fn local_peer_idx(&self) -> Option<PeerIdx> {
        self.shared
            .local_peer_idx()
            .or_else(|| self.config.local_peer().ok())
    }

    /// Number of peers, not counting the local one.
    pub fn peers_count(&self) -> usize {
        match self.shared.topology() {
            Some(topo) => topo.peers_count(),
            None => self.config.peers.len().saturating_sub(1),
        }
    }

    pub fn timeout_delay(&self) -> f32 {
        self.config.timeout_delay
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.topology().is_some()
    }

    /// See [`NodeConfig::fingerprint`].
    pub fn fingerprint(&self) -> String {
        self.config.fingerprint()
    }

    /// State of the connection to `idx`, or `None` for the local index,
    /// an unknown index, or before `initialize()`.
    pub fn peer_state(&self, idx: PeerIdx) -> Option<PeerState> {
        self.shared.topology()?.peer(idx).map(|p| p.state())
    }

    /// Whether `idx` is accepted or dialed, once initialized.
    pub fn peer_role(&self, idx: PeerIdx) -> Option<PeerRole> {
        self.shared.topology()?.peer(idx).map(|p| p.role())
    }

    /// Validate the configuration, resolve addresses, bind the listener and
    /// start the reactor thread. Calling it again is a no-op.
    pub fn initialize(&mut self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        if self.shared.is_stopped() {
            return Err(SyncError::Closed);
        }

        self.config.validate()?;
        let local = self.config.local_peer()?;
        let addresses = self.config.peer_addresses()?;

        let mut alpha = Vec::new();
        let mut beta = Vec::new();
        for (position, address) in addresses.iter().enumerate() {
            let idx = PeerIdx::from_usize(position).ok_or(SyncError::TooManyPeers {
                count: addresses.len(),
                max: limits::MAX_PEERS,
            })?;
            if idx < local {
                alpha.push(Arc::new(Peer::alpha(idx, address.clone())));
            } else if idx > local {
                let endpoints = resolve(address)?;
                beta.push(Arc::new(Peer::beta(idx, address.clone(), endpoints)));
            }
        }

        let local_address = &addresses[local.as_usize()];
        let bind_address = resolve(local_address)?[0];

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let listener = {
            let _guard = runtime.enter();
            listen(bind_address).map_err(|source| SyncError::Bind {
                address: bind_address.to_string(),
                source,
            })?
        };
        tracing::info!(local = %local, address = %bind_address, "listening");

        let topo = Arc::new(Topology {
            local,
            alpha,
            beta,
            timeout: self.config.timeout(),
            protocol_version: self.config.protocol_version,
        });
        if self.shared.topology.set(Arc::clone(&topo)).is_err() {
            return Err(SyncError::AlreadyInitialized);
        }

        let reactor = Reactor::start(Arc::clone(&self.shared), topo, runtime, listener)?;
        *self.reactor.lock() = Some(reactor);
        Ok(())
    }

    /// Block until every peer is connected, or the node shuts down.
    pub fn wait_for_connection(&self) -> Result<()> {
        self.shared.wait_for_connection()
    }

    /// Whether every peer is connected right now.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Indices of the peers currently connected.
    ///
    /// With `exit_when_a_peer_is_disconnected` set, a peer that was
    /// connected and dropped yields [`SyncError::PeerDisconnected`].
    pub fn connected_peers(&self) -> Result<BTreeSet<PeerIdx>> {
        self.shared.connected_peers()
    }

    /// Send to one peer or broadcast. Never blocks.
    pub fn send_message(&self, message: Message) {
        self.shared.send_message(message)
    }

    /// A weak handle for protocols and other components.
    pub fn handle(&self) -> SyncHandle {
        SyncHandle::new(&self.shared)
    }

    /// Register a protocol under a unique name and id. Messages that
    /// arrived for its id before registration are delivered first.
    pub fn add_protocol(&self, name: &str, protocol: Arc<dyn Protocol>) -> Result<()> {
        if self.shared.is_stopped() {
            return Err(SyncError::Closed);
        }
        self.shared.add_protocol(name, protocol)
    }

    pub fn protocol_by_name(&self, name: &str) -> Option<Arc<dyn Protocol>> {
        self.shared.protocol_by_name(name)
    }

    pub fn protocol_by_id(&self, id: u8) -> Option<Arc<dyn Protocol>> {
        self.shared.protocol_by_id(id)
    }

    /// The first registered protocol of type `T`.
    pub fn protocol<T: Protocol>(&self) -> Option<Arc<T>> {
        self.shared.protocols().into_iter().find_map(downcast::<T>)
    }

    /// The protocol of type `T`, registering a default instance under the
    /// type's name if there is none.
    pub fn get_or_add_protocol<T: Protocol + Default>(&self) -> Result<Arc<T>> {
        let name = type_name::<T>();
        if let Some(existing) = self.shared.protocol_by_name(name) {
            return downcast::<T>(existing)
                .ok_or_else(|| SyncError::ProtocolTypeMismatch(name.to_string()));
        }
        let protocol = Arc::new(T::default());
        self.add_protocol(name, Arc::clone(&protocol) as Arc<dyn Protocol>)?;
        Ok(protocol)
    }

    /// Stop the reactor, drop every connection and close every protocol.
    /// Idempotent; also run on drop.
    pub fn shutdown(&self) {
        if !self.shared.stop() {
            return;
        }
        tracing::debug!(local = ?self.local_peer_idx(), "shutting down");

        if let Some(reactor) = self.reactor.lock().take() {
            reactor.stop();
        }
        if let Some(topo) = self.shared.topology() {
            for peer in topo.peers() {
                peer.mark_closed();
            }
        }
        for protocol in self.shared.take_protocols() {
            protocol.close();
        }
    }
}

impl Drop for SyncNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SyncNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncNode")
            .field("local_peer_idx", &self.local_peer_idx())
            .field("peers", &self.config.peers)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

fn resolve(address: &PeerAddress) -> Result<Vec<SocketAddr>> {
    let resolved: Vec<SocketAddr> = (address.host.as_str(), address.port)
        .to_socket_addrs()
        .map_err(|source| SyncError::Resolve {
            address: address.to_string(),
            source,
        })?
        .collect();

    if resolved.is_empty() {
        return Err(SyncError::Resolve {
            address: address.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
        });
    }
    Ok(resolved)
}

fn listen(address: SocketAddr) -> std::io::Result<tokio::net::TcpListener> {
    let socket = match address {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(address)?;
    socket.listen(1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[derive(Default)]
    struct Recorder {
        id: u8,
        seen: Mutex<Vec<Message>>,
        lost: Mutex<Vec<PeerIdx>>,
        closed: AtomicBool,
    }

    impl Recorder {
        fn with_id(id: u8) -> Arc<Self> {
            Arc::new(Self {
                id,
                ..Self::default()
            })
        }

        fn payloads(&self) -> Vec<Bytes> {
            self.seen.lock().iter().map(|m| m.payload.clone()).collect()
        }
    }

    impl Protocol for Recorder {
        fn protocol_id(&self) -> u8 {
            if self.id == 0 {
                40
            } else {
                self.id
            }
        }

        fn attach(&self, _node: SyncHandle) {}

        fn process_message(&self, message: Message) {
            self.seen.lock().push(message);
        }

        fn lost_peer(&self, peer: PeerIdx) {
            self.lost.lock().push(peer);
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn incoming(id: u8, n: u8) -> Message {
        Message::broadcast(id, vec![n]).with_sender(PeerIdx(1))
    }

    #[test]
    fn test_registered_protocol_receives_routed_message() {
        let node = SyncNode::new();
        let recorder = Recorder::with_id(20);
        node.add_protocol("rec", recorder.clone()).unwrap();

        node.shared.route_message(incoming(20, 1));
        node.shared.route_message(incoming(21, 2));

        assert_eq!(recorder.payloads(), vec![Bytes::from_static(&[1])]);
        assert_eq!(node.shared.registry.lock().unprocessed.len(), 1);
    }

    #[test]
    fn test_held_messages_delivered_in_order_on_registration() {
        let node = SyncNode::new();
        for n in 0..3 {
            node.shared.route_message(incoming(30, n));
        }
        node.shared.route_message(incoming(31, 9));

        let recorder = Recorder::with_id(30);
        node.add_protocol("late", recorder.clone()).unwrap();

        assert_eq!(
            recorder.payloads(),
            vec![
                Bytes::from_static(&[0]),
                Bytes::from_static(&[1]),
                Bytes::from_static(&[2])
            ]
        );
        let registry = node.shared.registry.lock();
        assert_eq!(registry.unprocessed.len(), 1);
        assert!(registry.draining.is_empty());
    }

    #[test]
    fn test_unprocessed_buffer_drops_oldest() {
        let node = SyncNode::new();
        let total = limits::UNPROCESSED_CAPACITY + 5;
        for n in 0..total {
            node.shared.route_message(incoming(50, n as u8));
        }
        assert_eq!(
            node.shared.registry.lock().unprocessed.len(),
            limits::UNPROCESSED_CAPACITY
        );

        let recorder = Recorder::with_id(50);
        node.add_protocol("rec", recorder.clone()).unwrap();
        let payloads = recorder.payloads();
        assert_eq!(payloads.len(), limits::UNPROCESSED_CAPACITY);
        assert_eq!(payloads[0].as_ref(), &[5]);
    }

    #[test]
    fn test_reserved_ids_are_held_not_dispatched() {
        let node = SyncNode::new();
        node.shared.route_message(incoming(0, 1));
        node.shared.route_message(incoming(7, 2));
        assert_eq!(node.shared.registry.lock().unprocessed.len(), 2);
    }

    #[test]
    fn test_add_protocol_validation() {
        let node = SyncNode::new();
        node.add_protocol("a", Recorder::with_id(20)).unwrap();

        assert!(matches!(
            node.add_protocol("a", Recorder::with_id(21)),
            Err(SyncError::DuplicateProtocolName(_))
        ));
        assert!(matches!(
            node.add_protocol("b", Recorder::with_id(20)),
            Err(SyncError::DuplicateProtocolId(20))
        ));
        assert!(matches!(
            node.add_protocol("c", Recorder::with_id(3)),
            Err(SyncError::ReservedProtocolId(3))
        ));

        assert_eq!(node.protocol_by_id(20).unwrap().protocol_id(), 20);
        assert!(node.protocol_by_name("a").is_some());
        assert!(node.protocol_by_name("b").is_none());
    }

    #[test]
    fn test_protocol_lookup_by_type() {
        let node = SyncNode::new();
        assert!(node.protocol::<Recorder>().is_none());

        let first = node.get_or_add_protocol::<Recorder>().unwrap();
        let again = node.get_or_add_protocol::<Recorder>().unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(Arc::ptr_eq(&first, &node.protocol::<Recorder>().unwrap()));
    }

    #[test]
    fn test_shutdown_closes_protocols_and_is_idempotent() {
        let node = SyncNode::new();
        let recorder = Recorder::with_id(20);
        let handle = node.handle();
        node.add_protocol("rec", recorder.clone()).unwrap();
        assert!(!handle.is_closed());

        node.shutdown();
        node.shutdown();
        assert!(recorder.closed.load(Ordering::SeqCst));
        assert!(handle.is_closed());
        assert!(node.protocol_by_id(20).is_none());
        assert!(matches!(
            node.add_protocol("rec", recorder.clone()),
            Err(SyncError::Closed)
        ));
    }

    #[test]
    fn test_peer_lost_notifies_protocols() {
        let node = SyncNode::new();
        let recorder = Recorder::with_id(20);
        node.add_protocol("rec", recorder.clone()).unwrap();
        node.shared.peer_lost(PeerIdx(2));
        assert_eq!(*recorder.lost.lock(), vec![PeerIdx(2)]);
    }

    #[test]
    fn test_configuration_before_initialize() {
        let mut node = SyncNode::new();
        node.add_peer("127.0.0.1:9000").unwrap();
        node.add_peer("127.0.0.1:9001").unwrap();
        node.add_peer("[::1]:9002").unwrap();
        assert!(node.add_peer("127.0.0.1:nope").is_err());
        node.set_local_peer_idx(1).unwrap();
        assert!(node.set_timeout_delay(-1.0).is_err());
        node.set_timeout_delay(2.5).unwrap();

        assert_eq!(node.local_peer_idx(), Some(PeerIdx(1)));
        assert_eq!(node.peers_count(), 2);
        assert_eq!(node.timeout_delay(), 2.5);
        assert!(!node.is_initialized());
        assert!(!node.is_connected());
        assert!(node.peer_state(PeerIdx(0)).is_none());
        assert!(matches!(node.connected_peers(), Err(SyncError::NotInitialized)));
        assert!(matches!(node.wait_for_connection(), Err(SyncError::NotInitialized)));
    }

    #[test]
    fn test_initialize_rejects_bad_config() {
        let mut node = SyncNode::new();
        assert!(matches!(node.initialize(), Err(SyncError::NoPeers)));

        let mut node = SyncNode::with_config(NodeConfig::new(["127.0.0.1:9000"], 4));
        assert!(matches!(
            node.initialize(),
            Err(SyncError::InvalidLocalPeerIdx { .. })
        ));
    }

    #[test]
    fn test_topology_slot_lookup() {
        let addr = |p| PeerAddress::new("127.0.0.1", p);
        let topo = Topology {
            local: PeerIdx(2),
            alpha: vec![
                Arc::new(Peer::alpha(PeerIdx(0), addr(9000))),
                Arc::new(Peer::alpha(PeerIdx(1), addr(9001))),
            ],
            beta: vec![
                Arc::new(Peer::beta(PeerIdx(3), addr(9003), Vec::new())),
                Arc::new(Peer::beta(PeerIdx(4), addr(9004), Vec::new())),
            ],
            timeout: Duration::from_secs(1),
            protocol_version: 4,
        };

        assert_eq!(topo.peers_count(), 4);
        assert!(topo.peer(PeerIdx(2)).is_none());
        assert!(topo.peer(PeerIdx(5)).is_none());
        for idx in [0u8, 1, 3, 4] {
            assert_eq!(topo.peer(PeerIdx(idx)).unwrap().idx(), PeerIdx(idx));
        }
    }
}
