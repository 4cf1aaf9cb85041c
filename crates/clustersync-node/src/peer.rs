//! One connection to one remote node.
//!
//! A [`Peer`] is the slot for a remote index. Slots below the local index
//! are *alpha* peers and are reached by accepting their inbound
//! connection; slots above are *beta* peers and are dialed. A slot goes
//! through
//!
//! ```text
//! Disconnected -> Connecting -> HandshakeSent -----> Connected   (beta)
//! Disconnected -> HandshakePending ----------------> Connected   (alpha)
//!                                      error/timeout -> Disconnected
//! ```
//!
//! Once connected, a session owns the socket: a reader task owns the
//! read half, a writer task owns the write half, and a supervisor owns
//! the keepalive and silence timers and dispatches received frames.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use clustersync_core::control::{self, Handshake, Keepalive};
use clustersync_core::{FrameHeader, Message, PeerAddress, PeerIdx, HEADER_LEN};

use crate::config::{INITIAL_CONNECT_DELAY, RECONNECT_DELAY};
use crate::error::{Result, SyncError};
use crate::node::{NodeShared, Topology};

/// Connection state of a peer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// No socket.
    Disconnected,
    /// Dialing (beta only).
    Connecting,
    /// Dialed and handshake written, waiting for the reply (beta only).
    HandshakeSent,
    /// Inbound handshake validated, reply being written (alpha only).
    HandshakePending,
    /// Handshake complete, messages flow.
    Connected,
}

/// How a slot is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// Lower index than the local node; accepted inbound.
    Alpha,
    /// Higher index than the local node; dialed outbound.
    Beta,
}

/// A remote slot and its current session, if any.
pub(crate) struct Peer {
    idx: PeerIdx,
    role: PeerRole,
    address: PeerAddress,
    /// Resolved addresses to dial; empty for alpha peers.
    endpoints: Vec<SocketAddr>,
    inner: Mutex<PeerInner>,
}

struct PeerInner {
    state: PeerState,
    /// Incremented for every installed session, so a superseded session
    /// cannot tear down its successor.
    session: u64,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    closer: Option<oneshot::Sender<()>>,
}

impl Peer {
    pub(crate) fn alpha(idx: PeerIdx, address: PeerAddress) -> Self {
        Self::new(idx, PeerRole::Alpha, address, Vec::new())
    }

    pub(crate) fn beta(idx: PeerIdx, address: PeerAddress, endpoints: Vec<SocketAddr>) -> Self {
        Self::new(idx, PeerRole::Beta, address, endpoints)
    }

    fn new(idx: PeerIdx, role: PeerRole, address: PeerAddress, endpoints: Vec<SocketAddr>) -> Self {
        Self {
            idx,
            role,
            address,
            endpoints,
            inner: Mutex::new(PeerInner {
                state: PeerState::Disconnected,
                session: 0,
                outbound: None,
                closer: None,
            }),
        }
    }

    pub(crate) fn idx(&self) -> PeerIdx {
        self.idx
    }

    pub(crate) fn role(&self) -> PeerRole {
        self.role
    }

    pub(crate) fn state(&self) -> PeerState {
        self.inner.lock().state
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    /// Queue a frame on the current session. Never blocks; frames for a
    /// peer that is not connected are dropped.
    pub(crate) fn send(&self, frame: Bytes) -> bool {
        let inner = self.inner.lock();
        match (&inner.state, &inner.outbound) {
            (PeerState::Connected, Some(outbound)) => outbound.send(frame).is_ok(),
            _ => {
                tracing::trace!(peer = %self.idx, "dropping frame for unconnected peer");
                false
            }
        }
    }

    fn set_state(&self, state: PeerState) {
        self.inner.lock().state = state;
    }

    /// Change state unless a live session owns the slot.
    fn set_state_unless_connected(&self, state: PeerState) {
        let mut inner = self.inner.lock();
        if inner.state != PeerState::Connected {
            inner.state = state;
        }
    }

    /// Make a new session current, closing any previous one. Returns the
    /// session number and whether a live session was replaced.
    fn install_session(
        &self,
        outbound: mpsc::UnboundedSender<Bytes>,
        closer: oneshot::Sender<()>,
    ) -> (u64, bool) {
        let (session, previous) = {
            let mut inner = self.inner.lock();
            inner.session += 1;
            inner.state = PeerState::Connected;
            inner.outbound = Some(outbound);
            (inner.session, inner.closer.replace(closer))
        };
        let superseded = previous.is_some();
        if let Some(previous) = previous {
            tracing::info!(peer = %self.idx, "new connection supersedes the previous one");
            let _ = previous.send(());
        }
        (session, superseded)
    }

    /// Release the slot if `session` is still current. Returns whether it was.
    fn end_session(&self, session: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.session != session {
            return false;
        }
        inner.state = PeerState::Disconnected;
        inner.outbound = None;
        inner.closer = None;
        true
    }

    /// Forget the session after the reactor has been stopped.
    pub(crate) fn mark_closed(&self) {
        let mut inner = self.inner.lock();
        inner.state = PeerState::Disconnected;
        inner.outbound = None;
        inner.closer = None;
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("idx", &self.idx)
            .field("role", &self.role)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

/// Read one complete frame.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut raw = [0u8; HEADER_LEN];
    reader.read_exact(&mut raw).await?;
    let header = FrameHeader::decode(&raw)?;

    let mut payload = vec![0u8; header.payload_len()];
    reader.read_exact(&mut payload).await?;

    Ok(header.into_message(Bytes::from(payload)))
}

/// Read the first frame of a connection and validate it as a handshake.
async fn read_handshake<R: AsyncRead + Unpin>(topo: &Topology, reader: &mut R) -> Result<Handshake> {
    let message = tokio::time::timeout(topo.timeout, read_frame(reader))
        .await
        .map_err(|_| SyncError::Timeout("waiting for handshake".into()))??;

    if message.protocol_id != control::HANDSHAKE {
        return Err(SyncError::UnexpectedMessage(message.protocol_id));
    }

    let handshake = Handshake::decode(&message.payload)?;
    if !handshake.is_compatible_with(topo.protocol_version) {
        return Err(SyncError::VersionMismatch {
            local: topo.protocol_version,
            peer: handshake.version,
        });
    }

    Ok(handshake)
}

fn handshake_frame(topo: &Topology) -> Bytes {
    Handshake::new(topo.local, topo.protocol_version).to_message().encode()
}

fn log_handshake_failure(local: PeerIdx, peer: PeerIdx, error: &SyncError) {
    match error {
        SyncError::VersionMismatch { .. } | SyncError::Wire(_) => {
            tracing::error!(local = %local, peer = %peer, %error, "corrupt handshake or incompatible networking versions")
        }
        _ => tracing::warn!(local = %local, peer = %peer, %error, "handshake failed"),
    }
}

/// Dial a beta peer, forever. Each established session runs to its end
/// before the next attempt.
pub(crate) async fn dial(node: Arc<NodeShared>, topo: Arc<Topology>, peer: Arc<Peer>) {
    let local = topo.local;
    tokio::time::sleep(INITIAL_CONNECT_DELAY).await;

    loop {
        peer.set_state(PeerState::Connecting);
        tracing::debug!(local = %local, peer = %peer.idx, address = %peer.address, "trying to connect");

        match TcpStream::connect(&peer.endpoints[..]).await {
            Ok(stream) => match dialer_handshake(&topo, &peer, stream).await {
                Ok((reader, writer)) => {
                    run_session(
                        Arc::clone(&node),
                        Arc::clone(&topo),
                        Arc::clone(&peer),
                        reader,
                        writer,
                    )
                    .await
                }
                Err(e) => log_handshake_failure(local, peer.idx, &e),
            },
            Err(e) => {
                tracing::debug!(local = %local, peer = %peer.idx, error = %e, "failed to connect")
            }
        }

        peer.set_state(PeerState::Disconnected);
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn dialer_handshake(
    topo: &Topology,
    peer: &Peer,
    stream: TcpStream,
) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    peer.set_state(PeerState::HandshakeSent);
    tracing::debug!(local = %topo.local, peer = %peer.idx, "connected, sending handshake");
    writer.write_all(&handshake_frame(topo)).await?;

    let reply = read_handshake(topo, &mut reader).await?;
    if reply.peer != peer.idx {
        return Err(SyncError::UnexpectedPeer {
            expected: peer.idx.to_string(),
            got: reply.peer,
        });
    }

    Ok((reader, writer))
}

/// Serve one accepted connection: validate the handshake, bind the
/// connection to its alpha slot and answer with our own handshake.
pub(crate) async fn accept_inbound(
    node: Arc<NodeShared>,
    topo: Arc<Topology>,
    stream: TcpStream,
    remote: SocketAddr,
) {
    let local = topo.local;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(local = %local, %remote, error = %e, "cannot disable nagle");
    }
    let (mut reader, mut writer) = stream.into_split();

    let handshake = match read_handshake(&topo, &mut reader).await {
        Ok(handshake) => handshake,
        Err(e) => {
            log_handshake_failure(local, PeerIdx::UNASSIGNED, &e);
            return;
        }
    };

    let peer = match topo.alpha.get(handshake.peer.as_usize()) {
        Some(peer) => Arc::clone(peer),
        None => {
            let error = SyncError::UnexpectedPeer {
                expected: format!("an index below {local}"),
                got: handshake.peer,
            };
            tracing::warn!(local = %local, %remote, %error, "refusing connection");
            return;
        }
    };

    peer.set_state_unless_connected(PeerState::HandshakePending);
    if let Err(e) = writer.write_all(&handshake_frame(&topo)).await {
        tracing::warn!(local = %local, peer = %peer.idx, error = %e, "cannot answer handshake");
        peer.set_state_unless_connected(PeerState::Disconnected);
        return;
    }

    run_session(node, topo, peer, reader, writer).await;
}

/// Why a session ended.
#[derive(Debug)]
enum SessionEnd {
    Read(SyncError),
    Write(String),
    TimedOut,
    Superseded,
}

/// Drive a connected session until it fails, times out or is superseded.
async fn run_session(
    node: Arc<NodeShared>,
    topo: Arc<Topology>,
    peer: Arc<Peer>,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
) {
    let local = topo.local;
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
    let (close_tx, mut close_rx) = oneshot::channel();
    let (session, superseded) = peer.install_session(outbound_tx, close_tx);

    // The old session will not report itself, so protocols hear about it
    // here, before anything is read from the new connection.
    if superseded {
        node.peer_lost(peer.idx);
    }
    tracing::info!(local = %local, peer = %peer.idx, role = ?peer.role, "connection established");
    node.peer_connected(peer.idx);

    let mut writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = outbound_rx.recv().await {
            writer.write_all(&frame).await?;
        }
        Ok::<(), std::io::Error>(())
    });

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(async move {
        let mut reader = reader;
        loop {
            let frame = read_frame(&mut reader).await;
            let failed = frame.is_err();
            if inbound_tx.send(frame).is_err() || failed {
                break;
            }
        }
    });

    let timeout = topo.timeout;
    let keepalive = timeout / 2;
    let mut silence_at = Instant::now() + timeout;
    let mut ping_at = Instant::now() + keepalive;

    let end = loop {
        tokio::select! {
            biased;

            _ = &mut close_rx => break SessionEnd::Superseded,
            frame = inbound_rx.recv() => match frame {
                Some(Ok(message)) => {
                    let now = Instant::now();
                    silence_at = now + timeout;
                    ping_at = now + keepalive;
                    handle_frame(&node, &topo, &peer, message);
                }
                Some(Err(e)) => break SessionEnd::Read(e),
                None => break SessionEnd::Read(SyncError::Closed),
            },
            _ = sleep_until(ping_at) => {
                tracing::debug!(local = %local, peer = %peer.idx, "sending ping");
                peer.send(Keepalive::new(local).ping().encode());
                ping_at = Instant::now() + keepalive;
            }
            _ = sleep_until(silence_at) => break SessionEnd::TimedOut,
            result = &mut writer_task => match result {
                // Only a newer session or teardown drops the queue sender.
                Ok(Ok(())) => break SessionEnd::Superseded,
                Ok(Err(e)) => break SessionEnd::Write(e.to_string()),
                Err(e) => break SessionEnd::Write(e.to_string()),
            },
        }
    };

    reader_task.abort();
    writer_task.abort();

    match &end {
        SessionEnd::Read(error) => {
            tracing::warn!(local = %local, peer = %peer.idx, %error, "incoming data problem")
        }
        SessionEnd::Write(error) => {
            tracing::error!(local = %local, peer = %peer.idx, address = %peer.address, %error, "could not write, closing socket")
        }
        SessionEnd::TimedOut => {
            tracing::warn!(local = %local, peer = %peer.idx, ?timeout, "connection timeout")
        }
        SessionEnd::Superseded => {
            tracing::debug!(local = %local, peer = %peer.idx, "closing superseded connection")
        }
    }

    if peer.end_session(session) {
        node.peer_lost(peer.idx);
    }
}

/// Dispatch a received frame: control messages inline, everything else
/// to the node's protocol router.
fn handle_frame(node: &NodeShared, topo: &Topology, peer: &Peer, mut message: Message) {
    let local = topo.local;
    tracing::trace!(
        local = %local,
        peer = %peer.idx,
        protocol_id = message.protocol_id,
        len = message.payload.len(),
        "received message"
    );

    match message.protocol_id {
        control::HANDSHAKE => {
            tracing::warn!(local = %local, peer = %peer.idx, "got handshake after connection was established")
        }
        control::PING => {
            match Keepalive::decode(&message.payload) {
                Ok(ping) if ping.peer != peer.idx => {
                    tracing::warn!(local = %local, peer = %peer.idx, claimed = %ping.peer, "received PING with confusing payload")
                }
                Ok(_) => {}
                Err(error) => tracing::warn!(local = %local, peer = %peer.idx, %error, "received corrupt PING"),
            }
            tracing::debug!(local = %local, peer = %peer.idx, "sending pong");
            peer.send(Keepalive::new(local).pong().encode());
        }
        // Already counted as activity.
        control::PONG => {}
        _ => {
            if message.from != peer.idx {
                tracing::warn!(
                    local = %local,
                    peer = %peer.idx,
                    claimed = %message.from,
                    "sender index in header does not match connection"
                );
                message.from = peer.idx;
            }
            node.route_message(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_frame_across_partial_writes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let frame = Message::broadcast(42, vec![7u8; 100]).with_sender(PeerIdx(1)).encode();

        let writer = tokio::spawn(async move {
            for chunk in frame.chunks(9) {
                client.write_all(chunk).await.unwrap();
            }
            client
        });

        let message = read_frame(&mut server).await.unwrap();
        assert_eq!(message.from, PeerIdx(1));
        assert_eq!(message.protocol_id, 42);
        assert_eq!(message.payload.len(), 100);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_frame_reads_consecutive_frames() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let first = Message::broadcast(10, &b"one"[..]).with_sender(PeerIdx(0)).encode();
        let second = Message::broadcast(11, &b"two"[..]).with_sender(PeerIdx(0)).encode();
        client.write_all(&first).await.unwrap();
        client.write_all(&second).await.unwrap();

        assert_eq!(read_frame(&mut server).await.unwrap().payload.as_ref(), b"one");
        assert_eq!(read_frame(&mut server).await.unwrap().payload.as_ref(), b"two");
    }

    #[tokio::test]
    async fn test_read_frame_eof_is_an_error() {
        let (client, mut server) = tokio::io::duplex(16);
        drop(client);
        assert!(matches!(read_frame(&mut server).await, Err(SyncError::Io(_))));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_header() {
        let (mut client, mut server) = tokio::io::duplex(16);
        client.write_all(&[0, 10, 0xFF, 0xFF, 0xFF, 0xFF]).await.unwrap();
        assert!(matches!(read_frame(&mut server).await, Err(SyncError::Wire(_))));
    }

    #[test]
    fn test_session_supersede_and_end() {
        let peer = Peer::alpha(PeerIdx(0), PeerAddress::new("127.0.0.1", 9000));
        assert_eq!(peer.state(), PeerState::Disconnected);

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (close1, mut closed1) = oneshot::channel();
        let (first, replaced) = peer.install_session(tx1, close1);
        assert!(!replaced);
        assert!(peer.is_connected());
        assert!(peer.send(Bytes::from_static(b"a")));
        assert_eq!(rx1.try_recv().unwrap(), Bytes::from_static(b"a"));

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (close2, _closed2) = oneshot::channel();
        let (second, replaced) = peer.install_session(tx2, close2);
        assert!(replaced);
        assert_eq!(closed1.try_recv(), Ok(()));
        // The old writer sees its queue close, which is not a write failure.
        assert_eq!(rx1.try_recv(), Err(mpsc::error::TryRecvError::Disconnected));

        // The superseded session must not release the slot.
        assert!(!peer.end_session(first));
        assert!(peer.is_connected());
        assert!(peer.send(Bytes::from_static(b"b")));
        assert_eq!(rx2.try_recv().unwrap(), Bytes::from_static(b"b"));

        assert!(peer.end_session(second));
        assert_eq!(peer.state(), PeerState::Disconnected);
        assert!(!peer.send(Bytes::from_static(b"c")));
    }

    #[test]
    fn test_state_unless_connected() {
        let peer = Peer::beta(PeerIdx(2), PeerAddress::new("127.0.0.1", 9002), Vec::new());
        peer.set_state_unless_connected(PeerState::HandshakePending);
        assert_eq!(peer.state(), PeerState::HandshakePending);

        let (tx, _rx) = mpsc::unbounded_channel();
        let (close, _closed) = oneshot::channel();
        peer.install_session(tx, close);
        peer.set_state_unless_connected(PeerState::Disconnected);
        assert!(peer.is_connected());

        peer.mark_closed();
        assert_eq!(peer.state(), PeerState::Disconnected);
        assert_eq!(peer.role(), PeerRole::Beta);
    }
}
