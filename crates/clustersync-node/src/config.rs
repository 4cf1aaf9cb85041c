//! Node configuration.
//!
//! The host application (an XML loader, a CLI, a JSON file) produces a
//! [`NodeConfig`]. Every node in a cluster must be given the same ordered
//! peer list; only `local_peer_idx` differs between them.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use clustersync_core::{limits, PeerAddress, PeerIdx, PROTOCOL_VERSION};

use crate::error::{Result, SyncError};

/// Delay between a failed dial and the next attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Delay before the first dial after `initialize()`.
pub const INITIAL_CONNECT_DELAY: Duration = Duration::from_millis(100);

/// Default silence, in seconds, after which a peer is considered lost.
pub const DEFAULT_TIMEOUT_DELAY: f32 = 5.0;

/// Configuration for a [`SyncNode`](crate::SyncNode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Ordered `host[:port]` addresses of every node, including this one.
    pub peers: Vec<String>,
    /// Which entry of `peers` is this node.
    pub local_peer_idx: Option<usize>,
    /// Report a dropped peer as an exit request instead of degrading.
    pub exit_when_a_peer_is_disconnected: bool,
    /// Seconds of silence before a peer is considered lost. A keepalive
    /// ping is sent after half this time.
    pub timeout_delay: f32,
    /// Networking version announced in the handshake.
    pub protocol_version: u8,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            local_peer_idx: None,
            exit_when_a_peer_is_disconnected: false,
            timeout_delay: DEFAULT_TIMEOUT_DELAY,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl NodeConfig {
    /// Config for `peers` with this node at `local_peer_idx`.
    pub fn new<S: Into<String>>(peers: impl IntoIterator<Item = S>, local_peer_idx: usize) -> Self {
        Self {
            peers: peers.into_iter().map(Into::into).collect(),
            local_peer_idx: Some(local_peer_idx),
            ..Self::default()
        }
    }

    /// Parse from a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Fail-fast checks performed by `initialize()`.
    pub fn validate(&self) -> Result<()> {
        if self.peers.is_empty() {
            return Err(SyncError::NoPeers);
        }
        if self.peers.len() > limits::MAX_PEERS {
            return Err(SyncError::TooManyPeers {
                count: self.peers.len(),
                max: limits::MAX_PEERS,
            });
        }
        match self.local_peer_idx {
            Some(idx) if idx < self.peers.len() => {}
            idx => {
                return Err(SyncError::InvalidLocalPeerIdx {
                    idx,
                    peers: self.peers.len(),
                })
            }
        }
        if !(self.timeout_delay.is_finite() && self.timeout_delay > 0.0) {
            return Err(SyncError::InvalidTimeout(self.timeout_delay));
        }
        self.peer_addresses()?;
        Ok(())
    }

    /// The local index, once validated.
    pub fn local_peer(&self) -> Result<PeerIdx> {
        self.local_peer_idx
            .filter(|idx| *idx < self.peers.len())
            .and_then(PeerIdx::from_usize)
            .ok_or(SyncError::InvalidLocalPeerIdx {
                idx: self.local_peer_idx,
                peers: self.peers.len(),
            })
    }

    /// Parse every configured address.
    pub fn peer_addresses(&self) -> Result<Vec<PeerAddress>> {
        self.peers
            .iter()
            .map(|s| PeerAddress::parse(s).map_err(SyncError::from))
            .collect()
    }

    /// The silence timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f32(self.timeout_delay)
    }

    /// Digest of the ordered peer list.
    ///
    /// Roles (accept vs. dial) are derived from list positions, so nodes
    /// with different fingerprints will never form a consistent cluster.
    /// The fingerprint is not exchanged on the wire; compare it out of band.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"clustersync-peers-v0:");
        for peer in &self.peers {
            hasher.update(&(peer.len() as u32).to_be_bytes());
            hasher.update(peer.as_bytes());
        }
        hex::encode(&hasher.finalize().as_bytes()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn three_nodes(local: usize) -> NodeConfig {
        NodeConfig::new(["127.0.0.1:9000", "127.0.0.1:9001", "127.0.0.1:9002"], local)
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.timeout_delay, 5.0);
        assert!(!config.exit_when_a_peer_is_disconnected);
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
        assert_eq!(config.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_no_peers() {
        assert!(matches!(NodeConfig::default().validate(), Err(SyncError::NoPeers)));
    }

    #[test]
    fn test_validate_local_idx_out_of_range() {
        let err = three_nodes(3).validate().unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidLocalPeerIdx { idx: Some(3), peers: 3 }
        ));

        let mut unset = three_nodes(0);
        unset.local_peer_idx = None;
        assert!(unset.validate().is_err());
    }

    #[test]
    fn test_validate_too_many_peers() {
        let peers: Vec<String> = (0..300).map(|i| format!("10.0.{}.{}:1", i / 256, i % 256)).collect();
        let config = NodeConfig::new(peers, 0);
        assert!(matches!(config.validate(), Err(SyncError::TooManyPeers { count: 300, .. })));
    }

    #[test]
    fn test_validate_bad_timeout_and_address() {
        let mut config = three_nodes(1);
        config.timeout_delay = 0.0;
        assert!(matches!(config.validate(), Err(SyncError::InvalidTimeout(_))));

        let config = NodeConfig::new(["127.0.0.1:9000", "127.0.0.1:port"], 0);
        assert!(matches!(config.validate(), Err(SyncError::Wire(_))));
    }

    #[test]
    fn test_from_json_applies_defaults() {
        let config = NodeConfig::from_json_str(
            r#"{ "peers": ["10.0.0.1", "10.0.0.2:7000"], "local_peer_idx": 1 }"#,
        )
        .unwrap();

        assert_eq!(config.local_peer().unwrap(), PeerIdx(1));
        assert_eq!(config.timeout_delay, DEFAULT_TIMEOUT_DELAY);
        let addrs = config.peer_addresses().unwrap();
        assert_eq!(addrs[0].port, clustersync_core::DEFAULT_PORT);
        assert_eq!(addrs[1].port, 7000);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "peers": ["127.0.0.1:9000", "127.0.0.1:9001"], "local_peer_idx": 0,
                 "exit_when_a_peer_is_disconnected": true, "timeout_delay": 0.5 }}"#
        )
        .unwrap();

        let config = NodeConfig::from_json_file(file.path()).unwrap();
        assert!(config.exit_when_a_peer_is_disconnected);
        assert_eq!(config.timeout(), Duration::from_millis(500));
        config.validate().unwrap();
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            NodeConfig::from_json_str("{ peers: nope"),
            Err(SyncError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_fingerprint_depends_on_order_not_local_idx() {
        assert_eq!(three_nodes(0).fingerprint(), three_nodes(2).fingerprint());

        let swapped = NodeConfig::new(["127.0.0.1:9001", "127.0.0.1:9000", "127.0.0.1:9002"], 0);
        assert_ne!(three_nodes(0).fingerprint(), swapped.fingerprint());
    }
}
