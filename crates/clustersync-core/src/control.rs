//! Connection-management messages: handshake and keepalive.
//!
//! These are handled by the connection itself and never reach a
//! registered protocol.

use bytes::Bytes;

use crate::error::{Result, WireError};
use crate::message::Message;
use crate::types::PeerIdx;

/// Networking version announced in the handshake. Peers with a
/// different version are refused.
pub const PROTOCOL_VERSION: u8 = 4;

/// Protocol id of the handshake exchanged right after connecting.
pub const HANDSHAKE: u8 = 1;
/// Protocol id of a keepalive request.
pub const PING: u8 = 2;
/// Protocol id of a keepalive answer.
pub const PONG: u8 = 3;

/// Lowest id a user protocol may register with. Ids below are reserved.
pub const FIRST_USER_PROTOCOL_ID: u8 = 10;

/// Whether the id belongs to the reserved internal range.
pub const fn is_reserved(protocol_id: u8) -> bool {
    protocol_id < FIRST_USER_PROTOCOL_ID
}

/// `{ peer index, protocol version }`, two bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub peer: PeerIdx,
    pub version: u8,
}

impl Handshake {
    pub fn new(peer: PeerIdx, version: u8) -> Self {
        Self { peer, version }
    }

    pub fn to_message(self) -> Message {
        Message::broadcast(HANDSHAKE, Bytes::copy_from_slice(&[self.peer.0, self.version]))
            .with_sender(self.peer)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        match payload {
            [peer, version] => Ok(Self {
                peer: PeerIdx(*peer),
                version: *version,
            }),
            _ => Err(WireError::MalformedControl {
                kind: "handshake",
                len: payload.len(),
            }),
        }
    }

    /// Whether the remote end speaks our networking version.
    pub fn is_compatible_with(&self, version: u8) -> bool {
        self.version == version
    }
}

/// Ping or pong payload: the sender's index, one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub peer: PeerIdx,
}

impl Keepalive {
    pub fn new(peer: PeerIdx) -> Self {
        Self { peer }
    }

    pub fn ping(self) -> Message {
        self.to_message(PING)
    }

    pub fn pong(self) -> Message {
        self.to_message(PONG)
    }

    fn to_message(self, protocol_id: u8) -> Message {
        Message::broadcast(protocol_id, Bytes::copy_from_slice(&[self.peer.0])).with_sender(self.peer)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        match payload {
            [peer] => Ok(Self { peer: PeerIdx(*peer) }),
            _ => Err(WireError::MalformedControl {
                kind: "keepalive",
                len: payload.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let msg = Handshake::new(PeerIdx(2), PROTOCOL_VERSION).to_message();
        assert_eq!(msg.protocol_id, HANDSHAKE);
        assert_eq!(msg.from, PeerIdx(2));
        assert_eq!(msg.payload.as_ref(), &[2, PROTOCOL_VERSION]);

        let frame = msg.encode();
        assert_eq!(&frame[..], &[2, HANDSHAKE, 0, 0, 0, 2, 2, PROTOCOL_VERSION]);
    }

    #[test]
    fn test_handshake_rejects_wrong_size() {
        assert!(Handshake::decode(&[1]).is_err());
        assert!(Handshake::decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_handshake_version_check() {
        let hs = Handshake::decode(&[0, PROTOCOL_VERSION + 1]).unwrap();
        assert!(!hs.is_compatible_with(PROTOCOL_VERSION));
        assert!(hs.is_compatible_with(PROTOCOL_VERSION + 1));
    }

    #[test]
    fn test_ping_pong_ids() {
        let ka = Keepalive::new(PeerIdx(7));
        assert_eq!(ka.ping().protocol_id, PING);
        assert_eq!(ka.pong().protocol_id, PONG);
        assert_eq!(Keepalive::decode(&ka.ping().payload).unwrap(), ka);
        assert!(Keepalive::decode(&[]).is_err());
    }

    #[test]
    fn test_reserved_range() {
        assert!(is_reserved(0));
        assert!(is_reserved(HANDSHAKE));
        assert!(is_reserved(9));
        assert!(!is_reserved(FIRST_USER_PROTOCOL_ID));
    }
}
