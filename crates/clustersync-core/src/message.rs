//! Messages and their frame encoding.
//!
//! A [`Message`] is the unit exchanged between protocol instances. The
//! node stamps the sender index before writing it out as a frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};
use crate::types::PeerIdx;

/// Size of the fixed frame header: sender, protocol id, u32 length.
pub const HEADER_LEN: usize = 6;

/// Cluster and frame size limits.
pub mod limits {
    /// Max configured peers, including the local one. Index 255 is the
    /// unassigned placeholder.
    pub const MAX_PEERS: usize = 255;
    /// Max payload bytes accepted in a single frame.
    pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;
    /// Max messages held for protocol ids with no registered handler.
    pub const UNPROCESSED_CAPACITY: usize = 100;
}

/// A routed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Index of the node that sent the message.
    pub from: PeerIdx,
    /// Recipient, or `None` to broadcast to every connected peer.
    pub to: Option<PeerIdx>,
    /// Id of the protocol that encodes and consumes the payload.
    pub protocol_id: u8,
    /// Opaque protocol payload.
    pub payload: Bytes,
}

impl Message {
    /// A message for every connected peer.
    pub fn broadcast(protocol_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            from: PeerIdx::UNASSIGNED,
            to: None,
            protocol_id,
            payload: payload.into(),
        }
    }

    /// A message for a single peer.
    pub fn to_peer(peer: PeerIdx, protocol_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            from: PeerIdx::UNASSIGNED,
            to: Some(peer),
            protocol_id,
            payload: payload.into(),
        }
    }

    /// Stamp the sender index.
    pub fn with_sender(mut self, from: PeerIdx) -> Self {
        self.from = from;
        self
    }

    /// Whether the message targets every peer.
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// The header this message is framed with.
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            sender: self.from,
            protocol_id: self.protocol_id,
            length: self.payload.len() as u32,
        }
    }

    /// Encode as a complete frame (header followed by payload).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.header().encode_into(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode one complete frame. Trailing bytes are rejected.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                expected: HEADER_LEN,
                got: frame.len(),
            });
        }
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&frame[..HEADER_LEN]);
        let header = FrameHeader::decode(&raw)?;

        let body = &frame[HEADER_LEN..];
        if body.len() != header.payload_len() {
            return Err(WireError::Truncated {
                expected: HEADER_LEN + header.payload_len(),
                got: frame.len(),
            });
        }

        Ok(header.into_message(Bytes::copy_from_slice(body)))
    }
}

/// The fixed-size prefix of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sender: PeerIdx,
    pub protocol_id: u8,
    pub length: u32,
}

impl FrameHeader {
    /// Decode a header, enforcing [`limits::MAX_PAYLOAD_LEN`].
    pub fn decode(raw: &[u8; HEADER_LEN]) -> Result<Self> {
        let mut buf = &raw[..];
        let sender = PeerIdx(buf.get_u8());
        let protocol_id = buf.get_u8();
        let length = buf.get_u32();

        if length as usize > limits::MAX_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLarge {
                len: length as usize,
                max: limits::MAX_PAYLOAD_LEN,
            });
        }

        Ok(Self {
            sender,
            protocol_id,
            length,
        })
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.sender.0);
        buf.put_u8(self.protocol_id);
        buf.put_u32(self.length);
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize
    }

    /// Attach the payload read after this header.
    pub fn into_message(self, payload: Bytes) -> Message {
        Message {
            from: self.sender,
            to: None,
            protocol_id: self.protocol_id,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_is_big_endian() {
        let msg = Message::broadcast(12, vec![0xAA; 258]).with_sender(PeerIdx(3));
        let frame = msg.encode();

        assert_eq!(frame.len(), HEADER_LEN + 258);
        assert_eq!(&frame[..HEADER_LEN], &[3, 12, 0, 0, 1, 2]);
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let frame = Message::broadcast(20, &b"hello"[..])
            .with_sender(PeerIdx(1))
            .encode();

        let err = Message::decode(&frame[..frame.len() - 1]).unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                expected: HEADER_LEN + 5,
                got: HEADER_LEN + 4
            }
        );
    }

    #[test]
    fn test_decode_rejects_short_header() {
        assert!(matches!(
            Message::decode(&[1, 2, 3]),
            Err(WireError::Truncated { expected: HEADER_LEN, got: 3 })
        ));
    }

    #[test]
    fn test_header_rejects_oversized_length() {
        let raw = [0, 10, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(WireError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_decoded_message_is_broadcast_from_sender() {
        let frame = Message::to_peer(PeerIdx(4), 11, &b"x"[..])
            .with_sender(PeerIdx(2))
            .encode();
        let msg = Message::decode(&frame).unwrap();

        // The recipient is implied by the connection, not carried on the wire.
        assert_eq!(msg.from, PeerIdx(2));
        assert!(msg.is_broadcast());
        assert_eq!(msg.payload.as_ref(), b"x");
    }

    proptest! {
        #[test]
        fn frame_preserves_sender_protocol_and_payload(
            sender in 0u8..255,
            protocol_id in any::<u8>(),
            payload in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let msg = Message::broadcast(protocol_id, payload).with_sender(PeerIdx(sender));
            let decoded = Message::decode(&msg.encode()).unwrap();
            prop_assert_eq!(decoded, msg);
        }

        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = Message::decode(&bytes);
        }
    }
}
