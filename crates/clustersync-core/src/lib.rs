//! # Clustersync Core
//!
//! Pure primitives shared by every clustersync crate: peer indices,
//! peer addresses, messages and the frame format they travel in.
//!
//! This crate performs no I/O. Sockets, timers and threads live in
//! `clustersync-node`.
//!
//! ## Wire Format
//!
//! Every message on a connection is one frame:
//!
//! ```text
//! +--------+----------+----------------+-----------------+
//! | sender | protocol | length (u32 BE)| payload[length] |
//! +--------+----------+----------------+-----------------+
//!   1 byte   1 byte      4 bytes
//! ```
//!
//! Protocol ids below [`control::FIRST_USER_PROTOCOL_ID`] are reserved
//! for connection management (handshake, ping, pong).

pub mod control;
pub mod error;
pub mod message;
pub mod types;

pub use control::{Handshake, Keepalive, FIRST_USER_PROTOCOL_ID, PROTOCOL_VERSION};
pub use error::{Result, WireError};
pub use message::{limits, FrameHeader, Message, HEADER_LEN};
pub use types::{PeerAddress, PeerIdx, DEFAULT_PORT};
