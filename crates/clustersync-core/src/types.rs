//! Strong type definitions for cluster membership.
//!
//! Peer indices travel on the wire as a single byte, so a cluster holds
//! at most [`limits::MAX_PEERS`](crate::limits::MAX_PEERS) slots.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, WireError};

/// Service port used when an address omits one.
pub const DEFAULT_PORT: u16 = 20401;

/// Ordinal position of a node in the configured peer list.
///
/// Every node must be configured with the same ordered list, so the
/// index identifies the same process cluster-wide.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerIdx(pub u8);

impl PeerIdx {
    /// Placeholder for a peer whose index is not yet known, e.g. an
    /// accepted connection that has not completed its handshake.
    pub const UNASSIGNED: Self = Self(u8::MAX);

    /// Create from a raw byte.
    pub const fn new(idx: u8) -> Self {
        Self(idx)
    }

    /// Convert from a list position, failing above the wire limit.
    pub fn from_usize(idx: usize) -> Option<Self> {
        u8::try_from(idx)
            .ok()
            .filter(|b| *b != u8::MAX)
            .map(Self)
    }

    /// The index as a list position.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Whether this is the [`UNASSIGNED`](Self::UNASSIGNED) placeholder.
    pub const fn is_unassigned(self) -> bool {
        self.0 == u8::MAX
    }
}

impl fmt::Debug for PeerIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unassigned() {
            write!(f, "PeerIdx(?)")
        } else {
            write!(f, "PeerIdx({})", self.0)
        }
    }
}

impl fmt::Display for PeerIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unassigned() {
            write!(f, "?")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u8> for PeerIdx {
    fn from(idx: u8) -> Self {
        Self(idx)
    }
}

/// Host and port of one configured peer.
///
/// Parsed from the forms
///
/// - `a.b.c.d` or `hostname`
/// - `a.b.c.d:port` or `hostname:port`
/// - `x:y::z` (bare IPv6, default port)
/// - `[x:y::z]:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host[:port]` string, applying [`DEFAULT_PORT`] when the
    /// port is missing.
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        let invalid = |reason: &str| WireError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let is_ipv6 = address.find(':') != address.rfind(':');

        let (host, port) = if is_ipv6 {
            match address.find("]:") {
                Some(pos) => {
                    if !address.starts_with('[') {
                        return Err(invalid("bracketed IPv6 host must start with '['"));
                    }
                    // `[v6]:` with nothing after the colon takes the default port.
                    let port = &address[pos + 2..];
                    (&address[1..pos], (!port.is_empty()).then_some(port))
                }
                None => (
                    address.trim_start_matches('[').trim_end_matches(']'),
                    None,
                ),
            }
        } else {
            match address.find(':') {
                Some(pos) if pos + 1 < address.len() => (&address[..pos], Some(&address[pos + 1..])),
                Some(pos) => (&address[..pos], None),
                None => (address, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid("port is not a number in 0..=65535"))?,
            None => DEFAULT_PORT,
        };

        Ok(Self::new(host, port))
    }

    /// Whether the host is an IPv6 literal.
    pub fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }
}

impl FromStr for PeerAddress {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_ipv4_with_port() {
        let addr = PeerAddress::parse("127.0.0.1:9000").unwrap();
        assert_eq!(addr, PeerAddress::new("127.0.0.1", 9000));
    }

    #[test]
    fn test_parse_ipv4_default_port() {
        let addr = PeerAddress::parse("10.0.0.7").unwrap();
        assert_eq!(addr.port, DEFAULT_PORT);
        assert_eq!(addr.host, "10.0.0.7");
    }

    #[test]
    fn test_parse_trailing_colon_uses_default_port() {
        let addr = PeerAddress::parse("render-3:").unwrap();
        assert_eq!(addr, PeerAddress::new("render-3", DEFAULT_PORT));
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let addr = PeerAddress::parse("[fe80::1:2]:4000").unwrap();
        assert_eq!(addr, PeerAddress::new("fe80::1:2", 4000));
        assert!(addr.is_ipv6());
        assert_eq!(addr.to_string(), "[fe80::1:2]:4000");
    }

    #[test]
    fn test_parse_bracketed_ipv6_empty_port() {
        let addr = PeerAddress::parse("[::1]:").unwrap();
        assert_eq!(addr, PeerAddress::new("::1", DEFAULT_PORT));
        assert_eq!(PeerAddress::parse("[::1]").unwrap(), addr);
    }

    #[test]
    fn test_parse_bare_ipv6() {
        let addr = PeerAddress::parse("::1").unwrap();
        assert_eq!(addr, PeerAddress::new("::1", DEFAULT_PORT));
    }

    #[test]
    fn test_parse_ipv6_missing_open_bracket() {
        let err = PeerAddress::parse("fe80::1]:4000").unwrap_err();
        assert!(matches!(err, WireError::InvalidAddress { .. }));
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        assert!(PeerAddress::parse("127.0.0.1:http").is_err());
        assert!(PeerAddress::parse("127.0.0.1:70000").is_err());
        assert!(PeerAddress::parse(":9000").is_err());
    }

    #[test]
    fn test_peer_idx_limits() {
        assert_eq!(PeerIdx::from_usize(0), Some(PeerIdx(0)));
        assert_eq!(PeerIdx::from_usize(254), Some(PeerIdx(254)));
        assert_eq!(PeerIdx::from_usize(255), None);
        assert_eq!(PeerIdx::from_usize(1000), None);
        assert_eq!(format!("{}", PeerIdx::UNASSIGNED), "?");
        assert_eq!(format!("{:?}", PeerIdx(3)), "PeerIdx(3)");
    }

    #[test]
    fn test_address_serde() {
        let addr = PeerAddress::new("192.168.1.4", 20402);
        let json = serde_json::to_string(&addr).unwrap();
        let back: PeerAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(addr, back);
    }

    proptest! {
        #[test]
        fn displayed_address_parses_back(
            octets in any::<[u8; 4]>(),
            port in any::<u16>(),
        ) {
            let host = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
            let addr = PeerAddress::new(host, port);
            prop_assert_eq!(PeerAddress::parse(&addr.to_string()).unwrap(), addr);
        }

        #[test]
        fn parse_never_panics(s in "\\PC{0,40}") {
            let _ = PeerAddress::parse(&s);
        }
    }
}
