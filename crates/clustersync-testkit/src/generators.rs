//! Proptest generators for property-based testing.

use proptest::prelude::*;

use clustersync_core::{Message, PeerIdx, DEFAULT_PORT, FIRST_USER_PROTOCOL_ID};

/// Generate an assigned peer index.
pub fn peer_idx() -> impl Strategy<Value = PeerIdx> {
    (0u8..u8::MAX).prop_map(PeerIdx)
}

/// Generate a user protocol id.
pub fn user_protocol_id() -> impl Strategy<Value = u8> {
    FIRST_USER_PROTOCOL_ID..=u8::MAX
}

/// Generate a non-zero port.
pub fn port() -> impl Strategy<Value = u16> {
    1u16..=u16::MAX
}

/// Generate a host name or dotted IPv4 address.
pub fn host() -> impl Strategy<Value = String> {
    prop_oneof![
        any::<[u8; 4]>().prop_map(|o| format!("{}.{}.{}.{}", o[0], o[1], o[2], o[3])),
        "[a-z][a-z0-9-]{0,15}(\\.[a-z][a-z0-9-]{0,15}){0,2}",
    ]
}

/// Generate an IPv6 literal, without brackets.
pub fn ipv6_host() -> impl Strategy<Value = String> {
    any::<[u16; 8]>().prop_map(|s| std::net::Ipv6Addr::from(s).to_string())
}

/// Generate `(address string, expected host, expected port)` in every
/// accepted syntax.
pub fn peer_address_string() -> impl Strategy<Value = (String, String, u16)> {
    prop_oneof![
        host().prop_map(|h| (h.clone(), h, DEFAULT_PORT)),
        (host(), port()).prop_map(|(h, p)| (format!("{h}:{p}"), h, p)),
        ipv6_host()
            .prop_filter("needs two colons", |h| h.matches(':').count() > 1)
            .prop_map(|h| (h.clone(), h, DEFAULT_PORT)),
        (ipv6_host(), port()).prop_map(|(h, p)| (format!("[{h}]:{p}"), h, p)),
    ]
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Generate a user message as received from a peer.
pub fn message() -> impl Strategy<Value = Message> {
    (peer_idx(), user_protocol_id(), payload(256))
        .prop_map(|(from, id, payload)| Message::broadcast(id, payload).with_sender(from))
}
