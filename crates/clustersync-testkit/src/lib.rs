//! # Clustersync Testkit
//!
//! Testing utilities for clustersync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: free loopback ports and multi-node clusters running in
//!   one process
//! - **Generators**: Proptest strategies for addresses and messages
//! - **Tracing**: a test subscriber honouring `RUST_LOG`
//!
//! ## Local clusters
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use clustersync_testkit::LocalCluster;
//!
//! let cluster = LocalCluster::start(3)?;
//! cluster.wait_connected(Duration::from_secs(10))?;
//! assert!(cluster.node(1).is_connected());
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use clustersync_testkit::generators::peer_address_string;
//!
//! proptest! {
//!     #[test]
//!     fn every_generated_address_parses((text, _, port) in peer_address_string()) {
//!         let parsed = clustersync_core::PeerAddress::parse(&text).unwrap();
//!         prop_assert_eq!(parsed.port, port);
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod logging;

pub use fixtures::{free_ports, jitter, loopback_peers, wait_until, LocalCluster};
pub use logging::init_tracing;
