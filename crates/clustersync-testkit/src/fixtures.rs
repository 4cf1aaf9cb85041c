//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: every node of a cluster runs
//! in the test process, on its own loopback port.

use std::net::TcpListener;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use rand::Rng;

use clustersync_node::{NodeConfig, SyncNode};

/// Reserve `n` distinct loopback ports that are free right now.
pub fn free_ports(n: usize) -> Result<Vec<u16>> {
    let listeners = (0..n)
        .map(|_| TcpListener::bind(("127.0.0.1", 0)))
        .collect::<std::io::Result<Vec<_>>>()
        .context("cannot reserve loopback ports")?;

    listeners
        .iter()
        .map(|l| Ok(l.local_addr()?.port()))
        .collect()
}

/// `127.0.0.1:<port>` for every port.
pub fn loopback_peers(ports: &[u16]) -> Vec<String> {
    ports.iter().map(|p| format!("127.0.0.1:{p}")).collect()
}

/// Poll `condition` every 10 ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// A random delay up to `max`, to shake out ordering assumptions.
pub fn jitter(max: Duration) -> Duration {
    let max_us = max.as_micros().min(u128::from(u64::MAX)) as u64;
    Duration::from_micros(rand::thread_rng().gen_range(0..=max_us))
}

/// Several nodes sharing one loopback peer list.
pub struct LocalCluster {
    peers: Vec<String>,
    nodes: Vec<Option<SyncNode>>,
}

impl LocalCluster {
    /// `n` nodes, not yet initialized, so protocols can be registered first.
    pub fn build(n: usize, mut configure: impl FnMut(usize, &mut NodeConfig)) -> Result<Self> {
        let peers = loopback_peers(&free_ports(n)?);
        let nodes = (0..n)
            .map(|idx| {
                let mut config = NodeConfig::new(peers.clone(), idx);
                configure(idx, &mut config);
                Some(SyncNode::with_config(config))
            })
            .collect();
        Ok(Self { peers, nodes })
    }

    /// `n` initialized nodes with default settings.
    pub fn start(n: usize) -> Result<Self> {
        Self::start_with(n, |_, _| {})
    }

    /// `n` initialized nodes, each config adjusted by `configure`.
    pub fn start_with(n: usize, configure: impl FnMut(usize, &mut NodeConfig)) -> Result<Self> {
        let mut cluster = Self::build(n, configure)?;
        cluster.initialize()?;
        Ok(cluster)
    }

    /// Initialize every remaining node.
    pub fn initialize(&mut self) -> Result<()> {
        for (idx, node) in self.nodes.iter_mut().enumerate() {
            if let Some(node) = node {
                node.initialize()
                    .with_context(|| format!("cannot initialize node {idx}"))?;
            }
        }
        tracing::debug!(peers = ?self.peers, "local cluster initialized");
        Ok(())
    }

    /// Wait until every remaining node reports full connectivity.
    pub fn wait_connected(&self, timeout: Duration) -> Result<()> {
        if !wait_until(timeout, || self.nodes().all(SyncNode::is_connected)) {
            let connected: Vec<_> = self
                .nodes()
                .map(|n| n.connected_peers().map(|p| p.len()).unwrap_or(0))
                .collect();
            bail!("cluster not connected after {timeout:?}; connected peers per node: {connected:?}");
        }
        Ok(())
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Node `idx`. Panics if it was removed.
    pub fn node(&self, idx: usize) -> &SyncNode {
        match self.nodes.get(idx) {
            Some(Some(node)) => node,
            _ => panic!("node {idx} is not part of the cluster"),
        }
    }

    /// The remaining nodes in index order.
    pub fn nodes(&self) -> impl Iterator<Item = &SyncNode> {
        self.nodes.iter().flatten()
    }

    /// Take node `idx` out of the cluster; dropping it simulates a crash.
    pub fn remove(&mut self, idx: usize) -> Option<SyncNode> {
        self.nodes.get_mut(idx).and_then(Option::take)
    }

    /// Whether every node was configured with the same ordered peer list.
    pub fn fingerprints_agree(&self) -> bool {
        let mut fingerprints = self.nodes().map(SyncNode::fingerprint);
        match fingerprints.next() {
            Some(first) => fingerprints.all(|f| f == first),
            None => true,
        }
    }
}
