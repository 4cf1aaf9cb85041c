//! The background thread that owns every socket and timer.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::node::{NodeShared, Topology};
use crate::peer::{accept_inbound, dial};

/// A running reactor thread.
pub(crate) struct Reactor {
    thread: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Reactor {
    /// Spawn the thread: accept alpha peers on `listener`, dial every beta
    /// peer, until [`stop`](Self::stop).
    pub(crate) fn start(
        node: Arc<NodeShared>,
        topo: Arc<Topology>,
        runtime: Runtime,
        listener: TcpListener,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let local = topo.local;

        let thread = std::thread::Builder::new()
            .name(format!("clustersync-{local}"))
            .spawn(move || {
                tracing::debug!(local = %local, "running reactor");
                runtime.block_on(async move {
                    tokio::spawn(accept_loop(Arc::clone(&node), Arc::clone(&topo), listener));
                    for peer in &topo.beta {
                        tokio::spawn(dial(Arc::clone(&node), Arc::clone(&topo), Arc::clone(peer)));
                    }
                    let _ = shutdown_rx.await;
                });
                runtime.shutdown_background();
                tracing::debug!(local = %local, "done running reactor");
            })?;

        Ok(Self {
            thread: Some(thread),
            shutdown: Some(shutdown_tx),
        })
    }

    /// Signal the thread and join it, unless called from the thread itself.
    pub(crate) fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            tracing::debug!("reactor stopped from its own thread, not joining");
            return;
        }
        if thread.join().is_err() {
            tracing::error!("reactor thread panicked");
        }
    }
}

async fn accept_loop(node: Arc<NodeShared>, topo: Arc<Topology>, listener: TcpListener) {
    tracing::debug!(local = %topo.local, "listening to incoming connections");
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                tracing::debug!(local = %topo.local, %remote, "received incoming connection");
                tokio::spawn(accept_inbound(
                    Arc::clone(&node),
                    Arc::clone(&topo),
                    stream,
                    remote,
                ));
            }
            Err(e) => {
                tracing::warn!(local = %topo.local, error = %e, "incoming connection problem");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
