//! Liveness reaper.
//!
//! Periodically removes neighbours that have been silent for longer than the
//! neighbour timeout, together with the node tables they own.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;

use topomap_services::{ChangeSignals, Expired, TopologyStore};

pub struct Reaper {
    store: TopologyStore,
    signals: ChangeSignals,
    timeout: Duration,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl Reaper {
    pub fn new(
        store: TopologyStore,
        signals: ChangeSignals,
        timeout: Duration,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            store,
            signals,
            timeout,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut interval = tokio::time::interval(self.interval);
        tracing::info!(
            timeout_secs = self.timeout.as_secs(),
            interval_secs = self.interval.as_secs(),
            "liveness reaper starting"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("liveness reaper shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    self.sweep();
                }
            }
        }
    }

    fn sweep(&self) -> Vec<Expired> {
        let expired = self.store.expire_stale(self.timeout);
        if expired.is_empty() {
            return expired;
        }

        for e in &expired {
            tracing::info!(neighbour = %e.id, nodes = e.node_count, "neighbour expired");
        }
        self.signals.neighbours.raise();
        if expired.iter().any(|e| e.node_count > 0) {
            self.signals.nodes_dirty.raise();
        }
        expired
    }
}
