//! Snapshot aggregator.
//!
//! On every tick, if some node table changed since the last one, rebuilds
//! the published global node list and tells consumers about it.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;

use topomap_services::{ChangeSignals, TopologyStore};

pub struct Aggregator {
    store: TopologyStore,
    signals: ChangeSignals,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl Aggregator {
    pub fn new(
        store: TopologyStore,
        signals: ChangeSignals,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            store,
            signals,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut interval = tokio::time::interval(self.interval);
        tracing::info!(interval_secs = self.interval.as_secs(), "snapshot aggregator starting");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("snapshot aggregator shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }
    }

    /// Returns the published list length, or `None` when nothing was dirty.
    fn tick(&self) -> Option<usize> {
        if !self.signals.nodes_dirty.take() {
            return None;
        }
        let count = self.store.aggregate();
        self.signals.nodes_published.raise();
        tracing::debug!(nodes = count, "published node list");
        Some(count)
    }
}
