//! Change notifications between the protocol tasks and snapshot consumers.
//!
//! A `ChangeFlag` counts raises in a generation number and remembers the
//! highest generation a consumer has acknowledged. It is pending while some
//! raise is unacknowledged. Single consumers use `take`; consumers that
//! each keep their own cursor use `generation`, `wait_past` and
//! `acknowledge`, so none of them can clear a change another has not seen.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct ChangeFlag {
    generation: AtomicU64,
    acknowledged: AtomicU64,
    notify: Notify,
}

impl ChangeFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change and wake every waiter.
    pub fn raise(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Number of raises so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_pending(&self) -> bool {
        self.generation() > self.acknowledged.load(Ordering::Acquire)
    }

    /// Acknowledge everything raised so far, returning whether anything was
    /// pending. A raise racing with this stays pending.
    pub fn take(&self) -> bool {
        let current = self.generation();
        self.acknowledged.fetch_max(current, Ordering::AcqRel) < current
    }

    /// A consumer has delivered everything up to `seen`.
    pub fn acknowledge(&self, seen: u64) {
        let seen = seen.min(self.generation());
        self.acknowledged.fetch_max(seen, Ordering::AcqRel);
    }

    /// Resolve once the flag is pending. Does not clear it.
    pub async fn wait(&self) {
        loop {
            // Registered before the check so a raise in between is not lost.
            let notified = self.notify.notified();
            if self.is_pending() {
                return;
            }
            notified.await;
        }
    }

    /// Resolve once the generation has moved past `since`.
    pub async fn wait_past(&self, since: u64) {
        loop {
            let notified = self.notify.notified();
            if self.generation() > since {
                return;
            }
            notified.await;
        }
    }
}

/// The flags shared by every task.
///
/// - `neighbours`: the neighbour set or a network hash changed
///   (OnNeighboursChanged).
/// - `nodes_dirty`: some node table changed; consumed by the aggregator.
/// - `nodes_published`: the aggregator published a new global node list
///   (OnNodesChanged).
#[derive(Debug, Clone, Default)]
pub struct ChangeSignals {
    pub neighbours: Arc<ChangeFlag>,
    pub nodes_dirty: Arc<ChangeFlag>,
    pub nodes_published: Arc<ChangeFlag>,
}

impl ChangeSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve once either consumer-facing generation has moved past the
    /// caller's cursor.
    pub async fn wait_past(&self, neighbours_since: u64, nodes_since: u64) {
        tokio::select! {
            _ = self.neighbours.wait_past(neighbours_since) => {}
            _ = self.nodes_published.wait_past(nodes_since) => {}
        }
    }
}
