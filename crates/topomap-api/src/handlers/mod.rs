//! HTTP API handlers: read-only JSON views of the topology.

pub mod status;
pub mod topology;

use topomap_services::{ChangeSignals, TopologyStore};

#[derive(Clone)]
pub struct ApiState {
    pub store: TopologyStore,
    pub signals: ChangeSignals,
    /// Configured neighbour timeout, reported by /status.
    pub neighbour_timeout_secs: u64,
}

// Re-export handler functions for use in router setup.
pub use status::handle_status;
pub use topology::{handle_neighbours, handle_nodes, handle_updates};
