//! /neighbours, /nodes and /updates handlers.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use topomap_services::{NeighbourDetail, NeighbourId, Node};

use super::ApiState;

const DEFAULT_UPDATE_WAIT_SECS: u64 = 25;
const MAX_UPDATE_WAIT_SECS: u64 = 60;

// ── /neighbours ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct NeighboursResponse {
    pub neighbours: Vec<NeighbourDetail>,
}

pub async fn handle_neighbours(State(state): State<ApiState>) -> Json<NeighboursResponse> {
    Json(NeighboursResponse {
        neighbours: state.store.neighbour_details(),
    })
}

// ── /nodes ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct NodesResponse {
    pub nodes: Vec<Node>,
}

pub async fn handle_nodes(State(state): State<ApiState>) -> Json<NodesResponse> {
    Json(NodesResponse {
        nodes: state.store.published_nodes().to_vec(),
    })
}

// ── /updates ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct UpdatesQuery {
    pub timeout_secs: Option<u64>,
    /// Neighbour generation the client last received. Absent means 0.
    pub neighbours_since: Option<u64>,
    /// Node generation the client last received. Absent means 0.
    pub nodes_since: Option<u64>,
}

/// Each list is present only when its generation is past the client's
/// cursor. Clients send the returned generations back on the next poll.
#[derive(Serialize)]
pub struct UpdatesResponse {
    pub neighbours_generation: u64,
    pub nodes_generation: u64,
    pub neighbours: Option<Vec<NeighbourId>>,
    pub nodes: Option<Vec<Node>>,
}

/// Long-poll until the neighbour set or the published node list moves past
/// the client's cursors.
///
/// Every client keeps its own cursors, so concurrent watchers never take a
/// change from one another. A poll carrying a cursor acknowledges the
/// snapshot delivered with it; a response that never arrived is simply
/// sent again on the next poll.
pub async fn handle_updates(
    State(state): State<ApiState>,
    Query(query): Query<UpdatesQuery>,
) -> Json<UpdatesResponse> {
    let wait = query
        .timeout_secs
        .unwrap_or(DEFAULT_UPDATE_WAIT_SECS)
        .min(MAX_UPDATE_WAIT_SECS);
    let neighbours_since = query.neighbours_since.unwrap_or(0);
    let nodes_since = query.nodes_since.unwrap_or(0);

    state.signals.neighbours.acknowledge(neighbours_since);
    state.signals.nodes_published.acknowledge(nodes_since);

    if tokio::time::timeout(
        Duration::from_secs(wait),
        state.signals.wait_past(neighbours_since, nodes_since),
    )
    .await
    .is_err()
    {
        tracing::trace!(wait, "update poll timed out");
    }

    // Generations are read before the snapshots, so a change racing with
    // this response is delivered again rather than skipped.
    let neighbours_generation = state.signals.neighbours.generation();
    let nodes_generation = state.signals.nodes_published.generation();
    let neighbours =
        (neighbours_generation > neighbours_since).then(|| state.store.neighbour_ids());
    let nodes =
        (nodes_generation > nodes_since).then(|| state.store.published_nodes().to_vec());

    Json(UpdatesResponse {
        neighbours_generation,
        nodes_generation,
        neighbours,
        nodes,
    })
}
