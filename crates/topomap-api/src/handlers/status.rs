//! /status handler.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::ApiState;

#[derive(Serialize)]
pub struct StatusResponse {
    pub neighbours: usize,
    /// Node entries across all neighbour tables, duplicates included.
    pub reported_nodes: usize,
    /// Size of the last published global node list.
    pub published_nodes: usize,
    pub neighbours_pending: bool,
    pub nodes_pending: bool,
    pub neighbour_timeout_secs: u64,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        neighbours: state.store.neighbour_count(),
        reported_nodes: state.store.reported_node_count(),
        published_nodes: state.store.published_nodes().len(),
        neighbours_pending: state.signals.neighbours.is_pending(),
        nodes_pending: state.signals.nodes_published.is_pending(),
        neighbour_timeout_secs: state.neighbour_timeout_secs,
    })
}
