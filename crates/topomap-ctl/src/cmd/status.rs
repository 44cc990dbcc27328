//! Daemon status command.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct StatusResponse {
    neighbours: usize,
    reported_nodes: usize,
    published_nodes: usize,
    neighbours_pending: bool,
    nodes_pending: bool,
    neighbour_timeout_secs: u64,
}

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Topomap Daemon Status");
    println!("═══════════════════════════════════════");
    println!("  Neighbours        : {}", resp.neighbours);
    println!("  Reported nodes    : {}", resp.reported_nodes);
    println!("  Published nodes   : {}", resp.published_nodes);
    println!("  Neighbour timeout : {}s", resp.neighbour_timeout_secs);
    println!(
        "  Pending updates   : neighbours={} nodes={}",
        resp.neighbours_pending, resp.nodes_pending
    );

    Ok(())
}
