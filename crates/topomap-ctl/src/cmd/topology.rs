//! Neighbour, node and watch commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct NeighbourId {
    addr: String,
    zone: u32,
    node_id: String,
    endpoint_id: u32,
}

impl std::fmt::Display for NeighbourId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%{}/{}:{}", self.addr, self.zone, self.node_id, self.endpoint_id)
    }
}

#[derive(Deserialize)]
struct NeighbourInfo {
    id: NeighbourId,
    network_hash: String,
    node_count: usize,
    last_seen_secs: u64,
}

#[derive(Deserialize)]
struct NeighboursResponse {
    neighbours: Vec<NeighbourInfo>,
}

#[derive(Deserialize)]
struct PeerInfo {
    peer_id: String,
    local_endpoint: u32,
    remote_endpoint: u32,
}

#[derive(Deserialize)]
struct NodeInfo {
    id: String,
    hash: String,
    peers: Vec<PeerInfo>,
}

#[derive(Deserialize)]
struct NodesResponse {
    nodes: Vec<NodeInfo>,
}

#[derive(Deserialize)]
struct UpdatesResponse {
    neighbours_generation: u64,
    nodes_generation: u64,
    neighbours: Option<Vec<NeighbourId>>,
    nodes: Option<Vec<NodeInfo>>,
}

// ── Printing ──────────────────────────────────────────────────────────────────

fn print_nodes(nodes: &[NodeInfo]) {
    for n in nodes {
        println!("  ┌─ node {}", n.id);
        println!("  │  hash  : {}", n.hash);
        if n.peers.is_empty() {
            println!("  └─ peers : none");
            continue;
        }
        println!("  │  peers :");
        let last = n.peers.len() - 1;
        for (i, p) in n.peers.iter().enumerate() {
            let branch = if i == last { "└─" } else { "│ " };
            println!(
                "  {}   {} via {} → {}",
                branch, p.peer_id, p.local_endpoint, p.remote_endpoint
            );
        }
    }
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

pub async fn cmd_neighbours(port: u16) -> Result<()> {
    let resp: NeighboursResponse = get_json(&format!("{}/neighbours", base_url(port))).await?;

    if resp.neighbours.is_empty() {
        println!("No neighbours heard yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Neighbours ({})", resp.neighbours.len());
    println!("═══════════════════════════════════════");

    for n in &resp.neighbours {
        println!("  ┌─ {}", n.id);
        println!("  │  network hash : {}", n.network_hash);
        println!("  │  nodes        : {}", n.node_count);
        println!("  └─ last seen    : {}s ago", n.last_seen_secs);
    }

    Ok(())
}

pub async fn cmd_nodes(port: u16) -> Result<()> {
    let resp: NodesResponse = get_json(&format!("{}/nodes", base_url(port))).await?;

    if resp.nodes.is_empty() {
        println!("No nodes published yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Nodes ({})", resp.nodes.len());
    println!("═══════════════════════════════════════");
    print_nodes(&resp.nodes);

    Ok(())
}

/// Long-poll /updates and print every snapshot delivered. Runs until killed.
pub async fn cmd_watch(port: u16) -> Result<()> {
    println!("Watching topology changes (Ctrl-C to stop)...");

    let (mut neighbours_since, mut nodes_since) = (0u64, 0u64);
    loop {
        let url = format!(
            "{}/updates?timeout_secs=25&neighbours_since={}&nodes_since={}",
            base_url(port),
            neighbours_since,
            nodes_since
        );
        let resp: UpdatesResponse = get_json(&url).await?;
        neighbours_since = resp.neighbours_generation;
        nodes_since = resp.nodes_generation;

        if let Some(neighbours) = &resp.neighbours {
            println!("── neighbours ({}) ──", neighbours.len());
            for n in neighbours {
                println!("  {}", n);
            }
        }
        if let Some(nodes) = &resp.nodes {
            println!("── nodes ({}) ──", nodes.len());
            print_nodes(nodes);
        }
    }
}
