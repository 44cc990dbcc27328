//! Topology store: every neighbour, the nodes each one reported, and each
//! node's peer adjacency.
//!
//! One `parking_lot::RwLock` guards the whole graph. Every entry point takes
//! the lock itself and releases it before returning, so callers never see a
//! guard and a mutation is never observed half-applied. Copies of the same
//! node held by different neighbours stay separate until `aggregate`.

use std::cmp::Ordering;
use std::collections::btree_map;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use topomap_core::{Hash, NodeId, NodeState, Peer};

// ── Model ─────────────────────────────────────────────────────────────────────

/// Identity of a directly adjacent protocol speaker: the datagram source
/// plus the NODE-ENDPOINT context that preceded the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NeighbourId {
    pub addr: Ipv6Addr,
    /// IPv6 scope id of the receiving interface.
    pub zone: u32,
    pub node_id: NodeId,
    pub endpoint_id: u32,
}

impl fmt::Display for NeighbourId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}%{}/{}:{}",
            self.addr, self.zone, self.node_id, self.endpoint_id
        )
    }
}

/// A node as reported by one neighbour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub hash: Hash,
    /// Replaced wholesale whenever `hash` changes.
    pub peers: Vec<Peer>,
}

impl Node {
    fn new(id: NodeId, hash: Hash) -> Self {
        Self {
            id,
            hash,
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Neighbour {
    pub id: NeighbourId,
    pub network_hash: Hash,
    pub nodes: HashMap<NodeId, Node>,
    pub last_seen: Instant,
}

/// Result of `upsert_neighbour`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighbourUpdate {
    Created,
    /// Network hash differed and was replaced.
    Updated,
    /// Same hash; only LastSeen moved.
    Unchanged,
}

/// Result of `upsert_node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeUpdate {
    Created,
    /// Node hash differed; peers were cleared.
    Changed,
    Unchanged,
}

impl NeighbourUpdate {
    pub fn is_change(self) -> bool {
        !matches!(self, NeighbourUpdate::Unchanged)
    }
}

impl NodeUpdate {
    pub fn is_change(self) -> bool {
        !matches!(self, NodeUpdate::Unchanged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerInsert {
    Added,
    Duplicate,
}

/// What one NODE-STATE record did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStateApplied {
    pub update: NodeUpdate,
    pub peers_added: usize,
    pub peers_duplicate: usize,
}

/// A neighbour removed by `expire_stale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub id: NeighbourId,
    /// Size of the node table destroyed with it.
    pub node_count: usize,
}

/// Per-neighbour summary for the API.
#[derive(Debug, Clone, Serialize)]
pub struct NeighbourDetail {
    pub id: NeighbourId,
    pub network_hash: Hash,
    pub node_count: usize,
    pub last_seen_secs: u64,
}

/// Consistent read view: every live neighbour and the de-duplicated nodes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TopologySnapshot {
    pub neighbours: Vec<NeighbourId>,
    pub nodes: Vec<Node>,
}

/// A record referenced a neighbour or node the store does not hold.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("unknown neighbour {0}")]
    UnknownNeighbour(NeighbourId),
    #[error("node {node_id} not reported by {neighbour}")]
    UnknownNode {
        neighbour: NeighbourId,
        node_id: NodeId,
    },
}

// ── Graph ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Topology {
    neighbours: HashMap<NeighbourId, Neighbour>,
}

impl Topology {
    fn neighbour_mut(&mut self, id: &NeighbourId) -> Result<&mut Neighbour, LookupError> {
        self.neighbours
            .get_mut(id)
            .ok_or(LookupError::UnknownNeighbour(*id))
    }

    fn upsert_neighbour(&mut self, id: NeighbourId, hash: Hash, now: Instant) -> NeighbourUpdate {
        match self.neighbours.entry(id) {
            Entry::Vacant(slot) => {
                slot.insert(Neighbour {
                    id,
                    network_hash: hash,
                    nodes: HashMap::new(),
                    last_seen: now,
                });
                NeighbourUpdate::Created
            }
            Entry::Occupied(mut slot) => {
                let neighbour = slot.get_mut();
                neighbour.last_seen = now;
                if neighbour.network_hash != hash {
                    neighbour.network_hash = hash;
                    NeighbourUpdate::Updated
                } else {
                    NeighbourUpdate::Unchanged
                }
            }
        }
    }

    fn upsert_node(
        &mut self,
        neighbour: &NeighbourId,
        node_id: NodeId,
        hash: Hash,
        now: Instant,
    ) -> Result<NodeUpdate, LookupError> {
        let owner = self.neighbour_mut(neighbour)?;
        owner.last_seen = now;
        match owner.nodes.entry(node_id) {
            Entry::Vacant(slot) => {
                slot.insert(Node::new(node_id, hash));
                Ok(NodeUpdate::Created)
            }
            Entry::Occupied(slot) => {
                let node = slot.into_mut();
                if node.hash == hash {
                    return Ok(NodeUpdate::Unchanged);
                }
                node.hash = hash;
                node.peers.clear();
                Ok(NodeUpdate::Changed)
            }
        }
    }

    fn add_peer_if_absent(
        &mut self,
        neighbour: &NeighbourId,
        node_id: NodeId,
        peer: Peer,
    ) -> Result<PeerInsert, LookupError> {
        let node = self
            .neighbour_mut(neighbour)?
            .nodes
            .get_mut(&node_id)
            .ok_or(LookupError::UnknownNode {
                neighbour: *neighbour,
                node_id,
            })?;
        if node.peers.contains(&peer) {
            return Ok(PeerInsert::Duplicate);
        }
        node.peers.push(peer);
        Ok(PeerInsert::Added)
    }

    fn touch(&mut self, id: &NeighbourId, now: Instant) -> Result<(), LookupError> {
        self.neighbour_mut(id)?.last_seen = now;
        Ok(())
    }

    fn expire_stale(&mut self, timeout: Duration, now: Instant) -> Vec<Expired> {
        let mut expired = Vec::new();
        self.neighbours.retain(|id, neighbour| {
            let alive = now.saturating_duration_since(neighbour.last_seen) <= timeout;
            if !alive {
                expired.push(Expired {
                    id: *id,
                    node_count: neighbour.nodes.len(),
                });
            }
            alive
        });
        expired.sort_by_key(|e| e.id);
        expired
    }

    fn neighbour_ids(&self) -> Vec<NeighbourId> {
        let mut ids: Vec<NeighbourId> = self.neighbours.keys().copied().collect();
        ids.sort();
        ids
    }

    /// One copy per NodeId, sorted by NodeId. When several neighbours report
    /// the same node, the one heard from most recently wins; equal LastSeen
    /// falls back to the lowest NeighbourId.
    fn merged_nodes(&self) -> Vec<Node> {
        let mut winners: BTreeMap<NodeId, (&Neighbour, &Node)> = BTreeMap::new();
        for neighbour in self.neighbours.values() {
            for node in neighbour.nodes.values() {
                match winners.entry(node.id) {
                    btree_map::Entry::Vacant(slot) => {
                        slot.insert((neighbour, node));
                    }
                    btree_map::Entry::Occupied(mut slot) => {
                        if outranks(neighbour, slot.get().0) {
                            slot.insert((neighbour, node));
                        }
                    }
                }
            }
        }
        winners.into_values().map(|(_, node)| node.clone()).collect()
    }
}

fn outranks(candidate: &Neighbour, holder: &Neighbour) -> bool {
    candidate
        .last_seen
        .cmp(&holder.last_seen)
        .then_with(|| holder.id.cmp(&candidate.id))
        == Ordering::Greater
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Shared handle to the topology. Cloning is cheap; all clones see the same
/// graph. Constructed once at startup and handed to every task.
#[derive(Debug, Clone, Default)]
pub struct TopologyStore {
    topology: Arc<RwLock<Topology>>,
    /// Last output of `aggregate`, served as the global node list.
    published: Arc<RwLock<Arc<Vec<Node>>>>,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the neighbour or refresh it, replacing the network hash when it
    /// differs.
    pub fn upsert_neighbour(&self, id: NeighbourId, hash: Hash) -> NeighbourUpdate {
        self.topology
            .write()
            .upsert_neighbour(id, hash, Instant::now())
    }

    /// Create or update a node inside the neighbour's table. On `Created` or
    /// `Changed` the node's peers are empty when this returns.
    pub fn upsert_node(
        &self,
        neighbour: &NeighbourId,
        node_id: NodeId,
        hash: Hash,
    ) -> Result<NodeUpdate, LookupError> {
        self.topology
            .write()
            .upsert_node(neighbour, node_id, hash, Instant::now())
    }

    /// Append `peer` unless an equal entry is already present.
    pub fn add_peer_if_absent(
        &self,
        neighbour: &NeighbourId,
        node_id: NodeId,
        peer: Peer,
    ) -> Result<PeerInsert, LookupError> {
        self.topology
            .write()
            .add_peer_if_absent(neighbour, node_id, peer)
    }

    /// `upsert_node` followed by `add_peer_if_absent` for every nested peer,
    /// all under one write lock.
    pub fn apply_node_state(
        &self,
        neighbour: &NeighbourId,
        state: &NodeState,
    ) -> Result<NodeStateApplied, LookupError> {
        let mut topology = self.topology.write();
        let update = topology.upsert_node(neighbour, state.node_id, state.hash, Instant::now())?;
        let mut applied = NodeStateApplied {
            update,
            peers_added: 0,
            peers_duplicate: 0,
        };
        for peer in &state.peers {
            match topology.add_peer_if_absent(neighbour, state.node_id, *peer)? {
                PeerInsert::Added => applied.peers_added += 1,
                PeerInsert::Duplicate => {
                    tracing::trace!(
                        neighbour = %neighbour,
                        node_id = %state.node_id,
                        peer_id = %peer.peer_id,
                        "peer already known"
                    );
                    applied.peers_duplicate += 1;
                }
            }
        }
        Ok(applied)
    }

    /// Refresh LastSeen without touching content.
    pub fn touch_neighbour(&self, id: &NeighbourId) -> Result<(), LookupError> {
        self.topology.write().touch(id, Instant::now())
    }

    /// Remove every neighbour silent for longer than `timeout`, together with
    /// its node table. Other neighbours' tables are left alone.
    pub fn expire_stale(&self, timeout: Duration) -> Vec<Expired> {
        self.topology.write().expire_stale(timeout, Instant::now())
    }

    /// Live neighbours and de-duplicated nodes under one read lock.
    pub fn snapshot(&self) -> TopologySnapshot {
        let topology = self.topology.read();
        TopologySnapshot {
            neighbours: topology.neighbour_ids(),
            nodes: topology.merged_nodes(),
        }
    }

    /// Rebuild the published global node list. Returns its length.
    pub fn aggregate(&self) -> usize {
        let merged = self.topology.read().merged_nodes();
        let count = merged.len();
        *self.published.write() = Arc::new(merged);
        count
    }

    /// The global node list as of the last `aggregate`.
    pub fn published_nodes(&self) -> Arc<Vec<Node>> {
        self.published.read().clone()
    }

    /// Current neighbours, sorted.
    pub fn neighbour_ids(&self) -> Vec<NeighbourId> {
        self.topology.read().neighbour_ids()
    }

    pub fn neighbour_details(&self) -> Vec<NeighbourDetail> {
        let topology = self.topology.read();
        let mut details: Vec<NeighbourDetail> = topology
            .neighbours
            .values()
            .map(|n| NeighbourDetail {
                id: n.id,
                network_hash: n.network_hash,
                node_count: n.nodes.len(),
                last_seen_secs: n.last_seen.elapsed().as_secs(),
            })
            .collect();
        details.sort_by_key(|d| d.id);
        details
    }

    pub fn neighbour_count(&self) -> usize {
        self.topology.read().neighbours.len()
    }

    /// Nodes summed over all neighbour tables, duplicates included.
    pub fn reported_node_count(&self) -> usize {
        self.topology
            .read()
            .neighbours
            .values()
            .map(|n| n.nodes.len())
            .sum()
    }

    /// One neighbour's copy of a node.
    pub fn node(&self, neighbour: &NeighbourId, node_id: NodeId) -> Option<Node> {
        self.topology
            .read()
            .neighbours
            .get(neighbour)
            .and_then(|n| n.nodes.get(&node_id))
            .cloned()
    }

    pub fn network_hash(&self, neighbour: &NeighbourId) -> Option<Hash> {
        self.topology
            .read()
            .neighbours
            .get(neighbour)
            .map(|n| n.network_hash)
    }
}
