//! Synchronization logic. Applies decoded records to the topology store and
//! decides what to ask the sender for.
//!
//! Change detection is two-tier. A NETWORK-STATE whose hash is new to us is
//! answered with REQUEST-NETWORK-STATE, which makes the neighbour publish its
//! NODE-STATE records. A NODE-STATE whose hash is new is answered with
//! REQUEST-NODE-STATE for that node, which pulls its full peer list. Records
//! carrying hashes we already hold only refresh liveness.

use std::net::SocketAddrV6;

use bytes::Bytes;

use topomap_core::wire::encode_requests;
use topomap_core::{NodeId, NodeState, Record, RecordReader, Request, WireError};

use crate::signals::ChangeSignals;
use crate::topology::{NeighbourId, NeighbourUpdate, TopologyStore};

/// What one datagram produced.
#[derive(Debug, Default)]
pub struct DatagramOutcome {
    /// Records decoded and applied, in wire order.
    pub records: usize,
    /// Requests to send back to the datagram's source, in record order.
    pub replies: Vec<Request>,
    /// Set when decoding stopped early. Records before the failure were applied.
    pub error: Option<WireError>,
}

impl DatagramOutcome {
    /// All replies packed into one datagram, or `None` when there are none.
    pub fn reply_datagram(&self) -> Option<Bytes> {
        if self.replies.is_empty() {
            None
        } else {
            Some(encode_requests(&self.replies))
        }
    }
}

/// The NODE-ENDPOINT context carried across the records of one datagram.
#[derive(Debug, Clone, Copy)]
struct EndpointContext {
    node_id: NodeId,
    endpoint_id: u32,
}

#[derive(Debug, Clone)]
pub struct Synchronizer {
    store: TopologyStore,
    signals: ChangeSignals,
}

impl Synchronizer {
    pub fn new(store: TopologyStore, signals: ChangeSignals) -> Self {
        Self { store, signals }
    }

    pub fn store(&self) -> &TopologyStore {
        &self.store
    }

    pub fn signals(&self) -> &ChangeSignals {
        &self.signals
    }

    /// Decode and apply one datagram received from `source`.
    ///
    /// Never fails: a malformed record ends decoding and is reported in the
    /// outcome, a record that cannot be attributed is logged and skipped.
    pub fn handle_datagram(&self, source: SocketAddrV6, payload: &[u8]) -> DatagramOutcome {
        let mut outcome = DatagramOutcome::default();
        let mut context = None;

        for record in RecordReader::new(payload) {
            match record {
                Ok(record) => {
                    outcome.records += 1;
                    if let Some(reply) = self.apply(source, &mut context, record) {
                        outcome.replies.push(reply);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        source = %source,
                        error = %e,
                        applied = outcome.records,
                        "malformed datagram, dropping remainder"
                    );
                    outcome.error = Some(e);
                }
            }
        }

        outcome
    }

    fn apply(
        &self,
        source: SocketAddrV6,
        context: &mut Option<EndpointContext>,
        record: Record,
    ) -> Option<Request> {
        match record {
            Record::NodeEndpoint {
                node_id,
                endpoint_id,
            } => {
                tracing::trace!(source = %source, node_id = %node_id, endpoint_id, "NODE-ENDPOINT");
                let ctx = EndpointContext {
                    node_id,
                    endpoint_id,
                };
                *context = Some(ctx);
                // Liveness only; an unknown neighbour is created by NETWORK-STATE.
                if let Err(e) = self.store.touch_neighbour(&neighbour_id(source, ctx)) {
                    tracing::trace!(error = %e, "NODE-ENDPOINT before NETWORK-STATE");
                }
                None
            }

            Record::NetworkState { hash } => {
                let Some(ctx) = *context else {
                    tracing::debug!(source = %source, "NETWORK-STATE without NODE-ENDPOINT, ignored");
                    return None;
                };
                let id = neighbour_id(source, ctx);
                let update = self.store.upsert_neighbour(id, hash);
                match update {
                    NeighbourUpdate::Created => {
                        tracing::info!(neighbour = %id, hash = %hash, "neighbour discovered");
                    }
                    NeighbourUpdate::Updated => {
                        tracing::debug!(neighbour = %id, hash = %hash, "network hash changed");
                    }
                    NeighbourUpdate::Unchanged => {
                        tracing::trace!(neighbour = %id, "network hash unchanged");
                    }
                }
                if update.is_change() {
                    self.signals.neighbours.raise();
                    Some(Request::NetworkState)
                } else {
                    None
                }
            }

            Record::NodeState(state) => {
                let Some(ctx) = *context else {
                    tracing::debug!(
                        source = %source,
                        node_id = %state.node_id,
                        "NODE-STATE without NODE-ENDPOINT, ignored"
                    );
                    return None;
                };
                self.apply_node_state(neighbour_id(source, ctx), &state)
            }

            Record::RequestNetworkState | Record::RequestNodeState { .. } => {
                tracing::trace!(source = %source, "request record ignored");
                None
            }

            Record::Unknown { kind, length } => {
                tracing::trace!(source = %source, kind, length, "unknown record skipped");
                None
            }
        }
    }

    fn apply_node_state(&self, id: NeighbourId, state: &NodeState) -> Option<Request> {
        let applied = match self.store.apply_node_state(&id, state) {
            Ok(applied) => applied,
            Err(e) => {
                tracing::debug!(error = %e, node_id = %state.node_id, "NODE-STATE ignored");
                return None;
            }
        };

        tracing::debug!(
            neighbour = %id,
            node_id = %state.node_id,
            hash = %state.hash,
            update = ?applied.update,
            peers_added = applied.peers_added,
            peers_duplicate = applied.peers_duplicate,
            "NODE-STATE applied"
        );

        if applied.update.is_change() || applied.peers_added > 0 {
            self.signals.nodes_dirty.raise();
        }
        applied
            .update
            .is_change()
            .then_some(Request::NodeState(state.node_id))
    }
}

fn neighbour_id(source: SocketAddrV6, ctx: EndpointContext) -> NeighbourId {
    NeighbourId {
        addr: *source.ip(),
        zone: source.scope_id(),
        node_id: ctx.node_id,
        endpoint_id: ctx.endpoint_id,
    }
}
