//! topomap-services — the topology store, change signals and the
//! synchronization logic that feeds the store from decoded records.

pub mod signals;
pub mod sync;
pub mod topology;

pub use signals::{ChangeFlag, ChangeSignals};
pub use sync::{DatagramOutcome, Synchronizer};
pub use topology::{
    Expired, LookupError, NeighbourDetail, NeighbourId, NeighbourUpdate, Node, NodeStateApplied,
    NodeUpdate, PeerInsert, TopologySnapshot, TopologyStore,
};
