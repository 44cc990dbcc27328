//! topomap-core — wire format, protocol constants and configuration.
//! All other topomap crates depend on this one.

pub mod config;
pub mod wire;

pub use wire::{Hash, NodeId, NodeState, Peer, Record, RecordReader, Request, WireError};
