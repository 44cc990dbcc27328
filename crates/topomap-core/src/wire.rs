//! topomap wire format: the TLV records exchanged on the multicast group.
//!
//! Every record is `type: u16, length: u16` followed by `length` payload
//! bytes, all big-endian. Top-level records are packed back to back with no
//! padding. Sub-records nested inside a NODE-STATE payload use the same
//! framing, but each sub-record payload is padded to the next 4-byte
//! boundary and the padding is not counted in `length`.
//!
//! Fixed-size bodies are zerocopy structs built from big-endian integer
//! types, so they have alignment 1 and are read straight out of the
//! datagram. There is no unsafe code in this module.

use std::fmt;
use std::iter::FusedIterator;
use std::mem::size_of;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Serialize, Serializer};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Network-wide identifier of a topology node. Uniqueness is asserted by the
/// protocol and never checked locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

/// Opaque 64-bit content digest. Only ever compared for equality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// Both are rendered as hex strings: a u64 does not survive a trip through
// a JavaScript number.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ── Record types ─────────────────────────────────────────────────────────────

/// Outbound: ask the neighbour to publish its full network state.
pub const REQUEST_NETWORK_STATE: u16 = 1;
/// Outbound: ask the neighbour for one node's state. Payload: NodeId.
pub const REQUEST_NODE_STATE: u16 = 2;
/// Sets the (NodeId, EndpointId) context for the rest of the datagram.
pub const NODE_ENDPOINT: u16 = 3;
/// The sender's network-wide hash.
pub const NETWORK_STATE: u16 = 4;
/// Per-node report, optionally followed by nested sub-records.
pub const NODE_STATE: u16 = 5;
/// Nested inside NODE-STATE: one adjacency of the reported node.
pub const PEER: u16 = 8;

// ── Fixed layouts ────────────────────────────────────────────────────────────

/// Record framing shared by top-level and nested records.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct TlvHeader {
    pub kind: U16<BigEndian>,
    /// Payload length, excluding this header and any nested padding.
    pub length: U16<BigEndian>,
}

assert_eq_size!(TlvHeader, [u8; 4]);

impl TlvHeader {
    pub fn new(kind: u16, length: u16) -> Self {
        Self {
            kind: U16::new(kind),
            length: U16::new(length),
        }
    }
}

/// REQUEST-NODE-STATE payload.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct NodeIdBody {
    pub node_id: U32<BigEndian>,
}

assert_eq_size!(NodeIdBody, [u8; 4]);

/// NODE-ENDPOINT payload.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct NodeEndpointBody {
    pub node_id: U32<BigEndian>,
    pub endpoint_id: U32<BigEndian>,
}

assert_eq_size!(NodeEndpointBody, [u8; 8]);

/// NETWORK-STATE payload.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct NetworkStateBody {
    pub hash: U64<BigEndian>,
}

assert_eq_size!(NetworkStateBody, [u8; 8]);

/// Fixed prefix of a NODE-STATE payload. Anything past these 20 bytes is a
/// run of padded sub-records.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct NodeStateHeader {
    pub node_id: U32<BigEndian>,
    pub seqno: U32<BigEndian>,
    /// Milliseconds since the origin published this state.
    pub origin_age: U32<BigEndian>,
    pub hash: U64<BigEndian>,
}

assert_eq_size!(NodeStateHeader, [u8; 20]);

/// PEER sub-record payload.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PeerBody {
    pub peer_id: U32<BigEndian>,
    pub local_endpoint: U32<BigEndian>,
    pub remote_endpoint: U32<BigEndian>,
}

assert_eq_size!(PeerBody, [u8; 12]);

pub const TLV_HEADER_LEN: usize = size_of::<TlvHeader>();
pub const NODE_STATE_HEADER_LEN: usize = size_of::<NodeStateHeader>();

/// Padded PEER sub-record size.
const PEER_RECORD_LEN: usize = TLV_HEADER_LEN + size_of::<PeerBody>();

/// Most PEER sub-records one NODE-STATE payload can carry within its u16
/// length. Encoding stops after this many.
pub const MAX_NODE_STATE_PEERS: usize = (u16::MAX as usize - NODE_STATE_HEADER_LEN) / PEER_RECORD_LEN;

// ── Decoded records ──────────────────────────────────────────────────────────

/// Directed adjacency: the owning node links to `peer_id` over the given
/// endpoint pair. Equality is field-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Peer {
    pub peer_id: NodeId,
    pub local_endpoint: u32,
    pub remote_endpoint: u32,
}

impl From<&PeerBody> for Peer {
    fn from(body: &PeerBody) -> Self {
        Self {
            peer_id: NodeId(body.peer_id.get()),
            local_endpoint: body.local_endpoint.get(),
            remote_endpoint: body.remote_endpoint.get(),
        }
    }
}

/// A NODE-STATE record with its nested PEER sub-records already parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub node_id: NodeId,
    pub seqno: u32,
    pub origin_age: u32,
    pub hash: Hash,
    /// PEER sub-records in wire order.
    pub peers: Vec<Peer>,
    /// Nested sub-records of unrecognised type that were skipped.
    pub skipped: usize,
}

/// One top-level record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    RequestNetworkState,
    RequestNodeState { node_id: NodeId },
    NodeEndpoint { node_id: NodeId, endpoint_id: u32 },
    NetworkState { hash: Hash },
    NodeState(NodeState),
    /// A record type this decoder does not interpret. Its payload was skipped.
    Unknown { kind: u16, length: u16 },
}

impl Record {
    /// Wire type of this record.
    pub fn kind(&self) -> u16 {
        match self {
            Record::RequestNetworkState => REQUEST_NETWORK_STATE,
            Record::RequestNodeState { .. } => REQUEST_NODE_STATE,
            Record::NodeEndpoint { .. } => NODE_ENDPOINT,
            Record::NetworkState { .. } => NETWORK_STATE,
            Record::NodeState(_) => NODE_STATE,
            Record::Unknown { kind, .. } => *kind,
        }
    }

    /// Append this record to `buf`. Unknown records are written with a
    /// zero-filled payload of their declared length.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Record::RequestNetworkState => Request::NetworkState.encode_into(buf),
            Record::RequestNodeState { node_id } => Request::NodeState(*node_id).encode_into(buf),
            Record::NodeEndpoint {
                node_id,
                endpoint_id,
            } => {
                let body = NodeEndpointBody {
                    node_id: U32::new(node_id.0),
                    endpoint_id: U32::new(*endpoint_id),
                };
                put_record(buf, NODE_ENDPOINT, body.as_bytes());
            }
            Record::NetworkState { hash } => {
                let body = NetworkStateBody {
                    hash: U64::new(hash.0),
                };
                put_record(buf, NETWORK_STATE, body.as_bytes());
            }
            Record::NodeState(state) => {
                let header = NodeStateHeader {
                    node_id: U32::new(state.node_id.0),
                    seqno: U32::new(state.seqno),
                    origin_age: U32::new(state.origin_age),
                    hash: U64::new(state.hash.0),
                };
                let peers = &state.peers[..state.peers.len().min(MAX_NODE_STATE_PEERS)];
                let mut payload =
                    BytesMut::with_capacity(NODE_STATE_HEADER_LEN + peers.len() * PEER_RECORD_LEN);
                payload.put_slice(header.as_bytes());
                for peer in peers {
                    let body = PeerBody {
                        peer_id: U32::new(peer.peer_id.0),
                        local_endpoint: U32::new(peer.local_endpoint),
                        remote_endpoint: U32::new(peer.remote_endpoint),
                    };
                    put_nested(&mut payload, PEER, body.as_bytes());
                }
                put_record(buf, NODE_STATE, &payload);
            }
            Record::Unknown { kind, length } => {
                buf.put_slice(TlvHeader::new(*kind, *length).as_bytes());
                buf.put_bytes(0, *length as usize);
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

// ── Outbound requests ────────────────────────────────────────────────────────

/// The two records this system ever sends, each back to the neighbour whose
/// advertisement revealed a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// REQUEST-NETWORK-STATE, zero-length payload.
    NetworkState,
    /// REQUEST-NODE-STATE for one node.
    NodeState(NodeId),
}

impl Request {
    pub fn kind(&self) -> u16 {
        match self {
            Request::NetworkState => REQUEST_NETWORK_STATE,
            Request::NodeState(_) => REQUEST_NODE_STATE,
        }
    }

    /// Encoded size including the record header.
    pub fn encoded_len(&self) -> usize {
        match self {
            Request::NetworkState => TLV_HEADER_LEN,
            Request::NodeState(_) => TLV_HEADER_LEN + size_of::<NodeIdBody>(),
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Request::NetworkState => put_record(buf, REQUEST_NETWORK_STATE, &[]),
            Request::NodeState(node_id) => {
                let body = NodeIdBody {
                    node_id: U32::new(node_id.0),
                };
                put_record(buf, REQUEST_NODE_STATE, body.as_bytes());
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

/// Pack several requests into one datagram, in order.
pub fn encode_requests(requests: &[Request]) -> Bytes {
    let mut buf = BytesMut::with_capacity(requests.iter().map(Request::encoded_len).sum());
    for request in requests {
        request.encode_into(&mut buf);
    }
    buf.freeze()
}

/// Every caller bounds `payload` to a u16 length.
fn put_record(buf: &mut BytesMut, kind: u16, payload: &[u8]) {
    let length = u16::try_from(payload.len());
    debug_assert!(length.is_ok(), "record type {} payload of {} bytes", kind, payload.len());
    buf.reserve(TLV_HEADER_LEN + payload.len());
    buf.put_slice(TlvHeader::new(kind, length.unwrap_or(u16::MAX)).as_bytes());
    buf.put_slice(payload);
}

fn put_nested(buf: &mut BytesMut, kind: u16, payload: &[u8]) {
    put_record(buf, kind, payload);
    buf.put_bytes(0, padding(payload.len()));
}

/// Bytes needed to bring a nested payload of `len` bytes to a 4-byte boundary.
pub fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Iterates the top-level records of one datagram in wire order.
///
/// Each successful step consumes exactly `4 + length` bytes. The first
/// malformed record yields an error and ends the iteration; records before
/// it have already been handed out and remain valid.
#[derive(Debug, Clone)]
pub struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> RecordReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            failed: false,
        }
    }

    /// Bytes consumed by successfully decoded records so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    fn read_record(&mut self) -> Result<Record, WireError> {
        let remaining = &self.buf[self.pos..];
        let (kind, payload) = split_tlv(remaining)?;
        let record = decode_payload(kind, payload)?;
        self.pos += TLV_HEADER_LEN + payload.len();
        Ok(record)
    }
}

impl Iterator for RecordReader<'_> {
    type Item = Result<Record, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        let result = self.read_record();
        self.failed = result.is_err();
        Some(result)
    }
}

impl FusedIterator for RecordReader<'_> {}

/// Decode a whole datagram, stopping at the first malformed record.
pub fn decode_all(buf: &[u8]) -> Result<Vec<Record>, WireError> {
    RecordReader::new(buf).collect()
}

/// Split one TLV off the front of `buf`, returning its type and payload.
fn split_tlv(buf: &[u8]) -> Result<(u16, &[u8]), WireError> {
    let header = TlvHeader::read_from_prefix(buf).ok_or(WireError::Truncated {
        needed: TLV_HEADER_LEN,
        remaining: buf.len(),
    })?;
    let kind = header.kind.get();
    let length = header.length.get() as usize;
    let body = &buf[TLV_HEADER_LEN..];
    let payload = body.get(..length).ok_or(WireError::LengthOverrun {
        kind,
        length,
        remaining: body.len(),
    })?;
    Ok((kind, payload))
}

fn fixed<T: FromBytes>(kind: u16, payload: &[u8]) -> Result<T, WireError> {
    T::read_from_prefix(payload).ok_or(WireError::ShortPayload {
        kind,
        length: payload.len(),
        expected: size_of::<T>(),
    })
}

fn decode_payload(kind: u16, payload: &[u8]) -> Result<Record, WireError> {
    match kind {
        REQUEST_NETWORK_STATE => Ok(Record::RequestNetworkState),
        REQUEST_NODE_STATE => {
            let body: NodeIdBody = fixed(kind, payload)?;
            Ok(Record::RequestNodeState {
                node_id: NodeId(body.node_id.get()),
            })
        }
        NODE_ENDPOINT => {
            let body: NodeEndpointBody = fixed(kind, payload)?;
            Ok(Record::NodeEndpoint {
                node_id: NodeId(body.node_id.get()),
                endpoint_id: body.endpoint_id.get(),
            })
        }
        NETWORK_STATE => {
            let body: NetworkStateBody = fixed(kind, payload)?;
            Ok(Record::NetworkState {
                hash: Hash(body.hash.get()),
            })
        }
        NODE_STATE => decode_node_state(payload).map(Record::NodeState),
        _ => Ok(Record::Unknown {
            kind,
            length: payload.len() as u16,
        }),
    }
}

fn decode_node_state(payload: &[u8]) -> Result<NodeState, WireError> {
    let header: NodeStateHeader = fixed(NODE_STATE, payload)?;
    let mut nested = &payload[NODE_STATE_HEADER_LEN..];
    let mut peers = Vec::new();
    let mut skipped = 0;

    while !nested.is_empty() {
        let (kind, body) = split_tlv(nested)?;
        match kind {
            PEER => {
                let peer: PeerBody = fixed(kind, body)?;
                peers.push(Peer::from(&peer));
            }
            _ => skipped += 1,
        }
        // The last sub-record's padding may be cut off by the parent length.
        let step = (TLV_HEADER_LEN + body.len() + padding(body.len())).min(nested.len());
        nested = &nested[step..];
    }

    Ok(NodeState {
        node_id: NodeId(header.node_id.get()),
        seqno: header.seqno.get(),
        origin_age: header.origin_age.get(),
        hash: Hash(header.hash.get()),
        peers,
        skipped,
    })
}

// ── Constants ────────────────────────────────────────────────────────────────

/// IPv6 link-local multicast group the protocol speaks on.
pub const MULTICAST_GROUP: &str = "ff02::11";

/// UDP port of the protocol.
pub const PROTOCOL_PORT: u16 = 8231;

/// Largest datagram the listener will accept.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// Neighbours silent for longer than this are evicted.
pub const NEIGHBOUR_TIMEOUT_SECS: u64 = 105;

/// Interval between liveness sweeps.
pub const REAP_INTERVAL_SECS: u64 = 30;

/// Interval between aggregation passes over the node tables.
pub const AGGREGATE_INTERVAL_SECS: u64 = 7;

// ── Errors ───────────────────────────────────────────────────────────────────

/// A datagram that cannot be decoded past some point.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated record header: need {needed} bytes, {remaining} remain")]
    Truncated { needed: usize, remaining: usize },

    #[error("record type {kind} declares {length} payload bytes, only {remaining} remain")]
    LengthOverrun {
        kind: u16,
        length: usize,
        remaining: usize,
    },

    #[error("record type {kind} payload is {length} bytes, need at least {expected}")]
    ShortPayload {
        kind: u16,
        length: usize,
        expected: usize,
    },
}

// ── Tests ────────────────────────────────────────────────────────────────────
