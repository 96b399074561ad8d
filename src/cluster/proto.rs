// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Wire messages exchanged by the membership protocol.
//!
//! Everything here is proto3-compatible and framed with length-delimited
//! encoding by whatever transport carries it. The structs are hand-derived
//! [prost] messages rather than generated code, since the transport itself
//! is abstract (see [crate::transport]).
use prost::{Enumeration, Message, Oneof};
use rand::random;
use std::{
    cmp,
    collections::HashMap,
    convert::TryFrom,
    fmt,
    hash::{Hash, Hasher},
    net::{IpAddr, SocketAddr},
    ops::{Deref, DerefMut},
};
use thiserror::Error;

/// Derive `Eq`/`Ord`/`Hash` for a message type in terms of an accessor over
/// its fields. Wire messages only get `PartialEq` from prost; the protocol
/// needs a total order on some of them (ring placement, rank comparison).
macro_rules! derive_cmp_with {
    ($type:ty, $access:ident => $get:expr) => {
        impl Eq for $type {}

        impl PartialOrd for $type {
            fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $type {
            fn cmp(&self, other: &Self) -> cmp::Ordering {
                fn access(e: &$type) -> impl Ord + '_ {
                    let $access = e;
                    $get
                }

                access(self).cmp(&access(other))
            }
        }

        #[allow(clippy::derive_hash_xor_eq)]
        impl Hash for $type {
            fn hash<H: Hasher>(&self, state: &mut H) {
                let $access = self;
                ($get).hash(state);
            }
        }
    };
}

/// A network address another member can be reached at.
#[derive(Clone, PartialEq, Message)]
pub struct Endpoint {
    /// Raw host bytes: 4 (v4) or 16 (v6) octets, or a utf-8 hostname.
    #[prost(bytes = "vec", tag = "1")]
    pub hostname: Vec<u8>,
    /// Port in `0..=65535`.
    #[prost(int32, tag = "2")]
    pub port: i32,
}

derive_cmp_with!(Endpoint, e => (&e.hostname, e.port));

/// A 128-bit identifier unique to one incarnation of a node.
#[derive(Clone, PartialEq, Message)]
pub struct NodeId {
    #[prost(int64, tag = "1")]
    pub high: i64,
    #[prost(int64, tag = "2")]
    pub low: i64,
}

derive_cmp_with!(NodeId, id => u128::from(id));

/// Free-form metadata a member distributes at join time.
#[derive(Clone, PartialEq, Message)]
pub struct Metadata {
    #[prost(map = "string, bytes", tag = "1")]
    pub fields: HashMap<String, Vec<u8>>,
}

/// The state of a monitored edge, as asserted by its observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Enumeration)]
#[repr(i32)]
pub enum EdgeStatus {
    /// The edge's destination is reachable and should be admitted.
    Up = 0,
    /// The edge's destination is faulty and should be ejected.
    Down = 1,
}

/// Verdict returned to a prospective joiner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Enumeration)]
#[repr(i32)]
pub enum JoinStatusCode {
    /// The join may proceed; the response carries the new configuration.
    SafeToJoin = 0,
    /// This exact (endpoint, id) pair is already a member.
    SameNodeAlreadyInRing = 1,
    /// The endpoint is a member under a different id.
    HostnameAlreadyInRing = 2,
    /// The id was already used by some member.
    UuidAlreadyInRing = 3,
    /// A view change is being agreed on; retry later.
    ViewChangeInProgress = 4,
}

/// Health reported by a probed node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Enumeration)]
#[repr(i32)]
pub enum NodeStatus {
    /// Serving an active configuration.
    Ok = 0,
    /// Still joining; not yet part of an active configuration.
    Bootstrapping = 1,
}

/// An observer's statement about one edge in one configuration.
///
/// `ring_number` lists every ring on which `edge_src` observes `edge_dst`,
/// so a single message covers all of their shared rings.
#[derive(Clone, PartialEq, Message)]
pub struct AlertMessage {
    #[prost(message, required, tag = "1")]
    pub edge_src: Endpoint,
    #[prost(message, required, tag = "2")]
    pub edge_dst: Endpoint,
    #[prost(enumeration = "EdgeStatus", tag = "3")]
    pub edge_status: i32,
    #[prost(uint64, tag = "4")]
    pub configuration_id: u64,
    #[prost(int32, repeated, tag = "5")]
    pub ring_number: Vec<i32>,
    /// Set on UP alerts: the joiner's id.
    #[prost(message, optional, tag = "6")]
    pub node_id: Option<NodeId>,
    /// Set on UP alerts: the joiner's metadata.
    #[prost(message, optional, tag = "7")]
    pub metadata: Option<Metadata>,
}

/// A batch of alerts flushed by one sender's batching window.
#[derive(Clone, PartialEq, Message)]
pub struct BatchedAlertMessage {
    #[prost(message, required, tag = "1")]
    pub sender: Endpoint,
    #[prost(message, repeated, tag = "2")]
    pub messages: Vec<AlertMessage>,
}

/// A request to join the cluster, sent to any active member.
#[derive(Clone, PartialEq, Message)]
pub struct JoinMessage {
    #[prost(message, required, tag = "1")]
    pub sender: Endpoint,
    #[prost(message, required, tag = "2")]
    pub node_id: NodeId,
    #[prost(message, required, tag = "3")]
    pub metadata: Metadata,
}

/// The outcome of a join request.
///
/// `endpoints` and `identifiers` are parallel arrays in ring-0 order, as are
/// `metadata_keys` and `metadata_values`; a joiner rebuilds the full
/// configuration from them.
#[derive(Clone, PartialEq, Message)]
pub struct JoinResponse {
    #[prost(message, required, tag = "1")]
    pub sender: Endpoint,
    #[prost(enumeration = "JoinStatusCode", tag = "2")]
    pub status_code: i32,
    #[prost(uint64, tag = "3")]
    pub configuration_id: u64,
    #[prost(message, repeated, tag = "4")]
    pub endpoints: Vec<Endpoint>,
    #[prost(message, repeated, tag = "5")]
    pub identifiers: Vec<NodeId>,
    #[prost(message, repeated, tag = "6")]
    pub metadata_keys: Vec<Endpoint>,
    #[prost(message, repeated, tag = "7")]
    pub metadata_values: Vec<Metadata>,
}

/// A liveness probe from an observer.
#[derive(Clone, PartialEq, Message)]
pub struct ProbeMessage {
    #[prost(message, required, tag = "1")]
    pub sender: Endpoint,
}

/// The probed node's health.
#[derive(Clone, PartialEq, Message)]
pub struct ProbeResponse {
    #[prost(enumeration = "NodeStatus", tag = "1")]
    pub status: i32,
}

/// A graceful departure announcement, sent to the leaver's observers.
#[derive(Clone, PartialEq, Message)]
pub struct LeaveMessage {
    #[prost(message, required, tag = "1")]
    pub sender: Endpoint,
}

/// A consensus rank: `(round, node_index)` compared lexicographically.
#[derive(Clone, PartialEq, Message)]
pub struct Rank {
    #[prost(uint32, tag = "1")]
    pub round: u32,
    #[prost(uint64, tag = "2")]
    pub node_index: u64,
}

derive_cmp_with!(Rank, r => (r.round, r.node_index));

/// A fast-round vote for a view-change proposal.
#[derive(Clone, PartialEq, Message)]
pub struct FastRoundPhase2bMessage {
    #[prost(message, required, tag = "1")]
    pub sender: Endpoint,
    #[prost(uint64, tag = "2")]
    pub configuration_id: u64,
    #[prost(message, repeated, tag = "3")]
    pub endpoints: Vec<Endpoint>,
}

/// Classic-round prepare, broadcast by a coordinator.
#[derive(Clone, PartialEq, Message)]
pub struct Phase1aMessage {
    #[prost(message, required, tag = "1")]
    pub sender: Endpoint,
    #[prost(uint64, tag = "2")]
    pub configuration_id: u64,
    #[prost(message, required, tag = "3")]
    pub rank: Rank,
}

/// Classic-round promise, unicast back to the coordinator.
#[derive(Clone, PartialEq, Message)]
pub struct Phase1bMessage {
    #[prost(message, required, tag = "1")]
    pub sender: Endpoint,
    #[prost(uint64, tag = "2")]
    pub configuration_id: u64,
    #[prost(message, required, tag = "3")]
    pub rnd: Rank,
    #[prost(message, required, tag = "4")]
    pub vrnd: Rank,
    #[prost(message, repeated, tag = "5")]
    pub vval: Vec<Endpoint>,
}

/// Classic-round accept request, broadcast by the coordinator.
#[derive(Clone, PartialEq, Message)]
pub struct Phase2aMessage {
    #[prost(message, required, tag = "1")]
    pub sender: Endpoint,
    #[prost(uint64, tag = "2")]
    pub configuration_id: u64,
    #[prost(message, required, tag = "3")]
    pub rnd: Rank,
    #[prost(message, repeated, tag = "4")]
    pub vval: Vec<Endpoint>,
}

/// Classic-round accepted vote, broadcast by an acceptor.
#[derive(Clone, PartialEq, Message)]
pub struct Phase2bMessage {
    #[prost(message, required, tag = "1")]
    pub sender: Endpoint,
    #[prost(uint64, tag = "2")]
    pub configuration_id: u64,
    #[prost(message, required, tag = "3")]
    pub rnd: Rank,
    #[prost(message, repeated, tag = "4")]
    pub endpoints: Vec<Endpoint>,
}

/// An empty acknowledgement.
#[derive(Clone, PartialEq, Message)]
pub struct Response {}

/// An empty acknowledgement for consensus traffic.
#[derive(Clone, PartialEq, Message)]
pub struct ConsensusResponse {}

/// The discriminated union of every peer-to-peer request.
#[derive(Clone, PartialEq, Message)]
pub struct RapidRequest {
    #[prost(oneof = "rapid_request::Content", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9")]
    pub content: Option<rapid_request::Content>,
}

pub mod rapid_request {
    //! Request payload variants.
    use super::*;

    /// One protocol request.
    #[derive(Clone, PartialEq, Oneof)]
    pub enum Content {
        /// A join request.
        #[prost(message, tag = "1")]
        Join(JoinMessage),
        /// A batch of edge alerts.
        #[prost(message, tag = "2")]
        BatchedAlert(BatchedAlertMessage),
        /// A liveness probe.
        #[prost(message, tag = "3")]
        Probe(ProbeMessage),
        /// A fast-round vote.
        #[prost(message, tag = "4")]
        FastRoundPhase2b(FastRoundPhase2bMessage),
        /// A classic-round prepare.
        #[prost(message, tag = "5")]
        Phase1a(Phase1aMessage),
        /// A classic-round promise.
        #[prost(message, tag = "6")]
        Phase1b(Phase1bMessage),
        /// A classic-round accept request.
        #[prost(message, tag = "7")]
        Phase2a(Phase2aMessage),
        /// A classic-round accepted vote.
        #[prost(message, tag = "8")]
        Phase2b(Phase2bMessage),
        /// A graceful departure announcement.
        #[prost(message, tag = "9")]
        Leave(LeaveMessage),
    }
}

/// The discriminated union of every peer-to-peer response.
#[derive(Clone, PartialEq, Message)]
pub struct RapidResponse {
    #[prost(oneof = "rapid_response::Content", tags = "1, 2, 3, 4")]
    pub content: Option<rapid_response::Content>,
}

pub mod rapid_response {
    //! Response payload variants.
    use super::*;

    /// One protocol response.
    #[derive(Clone, PartialEq, Oneof)]
    pub enum Content {
        /// The outcome of a join request.
        #[prost(message, tag = "1")]
        Join(JoinResponse),
        /// An empty acknowledgement.
        #[prost(message, tag = "2")]
        Response(Response),
        /// An empty consensus acknowledgement.
        #[prost(message, tag = "3")]
        Consensus(ConsensusResponse),
        /// The probed node's health.
        #[prost(message, tag = "4")]
        Probe(ProbeResponse),
    }
}

macro_rules! into_request {
    ($($type:ty => $variant:ident),* $(,)?) => {$(
        impl From<$type> for RapidRequest {
            fn from(msg: $type) -> Self {
                RapidRequest {
                    content: Some(rapid_request::Content::$variant(msg)),
                }
            }
        }
    )*};
}

into_request! {
    JoinMessage => Join,
    BatchedAlertMessage => BatchedAlert,
    ProbeMessage => Probe,
    FastRoundPhase2bMessage => FastRoundPhase2b,
    Phase1aMessage => Phase1a,
    Phase1bMessage => Phase1b,
    Phase2aMessage => Phase2a,
    Phase2bMessage => Phase2b,
    LeaveMessage => Leave,
}

macro_rules! into_response {
    ($($type:ty => $variant:ident),* $(,)?) => {$(
        impl From<$type> for RapidResponse {
            fn from(msg: $type) -> Self {
                RapidResponse {
                    content: Some(rapid_response::Content::$variant(msg)),
                }
            }
        }
    )*};
}

into_response! {
    JoinResponse => Join,
    Response => Response,
    ConsensusResponse => Consensus,
    ProbeResponse => Probe,
}

impl RapidResponse {
    /// An empty acknowledgement.
    pub fn empty() -> Self {
        Response {}.into()
    }

    /// An empty consensus acknowledgement.
    pub fn consensus() -> Self {
        ConsensusResponse {}.into()
    }

    /// A probe response with the given status.
    pub fn probe(status: NodeStatus) -> Self {
        ProbeResponse {
            status: status as i32,
        }
        .into()
    }
}

/// The ways an [Endpoint] can fail validation or conversion.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum EndpointError {
    /// The host field is empty, or neither 4 nor 16 octets.
    #[error("invalid host len: {}", .0)]
    InvalidLen(usize),
    /// The port is outside `0..=65535`.
    #[error("invalid port: {}", .0)]
    InvalidPort(i32),
}

impl TryFrom<&Endpoint> for SocketAddr {
    type Error = EndpointError;

    fn try_from(Endpoint { hostname, port }: &Endpoint) -> Result<Self, Self::Error> {
        let port = u16::try_from(*port).map_err(|_| EndpointError::InvalidPort(*port))?;

        match hostname.len() {
            4 => Ok(SocketAddr::new(
                IpAddr::from(<[u8; 4]>::try_from(hostname.as_slice()).unwrap()),
                port,
            )),
            16 => Ok(SocketAddr::new(
                IpAddr::from(<[u8; 16]>::try_from(hostname.as_slice()).unwrap()),
                port,
            )),
            n => Err(EndpointError::InvalidLen(n)),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        let hostname = match addr {
            SocketAddr::V4(s) => s.ip().octets().to_vec(),
            SocketAddr::V6(s) => s.ip().octets().to_vec(),
        };

        Self {
            hostname,
            port: addr.port() as i32,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match SocketAddr::try_from(self) {
            Ok(addr) => write!(f, "{}", addr),
            Err(_) => write!(
                f,
                "{}:{}",
                String::from_utf8_lossy(&self.hostname),
                self.port
            ),
        }
    }
}

impl Endpoint {
    /// Construct an endpoint from raw host bytes and a port.
    pub fn new<H: Into<Vec<u8>>>(hostname: H, port: i32) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// Validate that the endpoint could identify a network peer.
    pub fn validate(&self) -> Result<(), EndpointError> {
        if self.hostname.is_empty() {
            return Err(EndpointError::InvalidLen(0));
        }
        if u16::try_from(self.port).is_err() {
            return Err(EndpointError::InvalidPort(self.port));
        }

        Ok(())
    }
}

impl From<&NodeId> for u128 {
    fn from(id: &NodeId) -> Self {
        ((id.high as u128) << 64) | id.low as u64 as u128
    }
}

impl From<u128> for NodeId {
    fn from(x: u128) -> Self {
        Self {
            high: (x >> 64) as i64,
            low: x as u64 as i64,
        }
    }
}

impl NodeId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        random::<u128>().into()
    }
}

impl Deref for Metadata {
    type Target = HashMap<String, Vec<u8>>;

    fn deref(&self) -> &Self::Target {
        &self.fields
    }
}

impl DerefMut for Metadata {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.fields
    }
}

impl AlertMessage {
    /// The decoded edge status.
    pub fn status(&self) -> EdgeStatus {
        EdgeStatus::try_from(self.edge_status).unwrap_or_default()
    }
}

impl JoinResponse {
    /// The decoded status code.
    pub fn status(&self) -> JoinStatusCode {
        JoinStatusCode::try_from(self.status_code).unwrap_or_default()
    }
}

impl ProbeResponse {
    /// The decoded node status.
    pub fn node_status(&self) -> NodeStatus {
        NodeStatus::try_from(self.status).unwrap_or_default()
    }
}

impl Rank {
    /// Construct a rank.
    pub const fn new(round: u32, node_index: u64) -> Self {
        Self { round, node_index }
    }

    /// The lowest rank; no vote has occurred at it.
    pub const fn zero() -> Self {
        Self::new(0, 0)
    }

    /// The distinguished rank of the fast round.
    pub const fn fast_round() -> Self {
        Self::new(1, 1)
    }
}
