// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! A decentralized cluster membership engine based on the [rapid] protocol.
//!
//! Every node runs the same logic: a k-ring [membership view], per-edge
//! [fault detection], [cut detection] that aggregates alerts into a
//! view-change proposal, and [fast paxos] consensus that turns the proposal
//! into the next totally-ordered configuration.
//!
//! Build a member with [Cluster], back it with any [transport::Client], and
//! route inbound requests through [Handle::handle_request].
//!
//! # References
//! * [Stable and Consistent Membership at Scale with Rapid][rapid]
//! * [Fast Paxos][fast paxos]
//!
//! [rapid]: https://arxiv.org/abs/1803.03620
//! [fast paxos]: https://www.microsoft.com/en-us/research/wp-content/uploads/2016/02/tr-2005-112.pdf
//! [membership view]: cluster::view::MembershipView
//! [fault detection]: cluster::faultdetect::AdaptiveAccrualFailureDetector
//! [cut detection]: cluster::cut::MultiNodeCutDetector
#![warn(rust_2018_idioms, missing_docs)]

pub mod cluster;
pub mod node;
pub mod rings;
pub mod simulation;
pub mod transport;

#[doc(inline)]
pub use cluster::{
    cut::{ClusterEvent, NodeStatusChange, ViewChange},
    proto::{Endpoint, Metadata, NodeId},
    view::Configuration,
};
#[doc(inline)]
pub use node::{Cluster, Handle, Settings};

/// A re-export of [async_trait](https://docs.rs/async-trait) for
/// implementing [transport::Client].
#[doc(inline)]
pub use async_trait::async_trait;
