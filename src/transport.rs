// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! The abstract RPC transport the protocol runs over.
//!
//! All peer-to-peer traffic is a single request/response exchange of the
//! wire messages in [crate::cluster::proto]. The engine is written against
//! the [Client] trait; a real deployment backs it with its RPC stack of
//! choice, and tests back it with [crate::simulation::Network]. Server-side
//! dispatch is a plain call into
//! [Handle::handle_request](crate::Handle::handle_request).
use crate::cluster::proto::{Endpoint, RapidRequest, RapidResponse};
use async_trait::async_trait;
use thiserror::Error;

/// An error raised by a transport implementation.
///
/// Best-effort sends (alerts, consensus, probes) absorb these with a log
/// line; the join path surfaces them to its retry policy.
#[derive(Debug, Error)]
pub enum Error {
    /// No route to the peer.
    #[error("unreachable: {}", .0)]
    Unreachable(Endpoint),

    /// The peer did not answer within the caller's deadline.
    #[error("request timed out")]
    Timeout,

    /// The peer answered with bytes that don't decode.
    #[error("codec: {}", .0)]
    Codec(#[from] prost::DecodeError),

    /// The peer failed the request.
    #[error("remote: {}", .0)]
    Remote(String),

    /// The transport (or the local node behind it) has shut down.
    #[error("transport closed")]
    Closed,
}

/// A thread-safe client capable of reaching any peer endpoint.
///
/// Implementations own their connection management; retry and tear-down on
/// connection error are their responsibility. Per-peer request ordering is
/// assumed to be FIFO.
#[async_trait]
pub trait Client: Send + Sync + 'static {
    /// Send `request` to `to` and await its response.
    async fn send(&self, to: &Endpoint, request: RapidRequest) -> Result<RapidResponse, Error>;
}
