// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! An in-memory transport for protocol tests.
//!
//! Routes requests directly between registered [Handle]s on one process,
//! while still round-tripping every message through its length-delimited
//! wire encoding, so tests exercise the same bytes a real transport would
//! carry.
use crate::cluster::proto::{Endpoint, RapidRequest, RapidResponse};
use crate::node::Handle;
use crate::transport::{Client, Error};
use async_trait::async_trait;
use prost::Message;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

#[derive(Default)]
struct Inner {
    peers: HashMap<Endpoint, Handle>,
    down: HashSet<Endpoint>,
}

/// A process-local network of cluster members.
#[derive(Default)]
pub struct Network {
    inner: Mutex<Inner>,
}

impl Network {
    /// Create an empty network, ready to use as a [Client].
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a member at its own endpoint.
    pub fn register(&self, handle: Handle) {
        let mut inner = self.inner.lock().expect("network lock");
        inner.down.remove(handle.local());
        inner.peers.insert(handle.local().clone(), handle);
    }

    /// Partition a member off: requests to it fail immediately, as they
    /// would against a crashed process.
    pub fn kill(&self, endpoint: &Endpoint) {
        let mut inner = self.inner.lock().expect("network lock");
        inner.peers.remove(endpoint);
        inner.down.insert(endpoint.clone());
    }
}

#[async_trait]
impl Client for Network {
    async fn send(&self, to: &Endpoint, request: RapidRequest) -> Result<RapidResponse, Error> {
        let handle = {
            let inner = self.inner.lock().expect("network lock");
            if inner.down.contains(to) {
                return Err(Error::Unreachable(to.clone()));
            }

            (inner.peers)
                .get(to)
                .cloned()
                .ok_or_else(|| Error::Unreachable(to.clone()))?
        };

        let bytes = request.encode_length_delimited_to_vec();
        let request = RapidRequest::decode_length_delimited(bytes.as_slice())?;

        let response = (handle.handle_request(request).await)
            .map_err(|e| Error::Remote(e.to_string()))?;

        let bytes = response.encode_length_delimited_to_vec();
        Ok(RapidResponse::decode_length_delimited(bytes.as_slice())?)
    }
}
