// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Best-effort broadcast by unicasting to every member.
use super::proto::{Endpoint, RapidRequest};
use crate::transport::Client;
use futures::future::join_all;
use log::debug;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time};

/// Fans a request out to every member of the current configuration,
/// including the local node (whose copy loops back over the transport).
///
/// The recipient list is owned by the state machine and only replaced from
/// inside its mailbox, on view changes.
pub(crate) struct Broadcaster {
    client: Arc<dyn Client>,
    recipients: Vec<Endpoint>,
    timeout: Duration,
}

impl Broadcaster {
    pub(crate) fn new(client: Arc<dyn Client>, timeout: Duration) -> Self {
        Self {
            client,
            recipients: vec![],
            timeout,
        }
    }

    /// Replace the recipient list.
    pub(crate) fn set_membership(&mut self, recipients: Vec<Endpoint>) {
        self.recipients = recipients;
    }

    /// Unicast `request` to every recipient. The returned handle settles
    /// once every send has resolved; failures are absorbed with a log line.
    pub(crate) fn broadcast(&self, request: RapidRequest) -> JoinHandle<()> {
        let client = Arc::clone(&self.client);
        let recipients = self.recipients.clone();
        let deadline = self.timeout;

        tokio::spawn(async move {
            let sends = recipients.into_iter().map(|peer| {
                let client = Arc::clone(&client);
                let request = request.clone();

                async move {
                    match time::timeout(deadline, client.send(&peer, request)).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => debug!("broadcast to {} failed: {}", peer, e),
                        Err(_) => debug!("broadcast to {} timed out", peer),
                    }
                }
            });

            join_all(sends).await;
        })
    }
}
