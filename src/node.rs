// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Building, bootstrapping and joining a cluster member.
use crate::cluster::{
    self,
    cut::{ClusterEvent, MultiNodeCutDetector, ValidityError},
    proto::{
        rapid_response, Endpoint, EndpointError, JoinMessage, JoinResponse, JoinStatusCode,
        Metadata, NodeId, RapidRequest, RapidResponse,
    },
    view::{Configuration, MembershipView, ViewError},
    Msg, SpawnArgs,
};
use crate::transport::{self, Client};
use log::{info, warn};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time,
};

/// An error raised while building or operating a cluster member.
#[derive(Debug, Error)]
pub enum Error {
    /// The protocol parameters are inconsistent.
    #[error("invalid protocol configuration: {}", .0)]
    Config(#[from] ValidityError),

    /// A tuning parameter is out of range.
    #[error("invalid setting: {}", .0)]
    InvalidSetting(&'static str),

    /// The local or seed endpoint is malformed.
    #[error("invalid endpoint: {}", .0)]
    Endpoint(#[from] EndpointError),

    /// A join response carried an inconsistent configuration.
    #[error("membership view: {}", .0)]
    View(#[from] ViewError),

    /// Every join attempt was exhausted without a `SAFE_TO_JOIN`.
    #[error("join failed after {} attempt(s)", .0)]
    JoinFailed(usize),

    /// The request does not apply to the node's current state.
    #[error("message in invalid state: {}", .0)]
    InvalidState(&'static str),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] transport::Error),

    /// The node has shut down.
    #[error("node has shut down")]
    Closed,
}

/// Protocol tuning parameters.
///
/// Every member of a cluster must run with the same `k`, `h` and `l`.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Rings per member (the protocol constant `K`).
    pub k: usize,
    /// High watermark: reports on `h` rings stabilize a destination into a
    /// proposal.
    pub h: usize,
    /// Low watermark: reports on `l` rings place a destination in the
    /// unstable band.
    pub l: usize,

    /// Tick interval of each edge monitor.
    pub failure_detector_interval: Duration,
    /// Per-probe response deadline.
    pub probe_timeout: Duration,
    /// Delay before the synthetic heartbeat that seeds the interval sample.
    pub expect_first_heartbeat_after: Duration,
    /// Accrual suspicion threshold `θ`.
    pub fd_threshold: f64,
    /// Accrual sample capacity `N_max`.
    pub fd_max_sample_size: usize,
    /// Accrual silence scaling factor `α`.
    pub fd_scaling_factor: f64,

    /// Width of the alert batching window.
    pub batching_window: Duration,

    /// Join attempts before giving up.
    pub join_attempts: usize,
    /// Delay between join attempts (except on a fresh-id retry).
    pub join_delay: Duration,
    /// Client-side deadline for one join exchange.
    pub join_timeout: Duration,

    /// Deadline for ordinary peer-to-peer requests.
    pub request_timeout: Duration,
    /// Base delay before the classic-round consensus fallback.
    pub consensus_fallback_base: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            k: 10,
            h: 9,
            l: 4,
            failure_detector_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            expect_first_heartbeat_after: Duration::from_secs(2),
            fd_threshold: 0.2,
            fd_max_sample_size: 1000,
            fd_scaling_factor: 0.9,
            batching_window: Duration::from_millis(100),
            join_attempts: 10,
            join_delay: Duration::from_secs(5),
            join_timeout: Duration::from_secs(12),
            request_timeout: Duration::from_secs(5),
            consensus_fallback_base: Duration::from_secs(10),
        }
    }
}

/// An unstarted cluster member.
///
/// Configure it, then either [start](Cluster::start) a fresh single-node
/// cluster or [join](Cluster::join) an existing one through a seed.
pub struct Cluster {
    settings: Settings,
    metadata: Metadata,
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster {
    /// A member with the default configuration.
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            metadata: Metadata::default(),
        }
    }

    /// A member with reduced timeouts and faster fault detection, at the
    /// expense of significantly more probe traffic.
    ///
    /// This should generally be avoided except in test code.
    pub fn low_latency() -> Self {
        Self::new()
            .failure_detector_interval(Duration::from_millis(150))
            .probe_timeout(Duration::from_millis(100))
            .expect_first_heartbeat_after(Duration::from_millis(300))
            .accrual_detector(0.2, 1000, 0.5)
            .batching_window(Duration::from_millis(50))
            .join_delay(Duration::from_millis(250))
            .join_timeout(Duration::from_secs(5))
            .request_timeout(Duration::from_secs(1))
            .consensus_fallback_base(Duration::from_secs(3))
    }

    /// Configure the cut detector. All members must agree on these.
    pub fn cut_detection(mut self, k: usize, h: usize, l: usize) -> Self {
        self.settings.k = k;
        self.settings.h = h;
        self.settings.l = l;
        self
    }

    /// Set the edge monitor tick interval.
    pub fn failure_detector_interval(mut self, interval: Duration) -> Self {
        self.settings.failure_detector_interval = interval;
        self
    }

    /// Set the per-probe response deadline.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.settings.probe_timeout = timeout;
        self
    }

    /// Set the delay before the synthetic first heartbeat.
    pub fn expect_first_heartbeat_after(mut self, delay: Duration) -> Self {
        self.settings.expect_first_heartbeat_after = delay;
        self
    }

    /// Configure the accrual detector: suspicion threshold `θ`, sample
    /// capacity `N_max` and silence scaling factor `α`.
    pub fn accrual_detector(mut self, threshold: f64, max_sample_size: usize, scaling_factor: f64) -> Self {
        self.settings.fd_threshold = threshold;
        self.settings.fd_max_sample_size = max_sample_size;
        self.settings.fd_scaling_factor = scaling_factor;
        self
    }

    /// Set the alert batching window.
    pub fn batching_window(mut self, window: Duration) -> Self {
        self.settings.batching_window = window;
        self
    }

    /// Set the number of join attempts before giving up.
    pub fn join_attempts(mut self, attempts: usize) -> Self {
        self.settings.join_attempts = attempts;
        self
    }

    /// Set the delay between join attempts.
    pub fn join_delay(mut self, delay: Duration) -> Self {
        self.settings.join_delay = delay;
        self
    }

    /// Set the client-side deadline for one join exchange.
    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.settings.join_timeout = timeout;
        self
    }

    /// Set the deadline for ordinary peer-to-peer requests.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.settings.request_timeout = timeout;
        self
    }

    /// Set the base delay before the classic-round consensus fallback.
    pub fn consensus_fallback_base(mut self, base: Duration) -> Self {
        self.settings.consensus_fallback_base = base;
        self
    }

    /// Add metadata to distribute to other members at join time.
    pub fn add_metadata<I: IntoIterator<Item = (String, Vec<u8>)>>(mut self, iter: I) -> Self {
        self.metadata.extend(iter);
        self
    }

    fn validate(&self) -> Result<(), Error> {
        MultiNodeCutDetector::new(self.settings.k, self.settings.h, self.settings.l)?;

        if self.settings.fd_threshold <= 0.0 {
            return Err(Error::InvalidSetting("fd_threshold must be positive"));
        }
        if self.settings.fd_max_sample_size == 0 {
            return Err(Error::InvalidSetting("fd_max_sample_size must be positive"));
        }
        if self.settings.fd_scaling_factor <= 0.0 {
            return Err(Error::InvalidSetting("fd_scaling_factor must be positive"));
        }
        if self.settings.join_attempts == 0 {
            return Err(Error::InvalidSetting("join_attempts must be positive"));
        }

        Ok(())
    }

    /// Bootstrap a new cluster with the local node as its only member.
    pub fn start(self, local: Endpoint, client: Arc<dyn Client>) -> Result<Handle, Error> {
        self.validate()?;
        local.validate()?;

        let mut view = MembershipView::new(self.settings.k);
        view.ring_add(local.clone(), NodeId::generate())
            .expect("a fresh view has no members");

        let metadata = HashMap::from([(local.clone(), self.metadata)]);

        info!("bootstrapping a new cluster at {}", local);
        let (inbox, events) = cluster::spawn(SpawnArgs {
            settings: Arc::new(self.settings),
            local: local.clone(),
            view,
            metadata,
            client,
        });

        Ok(Handle {
            local,
            inbox,
            events,
        })
    }

    /// Join an existing cluster through `seed`.
    ///
    /// Retries with a fresh id if the current one was already seen, and
    /// after [join_delay](Cluster::join_delay) on a busy or occupied seed,
    /// up to [join_attempts](Cluster::join_attempts) times.
    pub async fn join(
        self,
        local: Endpoint,
        seed: Endpoint,
        client: Arc<dyn Client>,
    ) -> Result<Handle, Error> {
        self.validate()?;
        local.validate()?;
        seed.validate()?;

        let settings = self.settings.clone();
        let mut node_id = NodeId::generate();

        for attempt in 1..=settings.join_attempts {
            let request: RapidRequest = JoinMessage {
                sender: local.clone(),
                node_id: node_id.clone(),
                metadata: self.metadata.clone(),
            }
            .into();

            let response = match time::timeout(settings.join_timeout, client.send(&seed, request))
                .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    warn!("join attempt {}/{} failed: {}", attempt, settings.join_attempts, e);
                    time::sleep(settings.join_delay).await;
                    continue;
                }
                Err(_) => {
                    warn!("join attempt {}/{} timed out", attempt, settings.join_attempts);
                    continue;
                }
            };

            let Some(rapid_response::Content::Join(join)) = response.content else {
                warn!("join attempt {}: seed is not accepting joins", attempt);
                time::sleep(settings.join_delay).await;
                continue;
            };

            match join.status() {
                JoinStatusCode::SafeToJoin => {
                    return self.finish_join(local, client, join);
                }

                JoinStatusCode::UuidAlreadyInRing => {
                    info!("join attempt {}: id collision, retrying with a fresh id", attempt);
                    node_id = NodeId::generate();
                }

                status => {
                    info!("join attempt {}: {:?}, retrying", attempt, status);
                    time::sleep(settings.join_delay).await;
                }
            }
        }

        Err(Error::JoinFailed(self.settings.join_attempts))
    }

    /// Adopt the configuration in a `SAFE_TO_JOIN` response and start the
    /// state machine against it.
    fn finish_join(
        self,
        local: Endpoint,
        client: Arc<dyn Client>,
        join: JoinResponse,
    ) -> Result<Handle, Error> {
        let members = (join.endpoints.iter().cloned()).zip(join.identifiers.iter().cloned());
        let mut view = MembershipView::with_members(self.settings.k, members)?;

        if view.configuration_id() != join.configuration_id {
            warn!(
                "adopted configuration hashes to {:#x}, seed said {:#x}",
                view.configuration_id(),
                join.configuration_id
            );
        }

        let metadata: HashMap<Endpoint, Metadata> = (join.metadata_keys.into_iter())
            .zip(join.metadata_values)
            .collect();

        info!(
            "joined configuration {:#x} with {} member(s)",
            view.configuration_id(),
            view.size()
        );

        let (inbox, events) = cluster::spawn(SpawnArgs {
            settings: Arc::new(self.settings),
            local: local.clone(),
            view,
            metadata,
            client,
        });

        Ok(Handle {
            local,
            inbox,
            events,
        })
    }
}

/// A running cluster member.
///
/// Cloning is cheap; all clones address the same state machine. The
/// embedding RPC server routes every inbound request through
/// [handle_request](Handle::handle_request).
#[derive(Clone)]
pub struct Handle {
    local: Endpoint,
    inbox: mpsc::Sender<Msg>,
    events: broadcast::Sender<ClusterEvent>,
}

impl Handle {
    /// The local node's endpoint.
    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    /// Serve one wire request.
    pub async fn handle_request(&self, request: RapidRequest) -> Result<RapidResponse, Error> {
        let (reply, rx) = oneshot::channel();

        (self.inbox)
            .send(Msg::Request { request, reply })
            .await
            .map_err(|_| Error::Closed)?;

        rx.await.map_err(|_| Error::Closed)
    }

    /// The current members, in ring-0 order.
    pub async fn member_list(&self) -> Result<Vec<Endpoint>, Error> {
        let (reply, rx) = oneshot::channel();

        (self.inbox)
            .send(Msg::MemberList { reply })
            .await
            .map_err(|_| Error::Closed)?;

        rx.await.map_err(|_| Error::Closed)
    }

    /// The full current configuration.
    pub async fn configuration(&self) -> Result<Configuration, Error> {
        let (reply, rx) = oneshot::channel();

        (self.inbox)
            .send(Msg::Configuration { reply })
            .await
            .map_err(|_| Error::Closed)?;

        rx.await.map_err(|_| Error::Closed)
    }

    /// Every member's metadata.
    pub async fn cluster_metadata(&self) -> Result<HashMap<Endpoint, Metadata>, Error> {
        let (reply, rx) = oneshot::channel();

        (self.inbox)
            .send(Msg::ClusterMetadata { reply })
            .await
            .map_err(|_| Error::Closed)?;

        rx.await.map_err(|_| Error::Closed)
    }

    /// Subscribe to [ClusterEvent]s. The subscription starts at the next
    /// event; the initial configuration is delivered to subscribers that
    /// attach before the state machine's first transition.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Announce departure to our observers, best-effort.
    ///
    /// Returns as soon as the notices are on the wire; whether to wait for
    /// the resulting view change before [shutdown](Handle::shutdown) is the
    /// caller's choice.
    pub async fn leave(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();

        (self.inbox)
            .send(Msg::Leave { reply })
            .await
            .map_err(|_| Error::Closed)?;

        rx.await.map_err(|_| Error::Closed)?
    }

    /// Stop the state machine. In-flight requests receive errors.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();

        (self.inbox)
            .send(Msg::Shutdown { reply })
            .await
            .map_err(|_| Error::Closed)?;

        rx.await.map_err(|_| Error::Closed)
    }
}
