// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! A distributed membership protocol based closely on [rapid].
//!
//! Every member maintains a [MembershipView](view::MembershipView) of the
//! cluster: the same set of endpoints arranged on `k` rings. Ring neighbors
//! monitor each other; their alerts are batched, broadcast, and aggregated
//! by a [cut detector](cut::MultiNodeCutDetector) into a view-change
//! proposal, which [fast paxos](https://www.microsoft.com/en-us/research/wp-content/uploads/2016/02/tr-2005-112.pdf)
//! finalizes into the next configuration.
//!
//! The per-node engine lives in a single-consumer state machine driven by a
//! serialized mailbox; everything it owns (view, cut detector, consensus,
//! joiner bookkeeping) is touched from exactly one task.
//!
//! # References
//! * [Stable and Consistent Membership at Scale with Rapid][rapid]
//!
//! [rapid]: https://arxiv.org/abs/1803.03620
pub mod cut;
pub mod faultdetect;
pub mod proto;
pub mod view;

mod broadcast;
mod paxos;

use broadcast::Broadcaster;
use cut::{ClusterEvent, MultiNodeCutDetector, NodeStatusChange, ViewChange};
use faultdetect::{AdaptiveAccrualFailureDetector, EdgeMonitor};
use paxos::{Effect, FastPaxos};
use proto::{
    rapid_request::Content, AlertMessage, BatchedAlertMessage, EdgeStatus, Endpoint, JoinMessage,
    JoinResponse, JoinStatusCode, LeaveMessage, Metadata, NodeId, NodeStatus, RapidRequest,
    RapidResponse,
};
use view::MembershipView;

use crate::node::{Error, Settings};
use crate::rings::ring_hash;
use crate::transport::Client;

use log::{debug, error, info, warn};
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    mem,
    sync::Arc,
};
use tokio::{
    sync::{broadcast as events, mpsc, oneshot},
    task::JoinHandle,
    time::{self, Instant},
};

/// A message delivered into the state machine's mailbox.
pub(crate) enum Msg {
    /// A wire request; the reply closes the RPC.
    Request {
        request: RapidRequest,
        reply: oneshot::Sender<RapidResponse>,
    },
    /// An edge monitor found its subject unavailable.
    SubjectDown {
        configuration_id: u64,
        subject: Endpoint,
    },
    /// The alert batching window ticked.
    BatchTick,
    /// The classic-round fallback timer elapsed.
    FallbackElapsed { configuration_id: u64 },
    /// Facade: current members in ring-0 order.
    MemberList { reply: oneshot::Sender<Vec<Endpoint>> },
    /// Facade: the full current configuration.
    Configuration {
        reply: oneshot::Sender<view::Configuration>,
    },
    /// Facade: every member's metadata.
    ClusterMetadata {
        reply: oneshot::Sender<HashMap<Endpoint, Metadata>>,
    },
    /// Facade: announce departure to our observers.
    Leave {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    /// Facade: stop the state machine.
    Shutdown { reply: oneshot::Sender<()> },
}

/// What the state machine is doing with respect to configuration changes.
///
/// Postponed consensus messages live in `Active` and are replayed, in
/// arrival order, the moment the machine transitions into `ViewChanging`;
/// leavers observed mid-change are stashed and re-raised afterwards.
enum Phase {
    Initial,
    Active {
        postponed: VecDeque<Content>,
    },
    ViewChanging {
        consensus: FastPaxos,
        fallback: Option<JoinHandle<()>>,
        stashed_leavers: Vec<Endpoint>,
    },
    Leaving,
    Left,
}

/// Alerts waiting for the batching window.
#[derive(Default)]
struct AlertBatch {
    queue: Vec<AlertMessage>,
    last_enqueue: Option<Instant>,
}

pub(crate) struct SpawnArgs {
    pub(crate) settings: Arc<Settings>,
    pub(crate) local: Endpoint,
    pub(crate) view: MembershipView,
    pub(crate) metadata: HashMap<Endpoint, Metadata>,
    pub(crate) client: Arc<dyn Client>,
}

/// Start a state machine for an already-initialized view.
///
/// Returns the mailbox and the event channel; both are cheap to clone into
/// a facade handle.
pub(crate) fn spawn(args: SpawnArgs) -> (mpsc::Sender<Msg>, events::Sender<ClusterEvent>) {
    let (tx, rx) = mpsc::channel(1024);
    let (event_tx, _) = events::channel(64);

    let machine = StateMachine::new(args, tx.clone(), event_tx.clone());
    tokio::spawn(machine.run(rx));

    (tx, event_tx)
}

struct StateMachine {
    settings: Arc<Settings>,
    local: Endpoint,
    client: Arc<dyn Client>,
    inbox: mpsc::Sender<Msg>,
    events: events::Sender<ClusterEvent>,

    view: MembershipView,
    metadata: HashMap<Endpoint, Metadata>,
    cut_detector: MultiNodeCutDetector,
    broadcaster: Broadcaster,
    phase: Phase,
    batch: AlertBatch,

    // join bookkeeping for the in-flight configuration. all three are
    // consumed when a proposal is applied.
    joiner_ids: HashMap<Endpoint, NodeId>,
    joiner_metadata: HashMap<Endpoint, Metadata>,
    postponed_joiners: HashMap<Endpoint, oneshot::Sender<RapidResponse>>,

    monitors: Vec<JoinHandle<()>>,
    batch_ticker: Option<JoinHandle<()>>,
}

impl StateMachine {
    fn new(
        args: SpawnArgs,
        inbox: mpsc::Sender<Msg>,
        events: events::Sender<ClusterEvent>,
    ) -> Self {
        let SpawnArgs {
            settings,
            local,
            view,
            metadata,
            client,
        } = args;

        let cut_detector = MultiNodeCutDetector::new(settings.k, settings.h, settings.l)
            .expect("watermarks validated before spawn");

        let broadcaster = Broadcaster::new(Arc::clone(&client), settings.request_timeout);

        Self {
            settings,
            local,
            client,
            inbox,
            events,
            view,
            metadata,
            cut_detector,
            broadcaster,
            phase: Phase::Initial,
            batch: AlertBatch::default(),
            joiner_ids: HashMap::new(),
            joiner_metadata: HashMap::new(),
            postponed_joiners: HashMap::new(),
            monitors: Vec::new(),
            batch_ticker: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
        self.activate();

        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Request { request, reply } => self.handle_request(request, reply),
                Msg::SubjectDown {
                    configuration_id,
                    subject,
                } => self.handle_subject_down(configuration_id, subject),
                Msg::BatchTick => self.handle_batch_tick(),
                Msg::FallbackElapsed { configuration_id } => {
                    self.handle_fallback_elapsed(configuration_id)
                }
                Msg::MemberList { reply } => {
                    let _ = reply.send(self.view.configuration().endpoints.clone());
                }
                Msg::Configuration { reply } => {
                    let _ = reply.send(self.view.configuration().clone());
                }
                Msg::ClusterMetadata { reply } => {
                    let _ = reply.send(self.metadata.clone());
                }
                Msg::Leave { reply } => {
                    let _ = reply.send(self.handle_local_leave());
                }
                Msg::Shutdown { reply } => {
                    self.teardown();
                    let _ = reply.send(());
                    return;
                }
            }
        }

        self.teardown();
    }

    /// Enter the Active state for the current configuration: arm the cut
    /// detector's inputs, the alert batcher, and one monitor per subject.
    fn activate(&mut self) {
        let config = self.view.configuration().clone();

        self.broadcaster.set_membership(config.endpoints.clone());
        self.phase = Phase::Active {
            postponed: VecDeque::new(),
        };
        self.arm_monitors();
        self.arm_batch_ticker();

        // let subscribers see the configuration we came up with, without
        // racing the first real transition.
        let status_changes = (config.endpoints.iter())
            .map(|e| NodeStatusChange {
                endpoint: e.clone(),
                status: EdgeStatus::Up,
                metadata: self.metadata.get(e).cloned().unwrap_or_default(),
            })
            .collect();

        let _ = self.events.send(ClusterEvent::ViewChange(ViewChange {
            configuration_id: config.configuration_id,
            members: config.endpoints,
            status_changes,
        }));
    }

    fn teardown(&mut self) {
        self.cancel_monitors();
        if let Some(ticker) = self.batch_ticker.take() {
            ticker.abort();
        }
        if let Phase::ViewChanging { fallback, .. } = &mut self.phase {
            if let Some(f) = fallback.take() {
                f.abort();
            }
        }
        self.phase = Phase::Left;
    }

    // ---- wire request dispatch ---------------------------------------

    fn handle_request(&mut self, request: RapidRequest, reply: oneshot::Sender<RapidResponse>) {
        match request.content {
            None => {
                let _ = reply.send(RapidResponse::empty());
            }
            Some(Content::Join(join)) => self.handle_join(join, reply),
            Some(Content::BatchedAlert(batch)) => {
                self.handle_batched_alert(batch);
                let _ = reply.send(RapidResponse::empty());
            }
            Some(Content::Probe(_)) => {
                let status = match self.phase {
                    Phase::Initial => NodeStatus::Bootstrapping,
                    _ => NodeStatus::Ok,
                };
                let _ = reply.send(RapidResponse::probe(status));
            }
            Some(Content::Leave(leave)) => {
                self.handle_leave(leave);
                let _ = reply.send(RapidResponse::empty());
            }
            Some(consensus) => {
                self.handle_consensus(consensus);
                let _ = reply.send(RapidResponse::consensus());
            }
        }
    }

    // ---- join admission ----------------------------------------------

    fn handle_join(&mut self, join: JoinMessage, reply: oneshot::Sender<RapidResponse>) {
        match self.phase {
            Phase::Active { .. } => {}
            Phase::ViewChanging { .. } => {
                let _ = reply.send(self.join_response(JoinStatusCode::ViewChangeInProgress));
                return;
            }
            _ => {
                // peers in a terminal state answer with a plain response;
                // the joiner treats it like any other failed attempt.
                let _ = reply.send(RapidResponse::empty());
                return;
            }
        }

        let status = self.view.is_safe_to_join(&join.sender, &join.node_id);
        match status {
            JoinStatusCode::SafeToJoin => {
                info!("join requested: sender={}", join.sender);

                // the reply is deferred until the next configuration is
                // agreed on, so the joiner learns the view it is part of.
                self.postponed_joiners.insert(join.sender.clone(), reply);

                let configuration_id = self.view.configuration_id();
                let observers = self.view.expected_observers_of(&join.sender);

                let alerts: Vec<AlertMessage> = (observers.into_iter().enumerate())
                    .map(|(ring, observer)| AlertMessage {
                        edge_src: observer,
                        edge_dst: join.sender.clone(),
                        edge_status: EdgeStatus::Up as i32,
                        configuration_id,
                        ring_number: vec![ring as i32],
                        node_id: Some(join.node_id.clone()),
                        metadata: Some(join.metadata.clone()),
                    })
                    .collect();

                for alert in alerts {
                    self.enqueue_alert(alert);
                }
            }

            // a retry from a joiner whose response got lost in flight.
            JoinStatusCode::SameNodeAlreadyInRing => {
                let _ = reply.send(self.join_response(JoinStatusCode::SafeToJoin));
            }

            other => {
                debug!("rejecting join from {}: {:?}", join.sender, other);
                let _ = reply.send(self.join_response(other));
            }
        }
    }

    /// Build a join response against the current configuration. The full
    /// membership is attached only on `SafeToJoin`.
    fn join_response(&mut self, status: JoinStatusCode) -> RapidResponse {
        let mut resp = JoinResponse {
            sender: self.local.clone(),
            status_code: status as i32,
            configuration_id: self.view.configuration_id(),
            endpoints: vec![],
            identifiers: vec![],
            metadata_keys: vec![],
            metadata_values: vec![],
        };

        if status == JoinStatusCode::SafeToJoin {
            let config = self.view.configuration();
            resp.endpoints = config.endpoints.clone();
            resp.identifiers = config.node_ids.clone();

            for (endpoint, metadata) in &self.metadata {
                resp.metadata_keys.push(endpoint.clone());
                resp.metadata_values.push(metadata.clone());
            }
        }

        resp.into()
    }

    // ---- alert handling ----------------------------------------------

    /// Filters 1 and 2: configuration id, and presence consistent with the
    /// edge status.
    fn filter_alert(&mut self, alert: &AlertMessage) -> bool {
        if alert.configuration_id != self.view.configuration_id() {
            debug!(
                "dropping alert for configuration {} (current {})",
                alert.configuration_id,
                self.view.configuration_id()
            );
            return false;
        }

        match alert.status() {
            EdgeStatus::Up => !self.view.is_host_present(&alert.edge_dst),
            EdgeStatus::Down => self.view.is_host_present(&alert.edge_dst),
        }
    }

    fn handle_batched_alert(&mut self, batch: BatchedAlertMessage) {
        let in_active = matches!(self.phase, Phase::Active { .. });
        if matches!(self.phase, Phase::Initial) {
            return;
        }

        let mut proposal: BTreeSet<Endpoint> = BTreeSet::new();

        for alert in &batch.messages {
            if !self.filter_alert(alert) {
                continue;
            }

            // remember joiner identity even mid view-change, so a proposal
            // that includes the joiner can still be applied here.
            if alert.status() == EdgeStatus::Up {
                if let Some(id) = &alert.node_id {
                    self.joiner_ids.insert(alert.edge_dst.clone(), id.clone());
                }
                if let Some(meta) = &alert.metadata {
                    self.joiner_metadata
                        .insert(alert.edge_dst.clone(), meta.clone());
                }
            }

            if in_active {
                proposal.extend(self.cut_detector.aggregate(alert));
            }
        }

        if !in_active {
            return;
        }

        proposal.extend(self.cut_detector.invalidate_failing_edges(&mut self.view));

        if !proposal.is_empty() {
            self.start_view_change(proposal);
        }
    }

    fn enqueue_alert(&mut self, alert: AlertMessage) {
        self.batch.queue.push(alert);
        self.batch.last_enqueue = Some(Instant::now());
    }

    fn arm_batch_ticker(&mut self) {
        if self.batch_ticker.is_some() {
            return;
        }

        let inbox = self.inbox.clone();
        let window = self.settings.batching_window;

        self.batch_ticker = Some(tokio::spawn(async move {
            let mut ticker = time::interval(window);
            loop {
                ticker.tick().await;
                if inbox.send(Msg::BatchTick).await.is_err() {
                    return;
                }
            }
        }));
    }

    fn handle_batch_tick(&mut self) {
        let Some(last) = self.batch.last_enqueue else {
            return;
        };
        if last.elapsed() < self.settings.batching_window || self.batch.queue.is_empty() {
            return;
        }

        let messages = mem::take(&mut self.batch.queue);
        self.batch.last_enqueue = None;

        debug!("flushing {} alert(s)", messages.len());
        self.broadcaster.broadcast(
            BatchedAlertMessage {
                sender: self.local.clone(),
                messages,
            }
            .into(),
        );
    }

    // ---- fault detection ---------------------------------------------

    fn arm_monitors(&mut self) {
        self.cancel_monitors();

        let configuration_id = self.view.configuration_id();
        let subjects = match self.view.subjects_of(&self.local) {
            Ok(subjects) => subjects,
            // not a member (degraded); nothing to observe.
            Err(_) => return,
        };

        // we may observe the same subject on several rings; one monitor
        // per distinct subject suffices, since a failure report covers
        // every shared ring.
        let mut distinct = subjects;
        distinct.sort();
        distinct.dedup();

        for subject in distinct {
            let monitor = EdgeMonitor {
                local: self.local.clone(),
                subject,
                configuration_id,
                detector: AdaptiveAccrualFailureDetector::new(
                    self.settings.fd_threshold,
                    self.settings.fd_max_sample_size,
                    self.settings.fd_scaling_factor,
                ),
                client: Arc::clone(&self.client),
                inbox: self.inbox.clone(),
                interval: self.settings.failure_detector_interval,
                probe_timeout: self.settings.probe_timeout,
                expect_first_heartbeat_after: self.settings.expect_first_heartbeat_after,
            };

            self.monitors.push(tokio::spawn(monitor.run()));
        }
    }

    fn cancel_monitors(&mut self) {
        for monitor in self.monitors.drain(..) {
            monitor.abort();
        }
    }

    fn handle_subject_down(&mut self, configuration_id: u64, subject: Endpoint) {
        // a report raced a view change; the new configuration's monitors
        // will re-detect if the subject is still around and still dead.
        if configuration_id != self.view.configuration_id() {
            return;
        }

        let rings = match self.view.ring_numbers(&self.local, &subject) {
            Ok(rings) => rings,
            Err(_) => return,
        };
        if rings.is_empty() {
            return;
        }

        warn!("reporting subject down: subject={}", subject);
        self.enqueue_alert(AlertMessage {
            edge_src: self.local.clone(),
            edge_dst: subject,
            edge_status: EdgeStatus::Down as i32,
            configuration_id,
            ring_number: rings,
            node_id: None,
            metadata: None,
        });
    }

    // ---- leave -------------------------------------------------------

    fn handle_leave(&mut self, leave: LeaveMessage) {
        match &mut self.phase {
            Phase::Active { .. } => self.leaver_to_alert(leave.sender),
            Phase::ViewChanging {
                stashed_leavers, ..
            } => stashed_leavers.push(leave.sender),
            _ => {}
        }
    }

    /// Translate a departure announcement into DOWN alerts over the rings
    /// we observe the leaver on.
    fn leaver_to_alert(&mut self, leaver: Endpoint) {
        if !self.view.is_host_present(&leaver) {
            return;
        }

        let rings = match self.view.ring_numbers(&self.local, &leaver) {
            Ok(rings) => rings,
            Err(_) => return,
        };
        if rings.is_empty() {
            return;
        }

        info!("peer is leaving: {}", leaver);
        let configuration_id = self.view.configuration_id();
        self.enqueue_alert(AlertMessage {
            edge_src: self.local.clone(),
            edge_dst: leaver,
            edge_status: EdgeStatus::Down as i32,
            configuration_id,
            ring_number: rings,
            node_id: None,
            metadata: None,
        });
    }

    /// Announce our own departure to every observer, best-effort, and stop
    /// participating in membership changes.
    fn handle_local_leave(&mut self) -> Result<(), Error> {
        if !matches!(self.phase, Phase::Active { .. } | Phase::ViewChanging { .. }) {
            return Err(Error::InvalidState("leave"));
        }

        let mut observers = self.view.observers_of(&self.local).unwrap_or_default();
        observers.sort();
        observers.dedup();

        for observer in observers {
            let client = Arc::clone(&self.client);
            let deadline = self.settings.request_timeout;
            let leave: RapidRequest = LeaveMessage {
                sender: self.local.clone(),
            }
            .into();

            tokio::spawn(async move {
                match time::timeout(deadline, client.send(&observer, leave)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => debug!("leave notice to {} failed: {}", observer, e),
                    Err(_) => debug!("leave notice to {} timed out", observer),
                }
            });
        }

        self.cancel_monitors();
        self.phase = Phase::Leaving;
        Ok(())
    }

    // ---- consensus ---------------------------------------------------

    fn handle_consensus(&mut self, msg: Content) {
        if let Phase::Active { postponed } = &mut self.phase {
            // no proposal of our own yet; hold consensus traffic until the
            // cut detector catches up, so no vote is lost at the boundary.
            postponed.push_back(msg);
            return;
        }

        let effects = match &mut self.phase {
            Phase::ViewChanging { consensus, .. } => consensus.handle(&msg),
            _ => return,
        };

        self.run_effects(effects);
    }

    fn handle_fallback_elapsed(&mut self, configuration_id: u64) {
        if configuration_id != self.view.configuration_id() {
            return;
        }

        let effects = match &mut self.phase {
            Phase::ViewChanging { consensus, .. } => consensus.start_classic_round(),
            _ => return,
        };

        if !effects.is_empty() {
            info!(
                "fast round stalled, starting classic round: configuration_id={}",
                configuration_id
            );
        }
        self.run_effects(effects);
    }

    fn start_view_change(&mut self, proposal: BTreeSet<Endpoint>) {
        // identical input sets must yield byte-identical vote vectors on
        // every node.
        let mut proposal: Vec<Endpoint> = proposal.into_iter().collect();
        proposal.sort_by_key(|e| ring_hash(0, e));

        info!(
            "proposing view change: configuration_id={} proposal={:?}",
            self.view.configuration_id(),
            proposal.iter().map(|e| e.to_string()).collect::<Vec<_>>()
        );
        let _ = (self.events).send(ClusterEvent::ViewChangeProposal(proposal.clone()));

        let postponed = match &mut self.phase {
            Phase::Active { postponed } => mem::take(postponed),
            _ => return,
        };

        // monitors stop the moment the view starts changing; the next
        // Active state re-creates them against the new subjects.
        self.cancel_monitors();

        let mut consensus = FastPaxos::new(
            self.local.clone(),
            self.view.size(),
            self.view.configuration_id(),
        );
        let effects = consensus.propose(proposal, self.settings.consensus_fallback_base);

        self.phase = Phase::ViewChanging {
            consensus,
            fallback: None,
            stashed_leavers: vec![],
        };

        self.run_effects(effects);

        for msg in postponed {
            self.handle_consensus(msg);
        }
    }

    fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Broadcast(request) => {
                    self.broadcaster.broadcast(request);
                }

                Effect::Reply(to, request) => {
                    let client = Arc::clone(&self.client);
                    let deadline = self.settings.request_timeout;

                    tokio::spawn(async move {
                        match time::timeout(deadline, client.send(&to, request)).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => debug!("consensus reply to {} failed: {}", to, e),
                            Err(_) => debug!("consensus reply to {} timed out", to),
                        }
                    });
                }

                Effect::ScheduleFallback(delay) => {
                    let inbox = self.inbox.clone();
                    let configuration_id = self.view.configuration_id();

                    let handle = tokio::spawn(async move {
                        time::sleep(delay).await;
                        let _ = inbox
                            .send(Msg::FallbackElapsed { configuration_id })
                            .await;
                    });

                    if let Phase::ViewChanging { fallback, .. } = &mut self.phase {
                        if let Some(stale) = fallback.replace(handle) {
                            stale.abort();
                        }
                    }
                }

                Effect::CancelFallback => {
                    if let Phase::ViewChanging { fallback, .. } = &mut self.phase {
                        if let Some(f) = fallback.take() {
                            f.abort();
                        }
                    }
                }

                Effect::Decide(proposal) => self.apply_view_change(proposal),
            }
        }
    }

    // ---- view changes ------------------------------------------------

    fn apply_view_change(&mut self, proposal: Vec<Endpoint>) {
        let mut status_changes = Vec::with_capacity(proposal.len());

        for endpoint in &proposal {
            if self.view.is_host_present(endpoint) {
                if let Err(e) = self.view.ring_delete(endpoint) {
                    error!("aborting view change: {}", e);
                    return;
                }

                let metadata = self.metadata.remove(endpoint).unwrap_or_default();
                status_changes.push(NodeStatusChange {
                    endpoint: endpoint.clone(),
                    status: EdgeStatus::Down,
                    metadata,
                });
            } else {
                // an UP endpoint we never saw an identity for cannot be
                // admitted; that would fork the configuration hash.
                let Some(id) = self.joiner_ids.remove(endpoint) else {
                    error!("aborting view change: no identifier for joiner {}", endpoint);
                    return;
                };

                if let Err(e) = self.view.ring_add(endpoint.clone(), id) {
                    error!("aborting view change: {}", e);
                    return;
                }

                let metadata = self.joiner_metadata.remove(endpoint).unwrap_or_default();
                self.metadata.insert(endpoint.clone(), metadata.clone());
                status_changes.push(NodeStatusChange {
                    endpoint: endpoint.clone(),
                    status: EdgeStatus::Up,
                    metadata,
                });
            }
        }

        // bookkeeping for the old configuration is consumed here; stale
        // entries must not leak into the next round.
        self.joiner_ids.clear();
        self.joiner_metadata.clear();
        self.batch.queue.clear();
        self.batch.last_enqueue = None;

        let config = self.view.configuration().clone();
        info!(
            "applied view change: configuration_id={} members={}",
            config.configuration_id,
            config.endpoints.len()
        );

        // joiners included in the committed proposal receive the new
        // configuration; any left out will time out and retry.
        for endpoint in &proposal {
            if let Some(reply) = self.postponed_joiners.remove(endpoint) {
                let _ = reply.send(self.join_response(JoinStatusCode::SafeToJoin));
            }
        }

        let stashed_leavers =
            match mem::replace(&mut self.phase, Phase::Initial) {
                Phase::ViewChanging {
                    fallback,
                    stashed_leavers,
                    ..
                } => {
                    if let Some(f) = fallback {
                        f.abort();
                    }
                    stashed_leavers
                }
                other => {
                    self.phase = other;
                    vec![]
                }
            };

        self.cut_detector =
            MultiNodeCutDetector::new(self.settings.k, self.settings.h, self.settings.l)
                .expect("watermarks validated before spawn");

        let kicked = !self.view.is_host_present(&self.local);

        self.broadcaster.set_membership(config.endpoints.clone());
        self.phase = Phase::Active {
            postponed: VecDeque::new(),
        };
        self.arm_monitors();

        let _ = self.events.send(ClusterEvent::ViewChange(ViewChange {
            configuration_id: config.configuration_id,
            members: config.endpoints,
            status_changes,
        }));

        if kicked {
            warn!("local endpoint was removed from the configuration");
            let _ = self.events.send(ClusterEvent::Kicked);
        }

        for leaver in stashed_leavers {
            self.leaver_to_alert(leaver);
        }
    }
}
