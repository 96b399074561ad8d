// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Consensus on view-change proposals.
//!
//! A proposal is first put to a single [fast round][fpx]: every member votes
//! its own cut-detector output, and a quorum of `N - ⌊(N-1)/4⌋` identical
//! votes decides without any coordinator. If the fast round stalls, members
//! fall back to classic paxos rounds (starting at round 2) after a
//! randomized delay.
//!
//! Handlers mutate local state and return [Effect]s for the caller to
//! execute; no I/O happens here, which keeps consensus testable against the
//! scenarios that matter.
//!
//! [fpx]: https://www.microsoft.com/en-us/research/wp-content/uploads/2016/02/tr-2005-112.pdf
use super::proto::{
    rapid_request::Content, Endpoint, FastRoundPhase2bMessage, Phase1aMessage, Phase1bMessage,
    Phase2aMessage, Phase2bMessage, Rank, RapidRequest,
};
use crate::rings::ring_hash;
use log::debug;
use rand::{thread_rng, Rng};
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

/// An action for the state machine to carry out on behalf of consensus.
pub(crate) enum Effect {
    /// Send to every member of the current configuration.
    Broadcast(RapidRequest),
    /// Send to one member.
    Reply(Endpoint, RapidRequest),
    /// Start the classic-round fallback timer.
    ScheduleFallback(Duration),
    /// Stop the classic-round fallback timer.
    CancelFallback,
    /// Consensus was reached on this proposal.
    Decide(Vec<Endpoint>),
}

/// The randomized delay before a member tries to coordinate a classic
/// round: `base + Exp(rate)` with `rate = 1/N`, so that round starts are
/// spread out rather than stampeding.
fn fallback_delay(size: usize, base: Duration) -> Duration {
    let rate = 1.0 / size.max(1) as f64;
    let uniform: f64 = thread_rng().gen();
    let jitter = (-1000.0 * (1.0 - uniform).ln() / rate) as u64;

    base + Duration::from_millis(jitter)
}

/// Classic paxos over one configuration's proposal, with the coordinator
/// rule from Fast Paxos (figure 2) for recovering fast-round votes.
pub(crate) struct Paxos {
    local: Endpoint,
    size: usize,
    configuration_id: u64,
    /// Highest rank promised.
    rnd: Rank,
    /// Rank voted in, and the vote.
    vrnd: Rank,
    vval: Vec<Endpoint>,
    /// Highest rank coordinated, and the chosen value.
    crnd: Rank,
    cval: Vec<Endpoint>,
    phase1b: Vec<Phase1bMessage>,
    phase2b: HashMap<Rank, (HashSet<Endpoint>, Vec<Endpoint>)>,
    decided: bool,
}

impl Paxos {
    pub(crate) fn new(local: Endpoint, size: usize, configuration_id: u64) -> Self {
        Self {
            local,
            size,
            configuration_id,
            rnd: Rank::zero(),
            vrnd: Rank::zero(),
            vval: vec![],
            crnd: Rank::zero(),
            cval: vec![],
            phase1b: vec![],
            phase2b: HashMap::new(),
            decided: false,
        }
    }

    /// Record the local fast-round vote so a later classic round recovers
    /// it. No-op once a classic round has been promised.
    pub(crate) fn register_fast_round_vote(&mut self, proposal: Vec<Endpoint>) {
        if self.rnd.round >= 2 {
            return;
        }

        self.rnd = Rank::fast_round();
        self.vrnd = Rank::fast_round();
        self.vval = proposal;
    }

    /// Try to coordinate `round`. Ranks are made unique across members by
    /// hashing the local endpoint into the node index.
    pub(crate) fn start_phase1a(&mut self, round: u32) -> Vec<Effect> {
        if round <= self.crnd.round {
            return vec![];
        }

        self.crnd = Rank::new(round, ring_hash(0, &self.local));

        vec![Effect::Broadcast(
            Phase1aMessage {
                sender: self.local.clone(),
                configuration_id: self.configuration_id,
                rank: self.crnd.clone(),
            }
            .into(),
        )]
    }

    pub(crate) fn handle_phase1a(&mut self, msg: &Phase1aMessage) -> Vec<Effect> {
        if msg.configuration_id != self.configuration_id {
            return vec![];
        }

        if msg.rank <= self.rnd {
            debug!("phase1a: rank {:?} <= promised {:?}", msg.rank, self.rnd);
            return vec![];
        }

        self.rnd = msg.rank.clone();

        vec![Effect::Reply(
            msg.sender.clone(),
            Phase1bMessage {
                sender: self.local.clone(),
                configuration_id: self.configuration_id,
                rnd: self.rnd.clone(),
                vrnd: self.vrnd.clone(),
                vval: self.vval.clone(),
            }
            .into(),
        )]
    }

    pub(crate) fn handle_phase1b(&mut self, msg: &Phase1bMessage) -> Vec<Effect> {
        if msg.configuration_id != self.configuration_id {
            return vec![];
        }

        // only promises for our own coordination round matter.
        if msg.rnd != self.crnd {
            return vec![];
        }

        self.phase1b.push(msg.clone());

        if self.phase1b.len() <= self.size / 2 || !self.cval.is_empty() {
            return vec![];
        }

        let Some(chosen) = self.select_proposal() else {
            // a quorum of empty votes; wait for a phase1b that carries one.
            return vec![];
        };

        self.cval = chosen.clone();

        vec![Effect::Broadcast(
            Phase2aMessage {
                sender: self.local.clone(),
                configuration_id: self.configuration_id,
                rnd: self.crnd.clone(),
                vval: chosen,
            }
            .into(),
        )]
    }

    pub(crate) fn handle_phase2a(&mut self, msg: &Phase2aMessage) -> Vec<Effect> {
        if msg.configuration_id != self.configuration_id {
            return vec![];
        }

        if msg.rnd < self.rnd || msg.rnd == self.vrnd {
            return vec![];
        }

        self.rnd = msg.rnd.clone();
        self.vrnd = msg.rnd.clone();
        self.vval = msg.vval.clone();

        vec![Effect::Broadcast(
            Phase2bMessage {
                sender: self.local.clone(),
                configuration_id: self.configuration_id,
                rnd: msg.rnd.clone(),
                endpoints: msg.vval.clone(),
            }
            .into(),
        )]
    }

    pub(crate) fn handle_phase2b(&mut self, msg: &Phase2bMessage) -> Vec<Effect> {
        if msg.configuration_id != self.configuration_id {
            return vec![];
        }

        let (voters, value) = (self.phase2b)
            .entry(msg.rnd.clone())
            .or_insert_with(|| (HashSet::new(), msg.endpoints.clone()));

        voters.insert(msg.sender.clone());

        if voters.len() > self.size / 2 && !self.decided {
            self.decided = true;
            return vec![Effect::Decide(value.clone())];
        }

        vec![]
    }

    /// The coordinator rule (Fast Paxos, figure 2).
    ///
    /// With `E = N/4` and `F = N/2`, any value that a fast quorum might
    /// have chosen appears more than `N/4` times among the highest-ranked
    /// votes of a classic quorum.
    fn select_proposal(&self) -> Option<Vec<Endpoint>> {
        let max_vrnd = self.phase1b.iter().map(|p| &p.vrnd).max()?;

        // V: the distinct non-empty values voted at the highest rank.
        let mut occurrences: HashMap<&[Endpoint], usize> = HashMap::new();
        for p in &self.phase1b {
            if &p.vrnd == max_vrnd && !p.vval.is_empty() {
                *occurrences.entry(p.vval.as_slice()).or_insert(0) += 1;
            }
        }

        if occurrences.len() == 1 {
            return occurrences.into_keys().next().map(<[_]>::to_vec);
        }

        if occurrences.len() > 1 {
            if let Some(popular) = occurrences
                .iter()
                .find(|(_, &count)| count > self.size / 4)
                .map(|(&vval, _)| vval.to_vec())
            {
                return Some(popular);
            }
        }

        // No value is constrained; any non-empty vote is safe to propose,
        // and phase 2 simply waits if none has arrived yet.
        (self.phase1b.iter())
            .find(|p| !p.vval.is_empty())
            .map(|p| p.vval.clone())
    }
}

/// The fast round, wrapping the classic instance it falls back to.
pub(crate) struct FastPaxos {
    size: usize,
    configuration_id: u64,
    paxos: Paxos,
    voted: HashSet<Endpoint>,
    votes_per_proposal: HashMap<Vec<Endpoint>, usize>,
    decided: bool,
}

impl FastPaxos {
    pub(crate) fn new(local: Endpoint, size: usize, configuration_id: u64) -> Self {
        Self {
            size,
            configuration_id,
            paxos: Paxos::new(local, size, configuration_id),
            voted: HashSet::new(),
            votes_per_proposal: HashMap::new(),
            decided: false,
        }
    }

    /// The fast-round quorum: `N - ⌊(N-1)/4⌋`.
    fn quorum(&self) -> usize {
        self.size - (self.size.saturating_sub(1)) / 4
    }

    /// Vote for `proposal` and schedule the classic fallback.
    ///
    /// The local vote is registered with the classic instance and counted
    /// like any other when our own broadcast loops back.
    pub(crate) fn propose(&mut self, proposal: Vec<Endpoint>, base: Duration) -> Vec<Effect> {
        self.paxos.register_fast_round_vote(proposal.clone());

        let vote = FastRoundPhase2bMessage {
            sender: self.paxos.local.clone(),
            configuration_id: self.configuration_id,
            endpoints: proposal,
        };

        vec![
            Effect::Broadcast(vote.into()),
            Effect::ScheduleFallback(fallback_delay(self.size, base)),
        ]
    }

    pub(crate) fn handle_fast_round(&mut self, msg: &FastRoundPhase2bMessage) -> Vec<Effect> {
        if msg.configuration_id != self.configuration_id {
            return vec![];
        }
        if self.decided {
            return vec![];
        }
        if !self.voted.insert(msg.sender.clone()) {
            return vec![];
        }

        let count = {
            let entry = (self.votes_per_proposal)
                .entry(msg.endpoints.clone())
                .or_insert(0);
            *entry += 1;
            *entry
        };

        if self.voted.len() >= self.quorum() && count >= self.quorum() {
            self.decided = true;
            return vec![Effect::CancelFallback, Effect::Decide(msg.endpoints.clone())];
        }

        vec![]
    }

    /// The fallback timer elapsed: try to coordinate classic round 2.
    pub(crate) fn start_classic_round(&mut self) -> Vec<Effect> {
        if self.decided {
            return vec![];
        }

        self.paxos.start_phase1a(2)
    }

    /// Route any consensus message to its handler.
    pub(crate) fn handle(&mut self, msg: &Content) -> Vec<Effect> {
        match msg {
            Content::FastRoundPhase2b(m) => self.handle_fast_round(m),
            Content::Phase1a(m) => self.paxos.handle_phase1a(m),
            Content::Phase1b(m) => self.paxos.handle_phase1b(m),
            Content::Phase2a(m) => self.paxos.handle_phase2a(m),
            Content::Phase2b(m) => {
                let effects = self.paxos.handle_phase2b(m);
                // a classic decision settles the whole instance.
                if effects.iter().any(|e| matches!(e, Effect::Decide(_))) {
                    self.decided = true;
                }
                effects
            }
            _ => vec![],
        }
    }
}
