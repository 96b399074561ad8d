// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Multi-node cut detection.
//!
//! Aggregates edge alerts from many observers into a single view-change
//! proposal once enough independent reports stabilize, per
//! [section 4.2](https://arxiv.org/pdf/1803.03620.pdf#subsection.4.2) of the
//! rapid paper.
use super::proto::{AlertMessage, EdgeStatus, Endpoint, Metadata};
use super::view::MembershipView;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// The fewest rings cut detection is sound over.
pub const K_MIN: usize = 3;

/// A precondition violation in the protocol parameters.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
#[error("invalid watermarks: k={}, h={}, l={}", .k, .h, .l)]
pub struct ValidityError {
    /// Rings per member.
    pub k: usize,
    /// High (stable) watermark.
    pub h: usize,
    /// Low (unstable) watermark.
    pub l: usize,
}

/// A membership change applied by an accepted proposal.
#[derive(Clone, Debug)]
pub struct NodeStatusChange {
    /// The endpoint that changed.
    pub endpoint: Endpoint,
    /// `Up` if it joined, `Down` if it left or was ejected.
    pub status: EdgeStatus,
    /// Its metadata, when known.
    pub metadata: Metadata,
}

/// An accepted view change.
#[derive(Clone, Debug)]
pub struct ViewChange {
    /// The new configuration's id.
    pub configuration_id: u64,
    /// All members of the new configuration, in ring-0 order.
    pub members: Vec<Endpoint>,
    /// What changed relative to the previous configuration.
    pub status_changes: Vec<NodeStatusChange>,
}

/// An event observed by a subscriber to cluster state.
#[derive(Clone, Debug)]
pub enum ClusterEvent {
    /// The cut detector produced a proposal; consensus is under way.
    ViewChangeProposal(Vec<Endpoint>),
    /// A proposal was agreed on and applied.
    ViewChange(ViewChange),
    /// The local endpoint went DOWN in a committed view.
    Kicked,
}

/// Aggregates per-ring edge reports into view-change proposals using low/high
/// watermarks.
///
/// A destination becomes part of a proposal once `h` distinct rings report
/// it; the proposal is withheld while any destination sits in the unstable
/// band between `l` and `h` reports.
pub struct MultiNodeCutDetector {
    k: usize,
    h: usize,
    l: usize,
    proposal_count: usize,
    updates_in_progress: usize,
    reports: HashMap<Endpoint, HashMap<i32, Endpoint>>,
    proposal: Vec<Endpoint>,
    pre_proposal: HashSet<Endpoint>,
    seen_down: bool,
}

impl MultiNodeCutDetector {
    /// Create a detector over `k` rings with high watermark `h` and low
    /// watermark `l`.
    pub fn new(k: usize, h: usize, l: usize) -> Result<Self, ValidityError> {
        if k < K_MIN || h > k || l > h || l == 0 {
            return Err(ValidityError { k, h, l });
        }

        Ok(Self {
            k,
            h,
            l,
            proposal_count: 0,
            updates_in_progress: 0,
            reports: HashMap::new(),
            proposal: Vec::new(),
            pre_proposal: HashSet::new(),
            seen_down: false,
        })
    }

    /// The number of proposals this detector has emitted.
    pub fn proposal_count(&self) -> usize {
        self.proposal_count
    }

    /// Merge one alert, one ring at a time. Returns a (possibly empty)
    /// proposal; a non-empty return means every reported destination has
    /// left the unstable band.
    pub fn aggregate(&mut self, alert: &AlertMessage) -> Vec<Endpoint> {
        if alert.status() == EdgeStatus::Down {
            self.seen_down = true;
        }

        let k = self.k as i32;

        (alert.ring_number.clone().into_iter())
            .filter(|ring| (0..k).contains(ring))
            .flat_map(|ring| self.aggregate_edge(&alert.edge_src, &alert.edge_dst, ring))
            .collect()
    }

    fn aggregate_edge(&mut self, src: &Endpoint, dst: &Endpoint, ring: i32) -> Vec<Endpoint> {
        let reports = self.reports.entry(dst.clone()).or_default();

        if reports.contains_key(&ring) {
            return vec![];
        }
        reports.insert(ring, src.clone());
        let count = reports.len();

        if count == self.l {
            self.updates_in_progress += 1;
            self.pre_proposal.insert(dst.clone());
        }

        if count == self.h {
            // dst has stabilized into the proposal; once nothing is left
            // straddling the watermarks, the whole proposal is emitted.
            self.pre_proposal.remove(dst);
            self.proposal.push(dst.clone());
            self.updates_in_progress -= 1;

            if self.updates_in_progress == 0 {
                self.proposal_count += 1;
                return std::mem::take(&mut self.proposal);
            }
        }

        vec![]
    }

    /// Force an edge view of any straddling nodes whose own observers are
    /// themselves in flux.
    ///
    /// An observer that is being ejected cannot be expected to report its
    /// subjects; synthesizing its reports pushes those subjects past the
    /// high watermark so the proposal can converge.
    pub fn invalidate_failing_edges(&mut self, view: &mut MembershipView) -> Vec<Endpoint> {
        if !self.seen_down {
            return vec![];
        }

        let mut proposals = vec![];
        let in_flux: Vec<Endpoint> = self.pre_proposal.iter().cloned().collect();

        for node in in_flux {
            let present = view.is_host_present(&node);
            let observers = if present {
                view.observers_of(&node).unwrap_or_default()
            } else {
                view.expected_observers_of(&node)
            };

            for (ring, observer) in observers.iter().enumerate() {
                if self.proposal.contains(observer) || self.pre_proposal.contains(observer) {
                    proposals.extend(self.aggregate_edge(observer, &node, ring as i32));
                }
            }
        }

        proposals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::proto::NodeId;
    use std::collections::BTreeSet;

    const K: usize = 10;
    const H: usize = 8;
    const L: usize = 2;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new(vec![127, 0, 0, 1], port as i32)
    }

    fn alert(src: &Endpoint, dst: &Endpoint, status: EdgeStatus, rings: Vec<i32>) -> AlertMessage {
        AlertMessage {
            edge_src: src.clone(),
            edge_dst: dst.clone(),
            edge_status: status as i32,
            configuration_id: 0,
            ring_number: rings,
            node_id: None,
            metadata: None,
        }
    }

    #[test]
    fn watermark_preconditions() {
        assert!(MultiNodeCutDetector::new(2, 2, 1).is_err());
        assert!(MultiNodeCutDetector::new(10, 11, 2).is_err());
        assert!(MultiNodeCutDetector::new(10, 4, 5).is_err());
        assert!(MultiNodeCutDetector::new(10, 8, 0).is_err());
        assert!(MultiNodeCutDetector::new(10, 8, 2).is_ok());
    }

    #[test]
    fn proposal_emitted_at_the_high_watermark() {
        let mut cd = MultiNodeCutDetector::new(K, H, L).unwrap();
        let dst = endpoint(1);

        for ring in 0..(H - 1) as i32 {
            let src = endpoint(100 + ring as u16);
            let out = cd.aggregate(&alert(&src, &dst, EdgeStatus::Down, vec![ring]));
            assert!(out.is_empty());
            assert_eq!(cd.proposal_count(), 0);
        }

        let src = endpoint(200);
        let out = cd.aggregate(&alert(&src, &dst, EdgeStatus::Down, vec![(H - 1) as i32]));
        assert_eq!(out, vec![dst]);
        assert_eq!(cd.proposal_count(), 1);
    }

    #[test]
    fn duplicate_ring_reports_are_ignored() {
        let mut cd = MultiNodeCutDetector::new(K, H, L).unwrap();
        let dst = endpoint(1);
        let src = endpoint(2);

        for _ in 0..H + 2 {
            let out = cd.aggregate(&alert(&src, &dst, EdgeStatus::Down, vec![0]));
            assert!(out.is_empty());
        }
        assert_eq!(cd.proposal_count(), 0);
    }

    #[test]
    fn proposal_withheld_while_another_destination_straddles() {
        let mut cd = MultiNodeCutDetector::new(K, H, L).unwrap();
        let a = endpoint(1);
        let b = endpoint(2);

        // b sits between l and h.
        for ring in 0..L as i32 {
            let src = endpoint(100 + ring as u16);
            assert!(cd
                .aggregate(&alert(&src, &b, EdgeStatus::Down, vec![ring]))
                .is_empty());
        }

        // a crosses h, but the proposal is withheld by b.
        for ring in 0..H as i32 {
            let src = endpoint(100 + ring as u16);
            assert!(cd
                .aggregate(&alert(&src, &a, EdgeStatus::Down, vec![ring]))
                .is_empty());
        }
        assert_eq!(cd.proposal_count(), 0);

        // once b crosses h too, both are emitted at once.
        let mut out = vec![];
        for ring in L as i32..H as i32 {
            let src = endpoint(100 + ring as u16);
            out.extend(cd.aggregate(&alert(&src, &b, EdgeStatus::Down, vec![ring])));
        }

        out.sort();
        assert_eq!(out, vec![a, b]);
        assert_eq!(cd.proposal_count(), 1);
    }

    #[test]
    fn aggregation_is_order_insensitive() {
        let a = endpoint(1);
        let b = endpoint(2);

        let mut alerts = vec![];
        for ring in 0..H as i32 {
            let src = endpoint(100 + ring as u16);
            alerts.push(alert(&src, &a, EdgeStatus::Down, vec![ring]));
            alerts.push(alert(&src, &b, EdgeStatus::Down, vec![ring]));
        }

        let mut outcomes = BTreeSet::new();
        for rotation in 0..alerts.len() {
            let mut cd = MultiNodeCutDetector::new(K, H, L).unwrap();

            let mut emitted: Vec<Endpoint> = (0..alerts.len())
                .map(|i| &alerts[(i + rotation) % alerts.len()])
                .flat_map(|m| cd.aggregate(m))
                .collect();

            emitted.sort();
            assert_eq!(cd.proposal_count(), 1);
            outcomes.insert(emitted);
        }

        // every interleaving produced the identical proposal.
        assert_eq!(outcomes.len(), 1);
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(outcomes.into_iter().next().unwrap(), expected);
    }

    #[test]
    fn invalidation_unsticks_straddling_nodes() {
        let mut view = MembershipView::new(K);
        for port in 1..=30u16 {
            view.ring_add(endpoint(port), NodeId::from(port as u128))
                .unwrap();
        }

        let mut cd = MultiNodeCutDetector::new(K, H, L).unwrap();
        let dst = endpoint(1);
        let observers = view.observers_of(&dst).unwrap();

        // observers on rings [0, h-3) report dst down: dst straddles.
        let reporting = H - 3;
        for ring in 0..reporting as i32 {
            let src = observers[ring as usize].clone();
            assert!(cd
                .aggregate(&alert(&src, &dst, EdgeStatus::Down, vec![ring]))
                .is_empty());
        }

        // the remaining observers of dst are themselves failing: they each
        // cross h, but the proposal is withheld by dst.
        let failed: BTreeSet<Endpoint> = observers[reporting..].iter().cloned().collect();
        for fo in &failed {
            let fo_observers = view.observers_of(fo).unwrap();
            for ring in 0..K as i32 {
                let src = fo_observers[ring as usize].clone();
                assert!(cd
                    .aggregate(&alert(&src, fo, EdgeStatus::Down, vec![ring]))
                    .is_empty());
            }
        }
        assert_eq!(cd.proposal_count(), 0);

        // invalidation synthesizes the missing reports for dst from its
        // failed observers, releasing the whole proposal.
        let mut out = cd.invalidate_failing_edges(&mut view);
        out.sort();

        assert_eq!(cd.proposal_count(), 1);
        assert_eq!(out.len(), 1 + failed.len());
        assert!(out.contains(&dst));
        assert!(failed.iter().all(|fo| out.contains(fo)));
    }
}
