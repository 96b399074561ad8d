// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! The k-ring membership view.
//!
//! Each member holds every other member on `k` rings (see [Rings]); edges
//! between ring neighbors form the observer/subject monitoring relation. On
//! ring `i`, the observer of an endpoint is its ring-successor and its
//! subject is its ring-predecessor.
use super::proto::{Endpoint, JoinStatusCode, NodeId};
use crate::rings::{hash64, Rings};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// An invariant violation in the membership view.
///
/// These never cross the wire: they indicate an out-of-order alert or a
/// corrupted proposal, and are suppressed (or fatal, at apply time) by the
/// caller.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ViewError {
    /// The endpoint is not a member.
    #[error("node not in ring: {}", .0)]
    NodeNotInRing(Endpoint),

    /// The endpoint is already a member.
    #[error("node already in ring: {}", .0)]
    NodeAlreadyInRing(Endpoint),

    /// The identifier was already used by some member.
    #[error("uuid already seen: {:?}", .0)]
    UuidAlreadySeen(NodeId),
}

/// A named snapshot of the membership.
///
/// `endpoints` is ring-0 order and `node_ids` is parallel to it, so any
/// receiver can reconstruct the endpoint→id mapping and reproduce
/// `configuration_id` bit-for-bit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Configuration {
    /// Stable hash over the id set and ring-0 order.
    pub configuration_id: u64,
    /// All members, in ring-0 order.
    pub endpoints: Vec<Endpoint>,
    /// Each member's id, parallel to `endpoints`.
    pub node_ids: Vec<NodeId>,
}

/// The local node's view of the membership: `k` rings of endpoints, the id
/// each member joined under, and a memoized [Configuration].
pub struct MembershipView {
    k: usize,
    rings: Rings<Endpoint>,
    ids: HashMap<Endpoint, NodeId>,
    seen: HashSet<NodeId>,
    observer_cache: HashMap<Endpoint, Vec<Endpoint>>,
    current: Option<Configuration>,
}

impl MembershipView {
    /// Create an empty view with `k` rings.
    ///
    /// # Panics
    /// Panics if `k == 0`.
    pub fn new(k: usize) -> Self {
        Self {
            k,
            rings: Rings::new(k),
            ids: HashMap::new(),
            seen: HashSet::new(),
            observer_cache: HashMap::new(),
            current: None,
        }
    }

    /// Create a view holding `members`, e.g. from a join response.
    pub fn with_members<I>(k: usize, members: I) -> Result<Self, ViewError>
    where
        I: IntoIterator<Item = (Endpoint, NodeId)>,
    {
        let mut view = Self::new(k);
        for (endpoint, id) in members {
            view.ring_add(endpoint, id)?;
        }
        Ok(view)
    }

    /// The number of rings.
    pub fn k(&self) -> usize {
        self.k
    }

    /// The number of members.
    pub fn size(&self) -> usize {
        self.rings.len()
    }

    /// Whether `endpoint` is a member.
    pub fn is_host_present(&self, endpoint: &Endpoint) -> bool {
        self.ids.contains_key(endpoint)
    }

    /// Whether `id` has been used by any member.
    pub fn is_identifier_present(&self, id: &NodeId) -> bool {
        self.seen.contains(id)
    }

    /// Classify a join attempt without mutating anything.
    pub fn is_safe_to_join(&self, endpoint: &Endpoint, id: &NodeId) -> JoinStatusCode {
        match (self.ids.get(endpoint), self.seen.contains(id)) {
            (Some(current), _) if current == id => JoinStatusCode::SameNodeAlreadyInRing,
            (Some(_), _) => JoinStatusCode::HostnameAlreadyInRing,
            (None, true) => JoinStatusCode::UuidAlreadyInRing,
            (None, false) => JoinStatusCode::SafeToJoin,
        }
    }

    /// Add a member to all `k` rings.
    pub fn ring_add(&mut self, endpoint: Endpoint, id: NodeId) -> Result<(), ViewError> {
        if self.seen.contains(&id) {
            return Err(ViewError::UuidAlreadySeen(id));
        }
        if self.is_host_present(&endpoint) {
            return Err(ViewError::NodeAlreadyInRing(endpoint));
        }

        self.rings.insert(endpoint.clone());
        self.ids.insert(endpoint, id.clone());
        self.seen.insert(id);
        self.invalidate();

        Ok(())
    }

    /// Remove a member from all `k` rings, retiring its id.
    pub fn ring_delete(&mut self, endpoint: &Endpoint) -> Result<(), ViewError> {
        let id = (self.ids)
            .remove(endpoint)
            .ok_or_else(|| ViewError::NodeNotInRing(endpoint.clone()))?;

        self.rings.remove(endpoint);
        self.seen.remove(&id);
        self.invalidate();

        Ok(())
    }

    fn invalidate(&mut self) {
        self.observer_cache.clear();
        self.current = None;
    }

    /// The `k` observers of a member: its ring-successor on each ring. May
    /// contain duplicates when the view is small. Empty if the view holds
    /// at most one member.
    pub fn observers_of(&mut self, endpoint: &Endpoint) -> Result<Vec<Endpoint>, ViewError> {
        if !self.is_host_present(endpoint) {
            return Err(ViewError::NodeNotInRing(endpoint.clone()));
        }
        if self.size() <= 1 {
            return Ok(vec![]);
        }

        if let Some(cached) = self.observer_cache.get(endpoint) {
            return Ok(cached.clone());
        }

        let observers: Vec<Endpoint> = (0..self.k)
            .map(|ring| self.rings.successor(ring, endpoint).cloned())
            .map(|o| o.expect("non-empty rings have successors"))
            .collect();

        self.observer_cache
            .insert(endpoint.clone(), observers.clone());

        Ok(observers)
    }

    /// The `k` observers a joiner would have, one per ring, computed from
    /// its would-be ring positions. Empty if the view is empty.
    pub fn expected_observers_of(&self, endpoint: &Endpoint) -> Vec<Endpoint> {
        if self.rings.is_empty() {
            return vec![];
        }

        (0..self.k)
            .map(|ring| self.rings.successor(ring, endpoint).cloned())
            .map(|o| o.expect("non-empty rings have successors"))
            .collect()
    }

    /// The `k` subjects of a member: its ring-predecessor on each ring.
    /// Empty if the view holds at most one member.
    pub fn subjects_of(&self, endpoint: &Endpoint) -> Result<Vec<Endpoint>, ViewError> {
        if !self.is_host_present(endpoint) {
            return Err(ViewError::NodeNotInRing(endpoint.clone()));
        }
        if self.size() <= 1 {
            return Ok(vec![]);
        }

        Ok((0..self.k)
            .map(|ring| self.rings.predecessor(ring, endpoint).cloned())
            .map(|s| s.expect("non-empty rings have predecessors"))
            .collect())
    }

    /// The sorted list of rings on which `observer` observes `subject`.
    pub fn ring_numbers(
        &mut self,
        observer: &Endpoint,
        subject: &Endpoint,
    ) -> Result<Vec<i32>, ViewError> {
        let observers = self.observers_of(subject)?;

        Ok(observers
            .iter()
            .enumerate()
            .filter(|(_, o)| *o == observer)
            .map(|(ring, _)| ring as i32)
            .collect())
    }

    /// The current configuration. Memoized until the next ring mutation.
    pub fn configuration(&mut self) -> &Configuration {
        if self.current.is_none() {
            let endpoints: Vec<Endpoint> = self.rings.iter().cloned().collect();
            let node_ids = (endpoints.iter())
                .map(|e| self.ids[e].clone())
                .collect::<Vec<_>>();

            // Ids are summed commutatively (their iteration order differs
            // between nodes); ring-0 endpoints are folded in ring order.
            let mut h: u64 = 1;
            for id in &self.seen {
                h = h.wrapping_add(hash64(&id.high));
                h = h.wrapping_add(hash64(&id.low));
            }
            for e in &endpoints {
                h = h.wrapping_add(hash64(&e.hostname));
                h = h.wrapping_add(hash64(&e.port));
            }

            self.current = Some(Configuration {
                configuration_id: h,
                endpoints,
                node_ids,
            });
        }

        self.current.as_ref().expect("just computed")
    }

    /// The current configuration id.
    pub fn configuration_id(&mut self) -> u64 {
        self.configuration().configuration_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    const K: usize = 10;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new(vec![127, 0, 0, 1], port as i32)
    }

    fn id(x: u128) -> NodeId {
        NodeId::from(x)
    }

    fn view_of(ports: &[u16]) -> MembershipView {
        let members = (ports.iter()).map(|&p| (endpoint(p), id(p as u128 + 1)));
        MembershipView::with_members(K, members).unwrap()
    }

    fn dedup(ports: Vec<u16>) -> Vec<u16> {
        let mut ports = ports;
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    #[quickcheck]
    fn observer_subject_duality(ports: Vec<u16>) -> bool {
        let ports = dedup(ports);
        if ports.len() < 2 {
            return true;
        }

        let mut view = view_of(&ports);

        for &a in &ports {
            for &b in &ports {
                if a == b {
                    continue;
                }

                let a = endpoint(a);
                let b = endpoint(b);

                let fwd = view.observers_of(&b).unwrap().contains(&a);
                let rev = view.subjects_of(&a).unwrap().contains(&b);

                if fwd != rev {
                    return false;
                }
            }
        }

        true
    }

    #[quickcheck]
    fn configuration_is_insertion_order_independent(ports: Vec<u16>) -> bool {
        let ports = dedup(ports);

        let fwd = (ports.iter()).map(|&p| (endpoint(p), id(p as u128 + 1)));
        let rev = (ports.iter().rev()).map(|&p| (endpoint(p), id(p as u128 + 1)));

        let mut a = MembershipView::with_members(K, fwd).unwrap();
        let mut b = MembershipView::with_members(K, rev).unwrap();

        a.configuration() == b.configuration()
    }

    #[test]
    fn add_then_delete_restores_configuration_id() {
        let mut view = view_of(&[1, 2, 3, 4, 5]);
        let before = view.configuration_id();

        view.ring_add(endpoint(9), id(999)).unwrap();
        assert_ne!(before, view.configuration_id());

        view.ring_delete(&endpoint(9)).unwrap();
        assert_eq!(before, view.configuration_id());
    }

    #[test]
    fn observers_have_length_k() {
        let mut view = view_of(&[1, 2, 3, 4, 5, 6]);

        for p in [1u16, 2, 3, 4, 5, 6] {
            assert_eq!(view.observers_of(&endpoint(p)).unwrap().len(), K);
        }
    }

    #[test]
    fn two_member_view_duplicates_the_peer() {
        let mut view = view_of(&[1, 2]);

        let obs = view.observers_of(&endpoint(1)).unwrap();
        assert_eq!(obs.len(), K);
        assert!(obs.iter().all(|o| *o == endpoint(2)));

        let rings = view.ring_numbers(&endpoint(2), &endpoint(1)).unwrap();
        assert_eq!(rings, (0..K as i32).collect::<Vec<_>>());
    }

    #[test]
    fn tiny_views_have_no_observers() {
        let mut view = view_of(&[1]);
        assert!(view.observers_of(&endpoint(1)).unwrap().is_empty());
        assert!(view.subjects_of(&endpoint(1)).unwrap().is_empty());

        // but a joiner against a single seed is observed by it on all rings.
        let expected = view.expected_observers_of(&endpoint(2));
        assert_eq!(expected.len(), K);
        assert!(expected.iter().all(|o| *o == endpoint(1)));

        assert!(MembershipView::new(K)
            .expected_observers_of(&endpoint(2))
            .is_empty());
    }

    #[test]
    fn join_safety_codes() {
        let view = view_of(&[1, 2]);

        assert_eq!(
            view.is_safe_to_join(&endpoint(3), &id(1000)),
            JoinStatusCode::SafeToJoin
        );
        assert_eq!(
            view.is_safe_to_join(&endpoint(1), &id(2)),
            JoinStatusCode::SameNodeAlreadyInRing
        );
        assert_eq!(
            view.is_safe_to_join(&endpoint(1), &id(1000)),
            JoinStatusCode::HostnameAlreadyInRing
        );
        assert_eq!(
            view.is_safe_to_join(&endpoint(3), &id(2)),
            JoinStatusCode::UuidAlreadyInRing
        );
    }

    #[test]
    fn duplicate_ids_and_hosts_are_rejected() {
        let mut view = view_of(&[1, 2]);

        assert_eq!(
            view.ring_add(endpoint(3), id(2)),
            Err(ViewError::UuidAlreadySeen(id(2)))
        );
        assert_eq!(
            view.ring_add(endpoint(1), id(1000)),
            Err(ViewError::NodeAlreadyInRing(endpoint(1)))
        );
        assert_eq!(
            view.ring_delete(&endpoint(9)),
            Err(ViewError::NodeNotInRing(endpoint(9)))
        );
    }

    #[test]
    fn deleted_ids_may_rejoin_fresh() {
        let mut view = view_of(&[1, 2, 3]);

        view.ring_delete(&endpoint(2)).unwrap();
        assert!(!view.is_identifier_present(&id(3)));

        // the endpoint comes back under a fresh id.
        view.ring_add(endpoint(2), id(777)).unwrap();
        assert!(view.is_host_present(&endpoint(2)));
    }
}
