// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Seeded ring hashing and the k-ring ordered set.
use fnv::FnvHasher;
use std::{
    collections::BTreeSet,
    hash::{Hash, Hasher},
    ops::Bound,
};

/// Hash `value` under `seed`, for placement on ring `seed`.
///
/// Deterministic across nodes and stable for the lifetime of the protocol;
/// every member must agree on ring order for identical inputs.
pub fn ring_hash<T: Hash>(seed: u64, value: &T) -> u64 {
    let mut h = FnvHasher::default();
    seed.hash(&mut h);
    value.hash(&mut h);
    h.finish()
}

/// Hash `value` with no seed. Used where commutative accumulation provides
/// the mixing (configuration ids).
pub fn hash64<T: Hash>(value: &T) -> u64 {
    let mut h = FnvHasher::default();
    value.hash(&mut h);
    h.finish()
}

/// An ordered set maintained as `k` rings of the same elements, where ring
/// `i` is ordered by [ring_hash] under seed `i`.
///
/// ```text
/// [ 0, 1, 2, 3, 4, 5 ] k: 4
///  |                |
///  v                v
/// [ 0, 4, 3, 1, 2, 5 ] ring: 0
/// [ 4, 0, 2, 1, 5, 3 ] ring: 1
/// [ 1, 0, 3, 4, 5, 2 ] ring: 2
/// [ 3, 2, 5, 0, 1, 4 ] ring: 3
/// ```
///
/// Ties on the hash are broken by the element's own ordering, so two nodes
/// holding the same element set always agree on every ring's order.
pub struct Rings<T> {
    rings: Vec<BTreeSet<(u64, T)>>,
}

impl<T: Ord + Hash + Clone> Rings<T> {
    /// Create an empty set with `k` rings.
    ///
    /// # Panics
    /// Panics if `k == 0`.
    pub fn new(k: usize) -> Self {
        assert!(k >= 1);

        let mut rings = Vec::with_capacity(k);
        rings.resize_with(k, BTreeSet::new);
        Self { rings }
    }

    /// Returns the number of rings.
    pub fn k(&self) -> usize {
        self.rings.len()
    }

    /// Returns the number of elements.
    pub fn len(&self) -> usize {
        self.rings[0].len()
    }

    /// Returns whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key(&self, ring: usize, val: &T) -> (u64, T) {
        (ring_hash(ring as u64, val), val.clone())
    }

    /// Returns whether `val` is in the set.
    pub fn contains(&self, val: &T) -> bool {
        // NOTE(invariant): if present in any ring, val is present in all.
        self.rings[0].contains(&self.key(0, val))
    }

    /// Insert `val` into every ring. Returns whether it was inserted.
    pub fn insert(&mut self, val: T) -> bool {
        if self.contains(&val) {
            return false;
        }

        for ring in 0..self.rings.len() {
            let key = self.key(ring, &val);
            self.rings[ring].insert(key);
        }

        true
    }

    /// Remove `val` from every ring. Returns whether it was removed.
    pub fn remove(&mut self, val: &T) -> bool {
        let mut removed = false;
        for ring in 0..self.rings.len() {
            let key = self.key(ring, val);
            removed = self.rings[ring].remove(&key);
        }
        removed
    }

    /// Returns an iterator over ring `ring` in hash order.
    pub fn ring(&self, ring: usize) -> impl DoubleEndedIterator<Item = &T> {
        self.rings[ring].iter().map(|(_, v)| v)
    }

    /// Returns an iterator over all elements in ring-0 order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.ring(0)
    }

    /// Returns the element that follows `val`'s position on ring `ring`,
    /// wrapping past the end. `val` need not be present.
    ///
    /// Returns `None` only when the set is empty. If `val` is the sole
    /// element, its successor is itself.
    pub fn successor(&self, ring: usize, val: &T) -> Option<&T> {
        let key = self.key(ring, val);

        (self.rings[ring])
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .or_else(|| self.rings[ring].iter().next())
            .map(|(_, v)| v)
    }

    /// Returns the element that precedes `val`'s position on ring `ring`,
    /// wrapping past the start. `val` need not be present.
    ///
    /// Returns `None` only when the set is empty.
    pub fn predecessor(&self, ring: usize, val: &T) -> Option<&T> {
        let key = self.key(ring, val);

        (self.rings[ring])
            .range(..key)
            .next_back()
            .or_else(|| self.rings[ring].iter().next_back())
            .map(|(_, v)| v)
    }
}

impl<T: Ord + Hash + Clone> Extend<T> for Rings<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for t in iter {
            self.insert(t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::HashSet;

    #[quickcheck]
    fn rings_contain_the_same_elements(input: HashSet<u32>) -> bool {
        let k = 4;
        let mut r = Rings::new(k);
        r.extend(input.iter().copied());

        (0..k).all(|i| {
            let ring: HashSet<_> = r.ring(i).copied().collect();
            ring == input
        })
    }

    #[quickcheck]
    fn ring_order_is_deterministic(input: Vec<u32>) -> bool {
        let k = 3;

        let mut a = Rings::new(k);
        a.extend(input.iter().copied());
        let mut b = Rings::new(k);
        b.extend(input.iter().rev().copied());

        (0..k).all(|i| a.ring(i).eq(b.ring(i)))
    }

    #[test]
    fn rings_are_uniquely_ordered() {
        let mut r = Rings::new(3);
        r.extend(0..16);

        let rings: Vec<Vec<_>> = (0..3).map(|i| r.ring(i).copied().collect()).collect();

        assert_ne!(rings[0], rings[1]);
        assert_ne!(rings[1], rings[2]);
        assert_ne!(rings[2], rings[0]);
    }

    #[test]
    fn successor_wraps_around() {
        let mut r = Rings::new(2);
        r.extend(0..8u32);

        for ring in 0..2 {
            let ordered: Vec<_> = r.ring(ring).copied().collect();

            for (i, v) in ordered.iter().enumerate() {
                let next = ordered[(i + 1) % ordered.len()];
                let prev = ordered[(i + ordered.len() - 1) % ordered.len()];

                assert_eq!(r.successor(ring, v), Some(&next));
                assert_eq!(r.predecessor(ring, v), Some(&prev));
            }
        }
    }

    #[test]
    fn neighbors_of_an_absent_element() {
        let mut r = Rings::new(1);
        r.extend([10u32, 20, 30]);

        let ordered: Vec<_> = r.ring(0).copied().collect();

        // an absent element's successor is the first present element that
        // sorts after its would-be position.
        for probe in [5u32, 15, 25, 35] {
            let succ = *r.successor(0, &probe).unwrap();
            assert!(ordered.contains(&succ));
            assert!(!r.contains(&probe));
        }

        assert!(Rings::<u32>::new(1).successor(0, &7).is_none());
    }

    #[test]
    fn remove_then_insert_restores_order() {
        let mut r = Rings::new(4);
        r.extend(0..12u32);
        let before: Vec<Vec<_>> = (0..4).map(|i| r.ring(i).copied().collect()).collect();

        assert!(r.remove(&7));
        assert!(!r.contains(&7));
        assert!(r.insert(7));

        let after: Vec<Vec<_>> = (0..4).map(|i| r.ring(i).copied().collect()).collect();
        assert_eq!(before, after);
    }
}
