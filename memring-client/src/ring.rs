//! # Consistent Hash Ring
//!
//! Purpose: Map keys to node indices so that adding or removing one node only
//! moves the keys that node owned.
//!
//! ## Design Principles
//!
//! 1. **Immutable**: A ring is built once and never mutated; membership
//!    changes build a new ring.
//! 2. **Parallel Arrays**: Sorted `points` and matching `owners` keep lookups
//!    to one binary search over a flat `Vec<u32>`.
//! 3. **First Owner Wins**: When two nodes hash to the same point, the node
//!    listed first keeps it.
//!
//! ## Point Derivation
//!
//! Each node contributes `mutations` address strings `"{endpoint}-{i}"`.
//! FNV-1a turns each into one point. Ketama hashes `mutations / 4` of them
//! with MD5 and splits each digest into four points.

use crate::config::HashAlgorithm;
use crate::hash::{fnv1a_32, ketama_hash, ketama_points};

#[derive(Debug, Clone)]
pub struct HashRing {
    algorithm: HashAlgorithm,
    points: Vec<u32>,
    owners: Vec<usize>,
}

impl HashRing {
    /// Builds a ring over `endpoints`. Owners are indices into that slice.
    pub fn build<S: AsRef<str>>(
        endpoints: &[S],
        algorithm: HashAlgorithm,
        mutations: usize,
    ) -> Self {
        let mut entries: Vec<(u32, usize)> = Vec::with_capacity(endpoints.len() * mutations);
        for (owner, endpoint) in endpoints.iter().enumerate() {
            let endpoint = endpoint.as_ref();
            match algorithm {
                HashAlgorithm::Fnv1a => {
                    for i in 0..mutations {
                        let address = format!("{}-{}", endpoint, i);
                        entries.push((fnv1a_32(address.as_bytes()), owner));
                    }
                }
                HashAlgorithm::Ketama => {
                    for i in 0..(mutations / 4).max(1) {
                        let address = format!("{}-{}", endpoint, i);
                        for point in ketama_points(address.as_bytes()) {
                            entries.push((point, owner));
                        }
                    }
                }
            }
        }

        // Stable sort keeps insertion order among equal points.
        entries.sort_by_key(|&(point, _)| point);
        entries.dedup_by_key(|&mut (point, _)| point);

        let (points, owners) = entries.into_iter().unzip();
        HashRing {
            algorithm,
            points,
            owners,
        }
    }

    /// Owner index for `key`, or `None` on an empty ring.
    pub fn lookup(&self, key: &[u8]) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let hash = self.hash_key(key);
        let index = match self.points.binary_search(&hash) {
            Ok(index) => index,
            Err(index) if index == self.points.len() => 0,
            Err(index) => index,
        };
        Some(self.owners[index])
    }

    pub fn hash_key(&self, key: &[u8]) -> u32 {
        match self.algorithm {
            HashAlgorithm::Fnv1a => fnv1a_32(key),
            HashAlgorithm::Ketama => ketama_hash(key),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[u32] {
        &self.points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn points_are_sorted_and_unique() {
        let ring = HashRing::build(&["a:1", "b:2", "c:3"], HashAlgorithm::Fnv1a, 160);
        assert!(ring.points().windows(2).all(|w| w[0] < w[1]));
        assert!(ring.len() <= 480 && ring.len() > 470);

        let ketama = HashRing::build(&["a:1", "b:2"], HashAlgorithm::Ketama, 160);
        assert!(ketama.points().windows(2).all(|w| w[0] < w[1]));
        assert!(ketama.len() <= 320);
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let ring = HashRing::build::<&str>(&[], HashAlgorithm::Fnv1a, 160);
        assert!(ring.is_empty());
        assert_eq!(ring.lookup(b"anything"), None);
    }

    #[test]
    fn lookup_wraps_past_the_last_point() {
        let ring = HashRing::build(&["a:1"], HashAlgorithm::Fnv1a, 1);
        let only = ring.points()[0];
        // Every key lands on the only point, above or below it.
        for key in [&b"x"[..], b"y", b"zz"] {
            assert_eq!(ring.lookup(key), Some(0));
        }
        assert_eq!(ring.points(), &[only]);
    }

    #[test]
    fn lookup_is_deterministic_across_builds() {
        let endpoints = ["10.0.0.1:11211", "10.0.0.2:11211"];
        let first = HashRing::build(&endpoints, HashAlgorithm::Fnv1a, 160);
        let second = HashRing::build(&endpoints, HashAlgorithm::Fnv1a, 160);
        for i in 0..200 {
            let key = format!("foo{}", i);
            assert_eq!(first.lookup(key.as_bytes()), second.lookup(key.as_bytes()));
        }
    }

    #[test]
    fn duplicate_point_keeps_first_owner() {
        // The same endpoint listed twice produces identical points; index 0 wins.
        let ring = HashRing::build(&["a:1", "a:1"], HashAlgorithm::Fnv1a, 40);
        assert_eq!(ring.len(), 40);
        for i in 0..100 {
            assert_eq!(ring.lookup(format!("k{}", i).as_bytes()), Some(0));
        }
    }

    fn endpoints(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("10.1.0.{}:11211", i + 1)).collect()
    }

    proptest! {
        #[test]
        fn every_node_gets_a_share(keys in prop::collection::vec("[a-z0-9]{4,16}", 2000)) {
            let nodes = endpoints(4);
            let ring = HashRing::build(&nodes, HashAlgorithm::Fnv1a, 160);
            let mut counts = [0usize; 4];
            for key in &keys {
                counts[ring.lookup(key.as_bytes()).unwrap()] += 1;
            }
            for count in counts {
                prop_assert!(count > keys.len() / 10, "unbalanced: {:?}", counts);
            }
        }

        #[test]
        fn removing_a_node_only_moves_its_keys(
            keys in prop::collection::vec(any::<Vec<u8>>(), 1..300),
            removed in 0usize..4,
            ketama in any::<bool>(),
        ) {
            let algorithm = if ketama { HashAlgorithm::Ketama } else { HashAlgorithm::Fnv1a };
            let nodes = endpoints(4);
            let full = HashRing::build(&nodes, algorithm, 160);

            let remaining: Vec<String> = nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != removed)
                .map(|(_, e)| e.clone())
                .collect();
            let reduced = HashRing::build(&remaining, algorithm, 160);

            for key in &keys {
                let before = full.lookup(key).unwrap();
                let after = &remaining[reduced.lookup(key).unwrap()];
                if before != removed {
                    prop_assert_eq!(&nodes[before], after);
                }
            }
        }
    }
}
