/// Disjoint sets over dense `u32` ids.
///
/// The representative of each set is its smallest member: merging two sets makes the later root a
/// shadow of the earlier one. Lookups compress paths, so after `resolve(x)` the parent of `x` is
/// the representative itself.
#[derive(Clone, Debug, Default)]
pub struct UnionFind {
    // `None` for representatives.
    parents: Vec<Option<u32>>,
}

impl UnionFind {
    pub fn new(len: u32) -> Self {
        Self {
            parents: vec![None; len as usize],
        }
    }

    /// Adds a new singleton set and returns its id.
    pub fn push(&mut self) -> u32 {
        let id = self.parents.len() as u32;
        self.parents.push(None);
        id
    }

    /// Merges the sets of `a` and `b` and returns the representative of the union.
    pub fn merge(&mut self, a: u32, b: u32) -> u32 {
        let a = self.resolve(a);
        let b = self.resolve(b);
        let (root, shadow) = if a <= b { (a, b) } else { (b, a) };
        if root != shadow {
            self.parents[shadow as usize] = Some(root);
        }
        root
    }

    pub fn resolve(&mut self, mut index: u32) -> u32 {
        let mut leader = index;
        while let Some(parent) = self.parents[leader as usize] {
            leader = parent;
        }
        while index != leader {
            let parent = self.parents[index as usize].replace(leader);
            index = parent.expect("non-leader without a parent");
        }
        leader
    }

    /// Like `resolve`, but without path compression.
    pub fn find(&self, mut index: u32) -> u32 {
        while let Some(parent) = self.parents[index as usize] {
            index = parent;
        }
        index
    }

    pub fn is_representative(&self, index: u32) -> bool {
        self.parents[index as usize].is_none()
    }

    #[cfg(test)]
    fn depth(&self, mut index: u32) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.parents[index as usize] {
            index = parent;
            depth += 1;
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;
    use rand::{RngCore, SeedableRng, rngs::SmallRng};

    #[test]
    fn earliest_is_representative() {
        let mut sets = UnionFind::new(6);
        assert_eq!(sets.merge(4, 2), 2);
        assert_eq!(sets.merge(5, 4), 2);
        assert_eq!(sets.merge(3, 1), 1);
        assert_eq!(sets.merge(5, 3), 1);
        for i in 1..6 {
            assert_eq!(sets.resolve(i), 1);
        }
        assert_eq!(sets.resolve(0), 0);
        assert!(sets.is_representative(0));
        assert!(!sets.is_representative(5));
        assert_eq!(sets.push(), 6);
        assert!(sets.is_representative(6));
    }

    #[test]
    fn random_merges_converge() {
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let len = 1 + rng.next_u32() % 200;
            let mut sets = UnionFind::new(len);
            // Reference partition, kept as an explicit label per element.
            let mut labels: Vec<u32> = (0..len).collect();
            for _ in 0..rng.next_u32() % (2 * len) {
                let a = rng.next_u32() % len;
                let b = rng.next_u32() % len;
                sets.merge(a, b);
                let (from, to) = (labels[b as usize], labels[a as usize]);
                for label in &mut labels {
                    if *label == from {
                        *label = to;
                    }
                }
            }

            for a in 0..len {
                for b in 0..len {
                    assert_eq!(
                        sets.find(a) == sets.find(b),
                        labels[a as usize] == labels[b as usize]
                    );
                }
                // The representative is the smallest member.
                let smallest = (0..len)
                    .find(|&b| labels[b as usize] == labels[a as usize])
                    .unwrap();
                assert_eq!(sets.resolve(a), smallest);
            }
        }
    }

    proptest! {
        #[test]
        fn compressed_paths_are_short(
            len in 1u32..64,
            merges in vec((0u32..64, 0u32..64), 0..128),
        ) {
            let mut sets = UnionFind::new(len);
            for (a, b) in merges {
                sets.merge(a % len, b % len);
            }
            for i in 0..len {
                let root = sets.resolve(i);
                prop_assert_eq!(sets.find(i), root);
                prop_assert!(sets.depth(i) <= 1);
            }
        }
    }
}
