//! Pattern algebra
//!
//! A chord's channel set is described by a small immutable tree: an `Atom`
//! is one channel, a `Vector` is a whole channel array, and `And` joins two
//! subtrees. The tree is built once by the chord builder and compiled once
//! at registration: `mask` computes the covered id set (rejecting repeated
//! channels), and `channels` flattens the tree left-to-right so payload
//! extraction matches declaration order.

use chorale_sets::IdSet;

use crate::channel::ChannelId;
use crate::error::JoinError;

/// An immutable chord pattern.
#[derive(Debug, Clone)]
pub(crate) enum Pattern {
    /// A single channel.
    Atom(ChannelId),
    /// A channel array; the empty array covers the empty set and is legal
    /// only when a sibling contributes a non-empty one.
    Vector(Vec<ChannelId>),
    /// Conjunction of two subtrees, left before right.
    And(Box<Pattern>, Box<Pattern>),
}

impl Pattern {
    /// Extend this pattern on the right, preserving declaration order.
    pub(crate) fn and(self, other: Pattern) -> Pattern {
        Pattern::And(Box::new(self), Box::new(other))
    }

    /// The covered channel set.
    ///
    /// Fails `RepeatedChannel` if any channel id occurs twice anywhere in
    /// the tree. An empty mask is legal here; registration rejects it as
    /// `EmptyPattern`.
    pub(crate) fn mask<S: IdSet>(&self) -> Result<S, JoinError> {
        let mut acc = S::empty();
        self.collect(&mut acc)?;
        Ok(acc)
    }

    fn collect<S: IdSet>(&self, acc: &mut S) -> Result<(), JoinError> {
        match self {
            Pattern::Atom(id) => {
                if !acc.insert(id.0) {
                    return Err(JoinError::RepeatedChannel(id.0));
                }
                Ok(())
            }
            Pattern::Vector(ids) => {
                for id in ids {
                    if !acc.insert(id.0) {
                        return Err(JoinError::RepeatedChannel(id.0));
                    }
                }
                Ok(())
            }
            Pattern::And(left, right) => {
                left.collect(acc)?;
                right.collect(acc)
            }
        }
    }

    /// Flatten to the joined channels in declaration order.
    pub(crate) fn channels(&self) -> Vec<ChannelId> {
        let mut out = Vec::new();
        self.flatten(&mut out);
        out
    }

    fn flatten(&self, out: &mut Vec<ChannelId>) {
        match self {
            Pattern::Atom(id) => out.push(*id),
            Pattern::Vector(ids) => out.extend_from_slice(ids),
            Pattern::And(left, right) => {
                left.flatten(out);
                right.flatten(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorale_sets::Set64;
    use proptest::prelude::*;

    fn atom(id: u32) -> Pattern {
        Pattern::Atom(ChannelId(id))
    }

    fn vector(ids: &[u32]) -> Pattern {
        Pattern::Vector(ids.iter().map(|&i| ChannelId(i)).collect())
    }

    #[test]
    fn atom_mask_is_singleton() {
        let mask: Set64 = atom(5).mask().unwrap();
        assert_eq!(mask.ids(), vec![5]);
    }

    #[test]
    fn and_unions_left_to_right() {
        let p = atom(2).and(vector(&[7, 4])).and(atom(0));
        let mask: Set64 = p.mask().unwrap();
        assert_eq!(mask.ids(), vec![0, 2, 4, 7]);
        assert_eq!(
            p.channels(),
            vec![ChannelId(2), ChannelId(7), ChannelId(4), ChannelId(0)]
        );
    }

    #[test]
    fn repeated_atom_fails() {
        let p = atom(3).and(atom(3));
        assert_eq!(
            p.mask::<Set64>().unwrap_err(),
            JoinError::RepeatedChannel(3)
        );
    }

    #[test]
    fn repeated_inside_vector_fails() {
        let p = vector(&[1, 2, 1]);
        assert_eq!(
            p.mask::<Set64>().unwrap_err(),
            JoinError::RepeatedChannel(1)
        );
    }

    #[test]
    fn repeat_across_subtrees_fails() {
        let p = vector(&[1, 2]).and(vector(&[3, 2]));
        assert_eq!(
            p.mask::<Set64>().unwrap_err(),
            JoinError::RepeatedChannel(2)
        );
    }

    #[test]
    fn empty_vector_is_empty_mask() {
        let mask: Set64 = vector(&[]).mask().unwrap();
        assert!(mask.is_empty());

        let combined: Set64 = vector(&[]).and(atom(1)).mask().unwrap();
        assert_eq!(combined.ids(), vec![1]);
    }

    proptest! {
        /// Mask cardinality always equals the number of distinct channels
        /// joined, however the tree is shaped.
        #[test]
        fn mask_cardinality_matches_channel_count(
            ids in prop::collection::btree_set(0u32..64, 1..16),
            chunk in 1usize..4,
        ) {
            let ids: Vec<u32> = ids.iter().copied().collect();
            let mut pattern: Option<Pattern> = None;
            for group in ids.chunks(chunk) {
                let node = if group.len() == 1 {
                    atom(group[0])
                } else {
                    vector(group)
                };
                pattern = Some(match pattern {
                    None => node,
                    Some(p) => p.and(node),
                });
            }
            let pattern = pattern.unwrap();
            let mask: Set64 = pattern.mask().unwrap();
            prop_assert_eq!(mask.len() as usize, ids.len());
            prop_assert_eq!(pattern.channels().len(), ids.len());
        }

        /// A duplicated id anywhere in the tree always fails.
        #[test]
        fn duplicate_always_rejected(
            ids in prop::collection::btree_set(0u32..64, 1..8),
            dup_index in 0usize..8,
        ) {
            let ids: Vec<u32> = ids.iter().copied().collect();
            let dup = ids[dup_index % ids.len()];
            let mut pattern = vector(&ids);
            pattern = pattern.and(atom(dup));
            prop_assert_eq!(
                pattern.mask::<Set64>().unwrap_err(),
                JoinError::RepeatedChannel(dup)
            );
        }
    }
}
