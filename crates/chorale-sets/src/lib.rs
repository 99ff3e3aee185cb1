//! Fixed-capacity id sets
//!
//! The join engines represent "which channels have pending messages" and
//! "which channels does this chord cover" as small dense bitsets indexed by
//! channel id. Capacity is fixed when a Join is created, so the sets never
//! allocate: a word set covers up to 64 ids, and the [`Pair`] combinator
//! doubles capacity by routing ids between two halves by parity.
//!
//! # Example
//!
//! ```
//! use chorale_sets::{IdSet, Set64};
//!
//! let mut state = Set64::empty();
//! state.insert(3);
//! state.insert(17);
//!
//! let mut mask = Set64::empty();
//! mask.insert(3);
//! assert!(mask.is_subset_of(&state));
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::fmt::{self, Debug};

// ============================================================
// Trait
// ============================================================

/// A fixed-capacity set of small unsigned ids.
///
/// Every implementation is `Copy` and allocation-free; the capacity is a
/// compile-time constant. Ids must be below [`IdSet::CAPACITY`]; passing a
/// larger id is a logic error (checked with `debug_assert!`).
pub trait IdSet:
    Copy + Clone + Default + PartialEq + Eq + Debug + Send + Sync + 'static
{
    /// Number of distinct ids this set can hold.
    const CAPACITY: u32;

    /// The empty set.
    fn empty() -> Self;

    /// The set containing every id below `n`.
    fn full_up_to(n: u32) -> Self {
        debug_assert!(n <= Self::CAPACITY);
        let mut set = Self::empty();
        for id in 0..n {
            set.insert(id);
        }
        set
    }

    /// Insert an id. Returns `false` if it was already present.
    fn insert(&mut self, id: u32) -> bool;

    /// Remove an id (no-op if absent).
    fn remove(&mut self, id: u32);

    /// Membership test.
    fn contains(&self, id: u32) -> bool;

    /// In-place union with another set.
    fn union_with(&mut self, other: &Self);

    /// In-place difference: remove every id present in `other`.
    fn difference_with(&mut self, other: &Self);

    /// Check whether the set is empty.
    fn is_empty(&self) -> bool;

    /// Check whether every id in `self` is also in `other`.
    fn is_subset_of(&self, other: &Self) -> bool;

    /// Number of ids in the set.
    fn len(&self) -> u32;

    /// Collect the set ids in ascending order.
    ///
    /// Allocates; intended for registration-time work and diagnostics,
    /// not the matching hot path.
    fn ids(&self) -> Vec<u32> {
        (0..Self::CAPACITY).filter(|&i| self.contains(i)).collect()
    }
}

// ============================================================
// Word sets
// ============================================================

macro_rules! word_set {
    ($(#[$doc:meta])* $name:ident, $word:ty, $capacity:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name($word);

        impl IdSet for $name {
            const CAPACITY: u32 = $capacity;

            #[inline]
            fn empty() -> Self {
                Self(0)
            }

            #[inline]
            fn insert(&mut self, id: u32) -> bool {
                debug_assert!(id < Self::CAPACITY);
                let bit = 1 << id;
                let fresh = self.0 & bit == 0;
                self.0 |= bit;
                fresh
            }

            #[inline]
            fn remove(&mut self, id: u32) {
                debug_assert!(id < Self::CAPACITY);
                self.0 &= !(1 << id);
            }

            #[inline]
            fn contains(&self, id: u32) -> bool {
                debug_assert!(id < Self::CAPACITY);
                self.0 & (1 << id) != 0
            }

            #[inline]
            fn union_with(&mut self, other: &Self) {
                self.0 |= other.0;
            }

            #[inline]
            fn difference_with(&mut self, other: &Self) {
                self.0 &= !other.0;
            }

            #[inline]
            fn is_empty(&self) -> bool {
                self.0 == 0
            }

            #[inline]
            fn is_subset_of(&self, other: &Self) -> bool {
                self.0 & !other.0 == 0
            }

            #[inline]
            fn len(&self) -> u32 {
                self.0.count_ones()
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_set().entries(self.ids()).finish()
            }
        }
    };
}

word_set!(
    /// A set of ids in `[0, 32)`, one machine word.
    Set32, u32, 32
);
word_set!(
    /// A set of ids in `[0, 64)`, one machine word.
    Set64, u64, 64
);

// ============================================================
// Pair combinator
// ============================================================

/// Two `S` sets composed into one of twice the capacity.
///
/// Id `i` routes to the even half when `i % 2 == 0` and the odd half
/// otherwise, as bit `i / 2` of that half. Applied recursively this covers
/// any power-of-two capacity at `O(log(capacity / 64))` per operation,
/// still without allocation.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Pair<S> {
    even: S,
    odd: S,
}

impl<S: IdSet> IdSet for Pair<S> {
    const CAPACITY: u32 = 2 * S::CAPACITY;

    #[inline]
    fn empty() -> Self {
        Self {
            even: S::empty(),
            odd: S::empty(),
        }
    }

    #[inline]
    fn insert(&mut self, id: u32) -> bool {
        debug_assert!(id < Self::CAPACITY);
        if id % 2 == 0 {
            self.even.insert(id / 2)
        } else {
            self.odd.insert(id / 2)
        }
    }

    #[inline]
    fn remove(&mut self, id: u32) {
        debug_assert!(id < Self::CAPACITY);
        if id % 2 == 0 {
            self.even.remove(id / 2);
        } else {
            self.odd.remove(id / 2);
        }
    }

    #[inline]
    fn contains(&self, id: u32) -> bool {
        debug_assert!(id < Self::CAPACITY);
        if id % 2 == 0 {
            self.even.contains(id / 2)
        } else {
            self.odd.contains(id / 2)
        }
    }

    #[inline]
    fn union_with(&mut self, other: &Self) {
        self.even.union_with(&other.even);
        self.odd.union_with(&other.odd);
    }

    #[inline]
    fn difference_with(&mut self, other: &Self) {
        self.even.difference_with(&other.even);
        self.odd.difference_with(&other.odd);
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.even.is_empty() && self.odd.is_empty()
    }

    #[inline]
    fn is_subset_of(&self, other: &Self) -> bool {
        self.even.is_subset_of(&other.even) && self.odd.is_subset_of(&other.odd)
    }

    #[inline]
    fn len(&self) -> u32 {
        self.even.len() + self.odd.len()
    }
}

impl<S: IdSet> Debug for Pair<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ids()).finish()
    }
}

/// Capacity 128.
pub type Set128 = Pair<Set64>;
/// Capacity 256.
pub type Set256 = Pair<Set128>;
/// Capacity 512.
pub type Set512 = Pair<Set256>;

// ============================================================
// Construction helpers
// ============================================================

/// Build a set from a slice of ids.
pub fn from_ids<S: IdSet>(ids: &[u32]) -> S {
    let mut set = S::empty();
    for &id in ids {
        set.insert(id);
    }
    set
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_ops<S: IdSet>() {
        let mut s = S::empty();
        assert!(s.is_empty());
        assert_eq!(s.len(), 0);

        assert!(s.insert(0));
        assert!(s.insert(S::CAPACITY - 1));
        assert!(!s.insert(0));
        assert_eq!(s.len(), 2);
        assert!(s.contains(0));
        assert!(s.contains(S::CAPACITY - 1));
        assert!(!s.contains(1));

        s.remove(0);
        assert!(!s.contains(0));
        assert_eq!(s.len(), 1);
        s.remove(0); // absent; no-op
        assert_eq!(s.len(), 1);
    }

    fn algebra_ops<S: IdSet>() {
        let a: S = from_ids(&[1, 2, 3]);
        let b: S = from_ids(&[3, 4]);

        let mut u = a;
        u.union_with(&b);
        assert_eq!(u.ids(), vec![1, 2, 3, 4]);
        assert_eq!(u.len(), 4);

        let mut d = u;
        d.difference_with(&b);
        assert_eq!(d.ids(), vec![1, 2]);

        assert!(a.is_subset_of(&u));
        assert!(b.is_subset_of(&u));
        assert!(!u.is_subset_of(&a));
        assert!(S::empty().is_subset_of(&a));
        assert!(a.is_subset_of(&a));
    }

    #[test]
    fn set32_basic() {
        basic_ops::<Set32>();
        algebra_ops::<Set32>();
    }

    #[test]
    fn set64_basic() {
        basic_ops::<Set64>();
        algebra_ops::<Set64>();
    }

    #[test]
    fn set128_basic() {
        basic_ops::<Set128>();
        algebra_ops::<Set128>();
    }

    #[test]
    fn set256_basic() {
        basic_ops::<Set256>();
        algebra_ops::<Set256>();
    }

    #[test]
    fn set512_basic() {
        basic_ops::<Set512>();
        algebra_ops::<Set512>();
    }

    #[test]
    fn pair_routing_is_disjoint() {
        // Even and odd ids land in different halves; inserting one never
        // makes the other visible.
        let mut s = Set128::empty();
        s.insert(64);
        assert!(!s.contains(65));
        assert!(!s.contains(32));
        assert_eq!(s.ids(), vec![64]);
    }

    #[test]
    fn capacities() {
        assert_eq!(Set32::CAPACITY, 32);
        assert_eq!(Set64::CAPACITY, 64);
        assert_eq!(Set128::CAPACITY, 128);
        assert_eq!(Set256::CAPACITY, 256);
        assert_eq!(Set512::CAPACITY, 512);
    }

    #[test]
    fn full_set_round_trip() {
        let mut s = Set256::empty();
        for i in 0..Set256::CAPACITY {
            assert!(s.insert(i));
        }
        assert_eq!(s.len(), 256);
        assert_eq!(s.ids(), (0..256).collect::<Vec<_>>());
        for i in 0..Set256::CAPACITY {
            s.remove(i);
        }
        assert!(s.is_empty());
    }

    #[test]
    fn full_up_to_is_a_prefix() {
        let s = Set128::full_up_to(70);
        assert_eq!(s.len(), 70);
        assert!(s.contains(69));
        assert!(!s.contains(70));
        assert!(Set32::full_up_to(0).is_empty());
    }

    #[test]
    fn debug_lists_members() {
        let s: Set64 = from_ids(&[5, 9]);
        assert_eq!(format!("{s:?}"), "{5, 9}");
    }
}
