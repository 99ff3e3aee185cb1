//! Property tests for the id-set family
//!
//! These verify the set-algebra laws the join engines lean on: subset
//! checks against the state mask, cardinality after union, and the parity
//! routing of the `Pair` combinator.

use chorale_sets::{from_ids, IdSet, Set128, Set32, Set512, Set64};
use proptest::prelude::*;
use std::collections::BTreeSet;

fn ids_strategy(capacity: u32) -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(0..capacity, 0..24)
}

macro_rules! set_laws {
    ($module:ident, $set:ty) => {
        mod $module {
            use super::*;

            proptest! {
                #[test]
                fn matches_reference_set(ids in ids_strategy(<$set>::CAPACITY)) {
                    let s: $set = from_ids(&ids);
                    let reference: BTreeSet<u32> = ids.iter().copied().collect();
                    prop_assert_eq!(s.ids(), reference.iter().copied().collect::<Vec<_>>());
                    prop_assert_eq!(s.len() as usize, reference.len());
                }

                #[test]
                fn union_is_superset_of_both(
                    a in ids_strategy(<$set>::CAPACITY),
                    b in ids_strategy(<$set>::CAPACITY),
                ) {
                    let sa: $set = from_ids(&a);
                    let sb: $set = from_ids(&b);
                    let mut u = sa;
                    u.union_with(&sb);
                    prop_assert!(sa.is_subset_of(&u));
                    prop_assert!(sb.is_subset_of(&u));
                    prop_assert!(u.len() <= sa.len() + sb.len());
                    prop_assert!(u.len() >= sa.len().max(sb.len()));
                }

                #[test]
                fn difference_removes_exactly(
                    a in ids_strategy(<$set>::CAPACITY),
                    b in ids_strategy(<$set>::CAPACITY),
                ) {
                    let sa: $set = from_ids(&a);
                    let sb: $set = from_ids(&b);
                    let mut d = sa;
                    d.difference_with(&sb);
                    for id in 0..<$set>::CAPACITY {
                        prop_assert_eq!(
                            d.contains(id),
                            sa.contains(id) && !sb.contains(id)
                        );
                    }
                }

                #[test]
                fn subset_agrees_with_membership(
                    a in ids_strategy(<$set>::CAPACITY),
                    b in ids_strategy(<$set>::CAPACITY),
                ) {
                    let sa: $set = from_ids(&a);
                    let sb: $set = from_ids(&b);
                    let expected = sa.ids().iter().all(|&id| sb.contains(id));
                    prop_assert_eq!(sa.is_subset_of(&sb), expected);
                }

                #[test]
                fn insert_then_remove_round_trips(
                    ids in ids_strategy(<$set>::CAPACITY),
                    probe in 0u32..<$set>::CAPACITY,
                ) {
                    let mut s: $set = from_ids(&ids);
                    let fresh = s.insert(probe);
                    prop_assert_eq!(fresh, !ids.contains(&probe));
                    prop_assert!(s.contains(probe));
                    s.remove(probe);
                    prop_assert!(!s.contains(probe));
                }
            }
        }
    };
}

set_laws!(set32_laws, Set32);
set_laws!(set64_laws, Set64);
set_laws!(set128_laws, Set128);
set_laws!(set512_laws, Set512);
