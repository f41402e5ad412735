//! The filter algebra.
//!
//! Each resource kind has an immutable filter value built with `with_*`
//! combinators. Two operations define the contract:
//!
//! - `test(value)` is the ground-truth predicate over the value-level
//!   fields (IDs, UIDs, times, location, properties). Nested resource
//!   predicates (parent systems, data streams, FOIs) need store access and
//!   are enforced by the stores during selection.
//! - `intersect(other)` returns a filter whose `test` is the conjunction
//!   of both, or [`EmptyIntersection`] when the conjunction is provably
//!   unsatisfiable (disjoint ID sets, disjoint time ranges, disjoint
//!   regions).
//!
//! Stores may use any filter field for index pushdown but always re-check
//! `test` on candidates.

mod datastream;
mod foi;
mod obs;
mod property;
mod spatial;
mod system;
mod temporal;

pub use datastream::DataStreamFilter;
pub use foi::FoiFilter;
pub use obs::{ObsFilter, ValuePredicate};
pub use property::PropertyPredicate;
pub use spatial::{SpatialFilter, SpatialOp};
pub use system::{ParentFilter, SystemFilter};
pub use temporal::TemporalFilter;

use std::collections::BTreeSet;

/// Signal that a filter intersection is provably empty.
///
/// This is an internal control-flow signal, not an error: stores convert
/// it into an empty result stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptyIntersection;

/// Intersects two optional sets where `None` means "unconstrained".
///
/// Returns `Err(EmptyIntersection)` when both sides are constrained and
/// share no element.
pub(crate) fn intersect_sets<T: Ord + Clone>(
    a: &Option<BTreeSet<T>>,
    b: &Option<BTreeSet<T>>,
) -> Result<Option<BTreeSet<T>>, EmptyIntersection> {
    match (a, b) {
        (None, None) => Ok(None),
        (Some(s), None) | (None, Some(s)) => Ok(Some(s.clone())),
        (Some(x), Some(y)) => {
            let joint: BTreeSet<T> = x.intersection(y).cloned().collect();
            if joint.is_empty() {
                Err(EmptyIntersection)
            } else {
                Ok(Some(joint))
            }
        }
    }
}

/// Intersects two optional nested filters by recursing when both are set.
pub(crate) fn intersect_nested<F, E>(
    a: &Option<Box<F>>,
    b: &Option<Box<F>>,
    intersect: E,
) -> Result<Option<Box<F>>, EmptyIntersection>
where
    F: Clone,
    E: FnOnce(&F, &F) -> Result<F, EmptyIntersection>,
{
    match (a, b) {
        (None, None) => Ok(None),
        (Some(f), None) | (None, Some(f)) => Ok(Some(f.clone())),
        (Some(x), Some(y)) => Ok(Some(Box::new(intersect(x, y)?))),
    }
}

/// The smaller of two optional limits.
pub(crate) fn min_limit(a: Option<usize>, b: Option<usize>) -> Option<usize> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_intersection_semantics() {
        let a: Option<BTreeSet<i64>> = Some([1, 2, 3].into());
        let b: Option<BTreeSet<i64>> = Some([2, 3, 4].into());
        assert_eq!(intersect_sets(&a, &b).unwrap(), Some([2, 3].into()));
        assert_eq!(intersect_sets(&a, &None).unwrap(), Some([1, 2, 3].into()));
        assert_eq!(intersect_sets::<i64>(&None, &None).unwrap(), None);

        let c: Option<BTreeSet<i64>> = Some([9].into());
        assert_eq!(intersect_sets(&a, &c), Err(EmptyIntersection));
    }
}
