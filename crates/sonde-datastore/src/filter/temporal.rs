//! Temporal predicates over validity intervals and instants.

use sonde_types::{TimeExtent, Timestamp};

use super::EmptyIntersection;

/// A predicate over time, applied either to an entity's validity interval
/// or to an observation instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemporalFilter {
    /// Matches every version / instant.
    #[default]
    AllTimes,
    /// Matches only the most recent version of each entity, regardless of
    /// the wall clock.
    LatestVersion,
    /// Matches versions valid now, within a symmetric tolerance in
    /// milliseconds.
    CurrentTime { tolerance_ms: i64 },
    /// Matches the closed range `[begin, end]`.
    Range { begin: Timestamp, end: Timestamp },
    /// Matches the single instant.
    Single(Timestamp),
}

impl TemporalFilter {
    pub fn range(begin: Timestamp, end: Timestamp) -> Self {
        TemporalFilter::Range { begin, end }
    }

    /// The concrete time window this filter selects, evaluated against the
    /// given wall clock. `LatestVersion` has no window: selection is
    /// positional, not temporal.
    pub fn window(&self, now: Timestamp) -> Option<TimeExtent> {
        match self {
            TemporalFilter::AllTimes => Some(TimeExtent::all_time()),
            TemporalFilter::LatestVersion => None,
            TemporalFilter::CurrentTime { tolerance_ms } => Some(TimeExtent::new(
                now.saturating_sub_millis(*tolerance_ms),
                now.saturating_add_millis(*tolerance_ms),
            )),
            TemporalFilter::Range { begin, end } => Some(TimeExtent::new(*begin, *end)),
            TemporalFilter::Single(t) => Some(TimeExtent::instant(*t)),
        }
    }

    /// Tests an instant (observation times).
    pub fn test_instant(&self, t: Timestamp, now: Timestamp) -> bool {
        match self.window(now) {
            Some(w) => w.contains(t),
            // Positional selection cannot be decided per instant; the store
            // resolves it during the scan.
            None => true,
        }
    }

    /// Tests a validity interval.
    pub fn test_extent(&self, extent: &TimeExtent, now: Timestamp) -> bool {
        match self.window(now) {
            Some(w) => w.intersects(extent),
            None => true,
        }
    }

    /// Conjunction of two temporal filters.
    ///
    /// `LatestVersion` composed with a windowed filter keeps both aspects
    /// by restricting the window to the latest selection, which the store
    /// applies positionally; composing it with itself is itself.
    pub fn intersect(&self, other: &TemporalFilter) -> Result<TemporalFilter, EmptyIntersection> {
        use TemporalFilter::*;
        match (self, other) {
            (AllTimes, f) | (f, AllTimes) => Ok(*f),
            (LatestVersion, LatestVersion) => Ok(LatestVersion),
            // Latest-of-matching degrades to the windowed side: the window
            // constrains which versions exist, the store picks the latest.
            (LatestVersion, f) | (f, LatestVersion) => Ok(*f),
            (a, b) => {
                let now = Timestamp::now();
                let wa = a.window(now).expect("windowed variant");
                let wb = b.window(now).expect("windowed variant");
                let joint = wa.intersection(&wb).ok_or(EmptyIntersection)?;
                if joint.is_instant() {
                    Ok(Single(joint.begin))
                } else {
                    Ok(Range {
                        begin: joint.begin,
                        end: joint.end,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_intersection() {
        let a = TemporalFilter::range(Timestamp(0), Timestamp(100));
        let b = TemporalFilter::range(Timestamp(50), Timestamp(150));
        assert_eq!(
            a.intersect(&b).unwrap(),
            TemporalFilter::range(Timestamp(50), Timestamp(100))
        );

        let c = TemporalFilter::range(Timestamp(200), Timestamp(300));
        assert_eq!(a.intersect(&c), Err(EmptyIntersection));
    }

    #[test]
    fn all_times_is_identity() {
        let f = TemporalFilter::Single(Timestamp(7));
        assert_eq!(TemporalFilter::AllTimes.intersect(&f).unwrap(), f);
    }

    #[test]
    fn degenerate_range_collapses_to_single() {
        let a = TemporalFilter::range(Timestamp(0), Timestamp(100));
        let b = TemporalFilter::range(Timestamp(100), Timestamp(200));
        assert_eq!(a.intersect(&b).unwrap(), TemporalFilter::Single(Timestamp(100)));
    }

    #[test]
    fn instant_test_matches_window() {
        let now = Timestamp(1000);
        let f = TemporalFilter::CurrentTime { tolerance_ms: 10 };
        assert!(f.test_instant(Timestamp(995), now));
        assert!(!f.test_instant(Timestamp(900), now));
    }
}
