//! Timestamps and time extents.
//!
//! All time values in Sonde are millisecond-precision instants on the Unix
//! epoch, stored as `i64`. Keeping the representation integral lets the
//! storage layer write order-preserving binary keys without conversion.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// An instant in time, as milliseconds since the Unix epoch.
///
/// `Timestamp::MAX` is the "latest version" sentinel used by the feature
/// stores: a lookup at `MAX` resolves to the most recent version of an
/// entity regardless of its validity interval.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// The earliest representable instant.
    pub const MIN: Timestamp = Timestamp(i64::MIN);
    /// The latest representable instant; doubles as the "latest version" sentinel.
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    /// The current wall-clock time.
    pub fn now() -> Self {
        Timestamp(Utc::now().timestamp_millis())
    }

    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis)
    }

    pub fn millis(self) -> i64 {
        self.0
    }

    /// Parses an RFC 3339 instant, or the literal `now`.
    pub fn parse_iso(s: &str) -> Option<Self> {
        if s == "now" {
            return Some(Self::now());
        }
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| Timestamp(dt.with_timezone(&Utc).timestamp_millis()))
    }

    /// Renders as an RFC 3339 instant. Sentinel values outside the range
    /// chrono can represent fall back to their raw millisecond form.
    pub fn to_iso(self) -> String {
        match DateTime::<Utc>::from_timestamp_millis(self.0) {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            None => self.0.to_string(),
        }
    }

    pub fn saturating_add_millis(self, delta: i64) -> Self {
        Timestamp(self.0.saturating_add(delta))
    }

    pub fn saturating_sub_millis(self, delta: i64) -> Self {
        Timestamp(self.0.saturating_sub(delta))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_iso())
    }
}

/// A closed time interval `[begin, end]`.
///
/// A degenerate extent with `begin == end` represents a single instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeExtent {
    pub begin: Timestamp,
    pub end: Timestamp,
}

impl TimeExtent {
    /// Builds an extent, normalising an inverted pair.
    pub fn new(begin: Timestamp, end: Timestamp) -> Self {
        if begin <= end {
            TimeExtent { begin, end }
        } else {
            TimeExtent { begin: end, end: begin }
        }
    }

    /// The degenerate extent covering exactly one instant.
    pub fn instant(t: Timestamp) -> Self {
        TimeExtent { begin: t, end: t }
    }

    /// The extent covering all representable time.
    pub fn all_time() -> Self {
        TimeExtent {
            begin: Timestamp::MIN,
            end: Timestamp::MAX,
        }
    }

    pub fn is_instant(&self) -> bool {
        self.begin == self.end
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        self.begin <= t && t <= self.end
    }

    pub fn intersects(&self, other: &TimeExtent) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }

    /// The overlapping part of two extents, or `None` when disjoint.
    pub fn intersection(&self, other: &TimeExtent) -> Option<TimeExtent> {
        if !self.intersects(other) {
            return None;
        }
        Some(TimeExtent {
            begin: self.begin.max(other.begin),
            end: self.end.min(other.end),
        })
    }

    /// Grows the extent to include `t`. Never shrinks.
    pub fn extend_to(&mut self, t: Timestamp) {
        if t < self.begin {
            self.begin = t;
        }
        if t > self.end {
            self.end = t;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render_round_trip() {
        let t = Timestamp::parse_iso("2024-06-01T12:30:00Z").unwrap();
        assert_eq!(t.to_iso(), "2024-06-01T12:30:00.000Z");
    }

    #[test]
    fn parse_now_is_close_to_wall_clock() {
        let before = Timestamp::now();
        let parsed = Timestamp::parse_iso("now").unwrap();
        let after = Timestamp::now();
        assert!(before <= parsed && parsed <= after);
    }

    #[test]
    fn sentinel_render_does_not_panic() {
        assert_eq!(Timestamp::MAX.to_iso(), i64::MAX.to_string());
    }

    #[test]
    fn extent_intersection() {
        let a = TimeExtent::new(Timestamp(0), Timestamp(100));
        let b = TimeExtent::new(Timestamp(50), Timestamp(200));
        assert_eq!(
            a.intersection(&b),
            Some(TimeExtent::new(Timestamp(50), Timestamp(100)))
        );

        let c = TimeExtent::new(Timestamp(101), Timestamp(200));
        assert!(a.intersection(&c).is_none());
        // Touching endpoints intersect: the interval is closed.
        let d = TimeExtent::new(Timestamp(100), Timestamp(200));
        assert!(a.intersects(&d));
    }

    #[test]
    fn extend_never_shrinks() {
        let mut e = TimeExtent::new(Timestamp(10), Timestamp(20));
        e.extend_to(Timestamp(15));
        assert_eq!(e, TimeExtent::new(Timestamp(10), Timestamp(20)));
        e.extend_to(Timestamp(5));
        e.extend_to(Timestamp(30));
        assert_eq!(e, TimeExtent::new(Timestamp(5), Timestamp(30)));
    }
}
