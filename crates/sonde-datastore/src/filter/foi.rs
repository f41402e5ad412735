//! Feature-of-interest filters.

use std::collections::BTreeSet;

use sonde_types::{FeatureDesc, InternalId, TimeExtent, Timestamp};

use super::property::{wildcard_match, PropertyPredicate};
use super::spatial::SpatialFilter;
use super::temporal::TemporalFilter;
use super::{intersect_sets, min_limit, EmptyIntersection};

/// Filter over features of interest.
#[derive(Debug, Clone, Default)]
pub struct FoiFilter {
    pub internal_ids: Option<BTreeSet<InternalId>>,
    pub unique_ids: Option<BTreeSet<String>>,
    pub valid_time: TemporalFilter,
    pub location: Option<SpatialFilter>,
    pub properties: Vec<PropertyPredicate>,
    pub feature_type: Option<String>,
    pub limit: Option<usize>,
}

impl FoiFilter {
    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = InternalId>) -> Self {
        self.internal_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_unique_ids<S: Into<String>>(mut self, uids: impl IntoIterator<Item = S>) -> Self {
        self.unique_ids = Some(uids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_valid_time(mut self, t: TemporalFilter) -> Self {
        self.valid_time = t;
        self
    }

    pub fn with_location(mut self, f: SpatialFilter) -> Self {
        self.location = Some(f);
        self
    }

    pub fn with_property(mut self, p: PropertyPredicate) -> Self {
        self.properties.push(p);
        self
    }

    pub fn with_feature_type(mut self, t: impl Into<String>) -> Self {
        self.feature_type = Some(t.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Value-level predicate; see [`crate::filter::SystemFilter::test`]
    /// for what the store checks instead.
    pub fn test(&self, f: &FeatureDesc) -> bool {
        if let Some(uids) = &self.unique_ids {
            if !uids.contains(&f.uid) {
                return false;
            }
        }
        if let Some(pattern) = &self.feature_type {
            match &f.feature_type {
                Some(t) if wildcard_match(pattern, t) => {}
                _ => return false,
            }
        }
        if let Some(loc) = &self.location {
            match &f.geometry {
                Some(g) if loc.test(g) => {}
                _ => return false,
            }
        }
        for p in &self.properties {
            match f.properties.get(&p.name) {
                Some(v) if p.test(v) => {}
                _ => return false,
            }
        }
        true
    }

    pub fn test_valid_time(&self, interval: &TimeExtent, now: Timestamp) -> bool {
        self.valid_time.test_extent(interval, now)
    }

    pub fn intersect(&self, other: &FoiFilter) -> Result<FoiFilter, EmptyIntersection> {
        let mut properties = self.properties.clone();
        properties.extend(other.properties.iter().cloned());

        Ok(FoiFilter {
            internal_ids: intersect_sets(&self.internal_ids, &other.internal_ids)?,
            unique_ids: intersect_sets(&self.unique_ids, &other.unique_ids)?,
            valid_time: self.valid_time.intersect(&other.valid_time)?,
            location: match (&self.location, &other.location) {
                (None, None) => None,
                (Some(l), None) | (None, Some(l)) => Some(l.clone()),
                (Some(a), Some(b)) => Some(a.intersect(b)?),
            },
            properties,
            feature_type: match (&self.feature_type, &other.feature_type) {
                (None, None) => None,
                (Some(t), None) | (None, Some(t)) => Some(t.clone()),
                (Some(a), Some(b)) if a == b => Some(a.clone()),
                (Some(_), Some(_)) => return Err(EmptyIntersection),
            },
            limit: min_limit(self.limit, other.limit),
        })
    }
}
