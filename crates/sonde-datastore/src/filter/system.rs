//! System / procedure filters.

use std::collections::BTreeSet;

use sonde_types::{InternalId, SystemDesc, TimeExtent, Timestamp};

use super::datastream::DataStreamFilter;
use super::foi::FoiFilter;
use super::property::PropertyPredicate;
use super::spatial::SpatialFilter;
use super::temporal::TemporalFilter;
use super::{intersect_nested, intersect_sets, min_limit, EmptyIntersection};
use crate::filter::property::wildcard_match;

/// Constraint on a system's parent link.
#[derive(Debug, Clone)]
pub enum ParentFilter {
    /// Only top-level systems.
    RootOnly,
    /// Systems whose parent matches the nested filter.
    Matching(Box<SystemFilter>),
}

/// Filter over systems.
#[derive(Debug, Clone, Default)]
pub struct SystemFilter {
    pub internal_ids: Option<BTreeSet<InternalId>>,
    pub unique_ids: Option<BTreeSet<String>>,
    pub valid_time: TemporalFilter,
    pub location: Option<SpatialFilter>,
    pub properties: Vec<PropertyPredicate>,
    pub feature_type: Option<String>,
    pub parent: Option<ParentFilter>,
    /// Requires at least one data stream matching the nested filter.
    pub data_streams: Option<Box<DataStreamFilter>>,
    pub limit: Option<usize>,
}

impl SystemFilter {
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

    pub fn with_current_version(self) -> Self {
        self.with_valid_time(TemporalFilter::CurrentTime { tolerance_ms: 0 })
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

    pub fn with_root_parents(mut self) -> Self {
        self.parent = Some(ParentFilter::RootOnly);
        self
    }

    pub fn with_parents(mut self, f: SystemFilter) -> Self {
        self.parent = Some(ParentFilter::Matching(Box::new(f)));
        self
    }

    pub fn with_data_streams(mut self, f: DataStreamFilter) -> Self {
        self.data_streams = Some(Box::new(f));
        self
    }

    /// Requires at least one observed FOI matching the nested filter;
    /// shorthand for a data-stream filter constrained by FOIs.
    pub fn with_fois(self, f: FoiFilter) -> Self {
        self.with_data_streams(DataStreamFilter::default().with_fois(f))
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Value-level predicate: UIDs, feature type, location, properties.
    ///
    /// ID membership and valid-time selection depend on the stored key and
    /// version interval, which the store checks during the scan (see
    /// [`SystemFilter::test_valid_time`]); nested parent and data-stream
    /// constraints likewise.
    pub fn test(&self, desc: &SystemDesc) -> bool {
        let f = &desc.feature;
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

    /// Tests a version's validity interval against the temporal part.
    pub fn test_valid_time(&self, interval: &TimeExtent, now: Timestamp) -> bool {
        self.valid_time.test_extent(interval, now)
    }

    /// Conjunction of two filters, or [`EmptyIntersection`] when provably
    /// unsatisfiable.
    pub fn intersect(&self, other: &SystemFilter) -> Result<SystemFilter, EmptyIntersection> {
        let parent = match (&self.parent, &other.parent) {
            (None, None) => None,
            (Some(p), None) | (None, Some(p)) => Some(p.clone()),
            (Some(ParentFilter::RootOnly), Some(ParentFilter::RootOnly)) => {
                Some(ParentFilter::RootOnly)
            }
            // A root has no parent to match a nested filter against.
            (Some(ParentFilter::RootOnly), Some(ParentFilter::Matching(_)))
            | (Some(ParentFilter::Matching(_)), Some(ParentFilter::RootOnly)) => {
                return Err(EmptyIntersection)
            }
            (Some(ParentFilter::Matching(a)), Some(ParentFilter::Matching(b))) => {
                Some(ParentFilter::Matching(Box::new(a.intersect(b)?)))
            }
        };

        let mut properties = self.properties.clone();
        properties.extend(other.properties.iter().cloned());

        Ok(SystemFilter {
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
            parent,
            data_streams: intersect_nested(&self.data_streams, &other.data_streams, |a, b| {
                a.intersect(b)
            })?,
            limit: min_limit(self.limit, other.limit),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_intersection_narrows_to_common_subset() {
        let a = SystemFilter::default().with_unique_ids(["urn:sonde:a", "urn:sonde:b"]);
        let b = SystemFilter::default().with_unique_ids(["urn:sonde:b", "urn:sonde:c"]);
        let joint = a.intersect(&b).unwrap();
        assert_eq!(
            joint.unique_ids,
            Some(["urn:sonde:b".to_string()].into())
        );

        let sys_b = SystemDesc::new("urn:sonde:b", "B");
        let sys_c = SystemDesc::new("urn:sonde:c", "C");
        assert!(joint.test(&sys_b));
        assert!(!joint.test(&sys_c));
        assert_eq!(a.test(&sys_b) && b.test(&sys_b), joint.test(&sys_b));

        let z = SystemFilter::default().with_unique_ids(["urn:sonde:z"]);
        assert!(joint.intersect(&z).is_err());
    }

    #[test]
    fn property_predicates_accumulate() {
        use sonde_types::PropValue;
        let a = SystemFilter::default()
            .with_property(PropertyPredicate::new("vendor", PropValue::Text("acme*".into())));
        let b = SystemFilter::default()
            .with_property(PropertyPredicate::new("height", PropValue::Number(5.0)));
        let joint = a.intersect(&b).unwrap();

        let mut sys = SystemDesc::new("urn:sonde:dev1", "dev");
        sys.feature
            .properties
            .insert("vendor".into(), PropValue::Text("acme-industrial".into()));
        assert!(!joint.test(&sys));
        sys.feature
            .properties
            .insert("height".into(), PropValue::Number(5.0));
        assert!(joint.test(&sys));
    }

    #[test]
    fn root_and_nested_parent_are_disjoint() {
        let a = SystemFilter::default().with_root_parents();
        let b = SystemFilter::default()
            .with_parents(SystemFilter::default().with_unique_ids(["urn:sonde:parent"]));
        assert!(a.intersect(&b).is_err());
    }
}
