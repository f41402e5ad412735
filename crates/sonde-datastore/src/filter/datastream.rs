//! Data stream filters.

use std::collections::BTreeSet;

use sonde_types::{DataStreamInfo, InternalId};

use super::foi::FoiFilter;
use super::system::SystemFilter;
use super::temporal::TemporalFilter;
use super::{intersect_nested, intersect_sets, min_limit, EmptyIntersection};

/// Filter over data streams.
#[derive(Debug, Clone, Default)]
pub struct DataStreamFilter {
    pub internal_ids: Option<BTreeSet<InternalId>>,
    /// Streams belonging to a matching system.
    pub systems: Option<Box<SystemFilter>>,
    pub output_names: Option<BTreeSet<String>>,
    pub valid_time: TemporalFilter,
    /// Streams with at least one series about a matching FOI.
    pub fois: Option<Box<FoiFilter>>,
    pub limit: Option<usize>,
}

impl DataStreamFilter {
    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = InternalId>) -> Self {
        self.internal_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_systems(mut self, f: SystemFilter) -> Self {
        self.systems = Some(Box::new(f));
        self
    }

    pub fn with_output_names<S: Into<String>>(
        mut self,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        self.output_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_valid_time(mut self, t: TemporalFilter) -> Self {
        self.valid_time = t;
        self
    }

    pub fn with_fois(mut self, f: FoiFilter) -> Self {
        self.fois = Some(Box::new(f));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Value-level predicate over the descriptor.
    pub fn test(&self, info: &DataStreamInfo) -> bool {
        if let Some(names) = &self.output_names {
            if !names.contains(&info.output_name) {
                return false;
            }
        }
        true
    }

    pub fn intersect(&self, other: &DataStreamFilter) -> Result<DataStreamFilter, EmptyIntersection> {
        Ok(DataStreamFilter {
            internal_ids: intersect_sets(&self.internal_ids, &other.internal_ids)?,
            systems: intersect_nested(&self.systems, &other.systems, |a, b| a.intersect(b))?,
            output_names: intersect_sets(&self.output_names, &other.output_names)?,
            valid_time: self.valid_time.intersect(&other.valid_time)?,
            fois: intersect_nested(&self.fois, &other.fois, |a, b| a.intersect(b))?,
            limit: min_limit(self.limit, other.limit),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonde_types::{DataComponent, ScalarComponent, ScalarType};

    fn stream(output: &str) -> DataStreamInfo {
        DataStreamInfo::new(
            1,
            output,
            DataComponent::Scalar(ScalarComponent {
                name: "v".to_string(),
                scalar_type: ScalarType::Quantity,
                definition: None,
                uom: None,
                label: None,
            }),
        )
    }

    #[test]
    fn output_name_sets_intersect() {
        let a = DataStreamFilter::default().with_output_names(["temp", "pressure"]);
        let b = DataStreamFilter::default().with_output_names(["temp", "wind"]);
        let joint = a.intersect(&b).unwrap();
        assert!(joint.test(&stream("temp")));
        assert!(!joint.test(&stream("pressure")));

        let c = DataStreamFilter::default().with_output_names(["humidity"]);
        assert!(joint.intersect(&c).is_err());
    }

    #[test]
    fn nested_system_filters_merge() {
        let a = DataStreamFilter::default()
            .with_systems(SystemFilter::default().with_unique_ids(["urn:sonde:s1"]));
        let b = DataStreamFilter::default().with_limit(10);
        let joint = a.intersect(&b).unwrap();
        assert!(joint.systems.is_some());
        assert_eq!(joint.limit, Some(10));
    }
}
