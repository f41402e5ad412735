//! Observation filters.

use sonde_types::{DataBlock, FieldValue, ObsData, Timestamp};

use super::datastream::DataStreamFilter;
use super::foi::FoiFilter;
use super::temporal::TemporalFilter;
use super::{intersect_nested, min_limit, EmptyIntersection};

/// A predicate over a record's leaf values, applied lazily during scans.
#[derive(Debug, Clone, PartialEq)]
pub enum ValuePredicate {
    /// Leaf at `index` equals `value` exactly.
    FieldEquals { index: usize, value: FieldValue },
    /// Numeric leaf at `index` lies in `[min, max]`.
    FieldInRange { index: usize, min: f64, max: f64 },
}

impl ValuePredicate {
    pub fn test(&self, block: &DataBlock) -> bool {
        match self {
            ValuePredicate::FieldEquals { index, value } => {
                block.get(*index).is_some_and(|v| v == value)
            }
            ValuePredicate::FieldInRange { index, min, max } => block
                .get(*index)
                .and_then(FieldValue::as_f64)
                .is_some_and(|v| *min <= v && v <= *max),
        }
    }
}

/// Filter over observations.
#[derive(Debug, Clone, Default)]
pub struct ObsFilter {
    pub data_streams: Option<Box<DataStreamFilter>>,
    pub fois: Option<Box<FoiFilter>>,
    pub phenomenon_time: TemporalFilter,
    pub result_time: TemporalFilter,
    pub value_predicates: Vec<ValuePredicate>,
    pub limit: Option<usize>,
}

impl ObsFilter {
    pub fn with_data_streams(mut self, f: DataStreamFilter) -> Self {
        self.data_streams = Some(Box::new(f));
        self
    }

    pub fn with_fois(mut self, f: FoiFilter) -> Self {
        self.fois = Some(Box::new(f));
        self
    }

    pub fn with_phenomenon_time(mut self, t: TemporalFilter) -> Self {
        self.phenomenon_time = t;
        self
    }

    pub fn with_result_time(mut self, t: TemporalFilter) -> Self {
        self.result_time = t;
        self
    }

    pub fn with_value_predicate(mut self, p: ValuePredicate) -> Self {
        self.value_predicates.push(p);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Ground-truth predicate over one observation.
    pub fn test(&self, obs: &ObsData, now: Timestamp) -> bool {
        self.phenomenon_time.test_instant(obs.phenomenon_time, now)
            && self.result_time.test_instant(obs.result_time, now)
            && self.value_predicates.iter().all(|p| p.test(&obs.result))
    }

    pub fn intersect(&self, other: &ObsFilter) -> Result<ObsFilter, EmptyIntersection> {
        let mut value_predicates = self.value_predicates.clone();
        value_predicates.extend(other.value_predicates.iter().cloned());

        Ok(ObsFilter {
            data_streams: intersect_nested(&self.data_streams, &other.data_streams, |a, b| {
                a.intersect(b)
            })?,
            fois: intersect_nested(&self.fois, &other.fois, |a, b| a.intersect(b))?,
            phenomenon_time: self.phenomenon_time.intersect(&other.phenomenon_time)?,
            result_time: self.result_time.intersect(&other.result_time)?,
            value_predicates,
            limit: min_limit(self.limit, other.limit),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs_at(t: i64, value: f64) -> ObsData {
        ObsData::new(1, Timestamp(t), DataBlock(vec![FieldValue::Float(value)]))
    }

    #[test]
    fn conjunction_of_time_and_value() {
        let a = ObsFilter::default()
            .with_phenomenon_time(TemporalFilter::range(Timestamp(0), Timestamp(100)));
        let b = ObsFilter::default().with_value_predicate(ValuePredicate::FieldInRange {
            index: 0,
            min: 1.0,
            max: 2.0,
        });
        let joint = a.intersect(&b).unwrap();
        let now = Timestamp(0);

        for obs in [obs_at(50, 1.5), obs_at(150, 1.5), obs_at(50, 9.0)] {
            assert_eq!(joint.test(&obs, now), a.test(&obs, now) && b.test(&obs, now));
        }
    }

    #[test]
    fn disjoint_phenomenon_windows_are_empty() {
        let a = ObsFilter::default()
            .with_phenomenon_time(TemporalFilter::range(Timestamp(0), Timestamp(10)));
        let b = ObsFilter::default()
            .with_phenomenon_time(TemporalFilter::range(Timestamp(20), Timestamp(30)));
        assert!(a.intersect(&b).is_err());
    }

    #[test]
    fn field_equals_on_text_leaf() {
        let p = ValuePredicate::FieldEquals {
            index: 1,
            value: FieldValue::Text("ok".to_string()),
        };
        let block = DataBlock(vec![FieldValue::Int(3), FieldValue::Text("ok".to_string())]);
        assert!(p.test(&block));
        let block = DataBlock(vec![FieldValue::Int(3)]);
        assert!(!p.test(&block));
    }
}
