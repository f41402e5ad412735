//! Record schemas and data blocks.
//!
//! A data stream's record structure is a tree of components with scalar
//! leaves, in the style of SWE Common. Record values travel as flat
//! [`DataBlock`]s holding the leaf values in depth-first order.

use serde::{Deserialize, Serialize};

use crate::time::Timestamp;

/// The primitive type of a scalar component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    Boolean,
    Count,
    Quantity,
    Category,
    Text,
    Time,
}

/// A scalar leaf of a record structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarComponent {
    pub name: String,
    pub scalar_type: ScalarType,
    /// Semantic definition URI, e.g. a phenomenon-time definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    /// Unit of measure code, meaningful for `Quantity` leaves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uom: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Definition URI marking the leaf that carries phenomenon time.
pub const DEF_PHENOMENON_TIME: &str = "http://www.opengis.net/def/property/OGC/0/PhenomenonTime";
/// Definition URI marking a generic sampling-time leaf.
pub const DEF_SAMPLING_TIME: &str = "http://www.opengis.net/def/property/OGC/0/SamplingTime";

/// A node of a record structure tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DataComponent {
    Record {
        name: String,
        fields: Vec<DataComponent>,
    },
    Vector {
        name: String,
        coordinates: Vec<ScalarComponent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference_frame: Option<String>,
    },
    Array {
        name: String,
        element: Box<DataComponent>,
        size: usize,
    },
    Scalar(ScalarComponent),
}

impl DataComponent {
    pub fn name(&self) -> &str {
        match self {
            DataComponent::Record { name, .. }
            | DataComponent::Vector { name, .. }
            | DataComponent::Array { name, .. } => name,
            DataComponent::Scalar(s) => &s.name,
        }
    }

    /// Number of scalar leaves in depth-first order; the expected length of
    /// a matching [`DataBlock`].
    pub fn flat_len(&self) -> usize {
        match self {
            DataComponent::Record { fields, .. } => fields.iter().map(Self::flat_len).sum(),
            DataComponent::Vector { coordinates, .. } => coordinates.len(),
            DataComponent::Array { element, size, .. } => element.flat_len() * size,
            DataComponent::Scalar(_) => 1,
        }
    }

    /// Depth-first index of the leaf carrying phenomenon time: the first
    /// `Time` scalar whose definition marks phenomenon or sampling time,
    /// falling back to the first `Time` scalar at all.
    pub fn time_leaf_index(&self) -> Option<usize> {
        fn walk(
            c: &DataComponent,
            next: &mut usize,
            fallback: &mut Option<usize>,
        ) -> Option<usize> {
            match c {
                DataComponent::Record { fields, .. } => {
                    for f in fields {
                        if let Some(i) = walk(f, next, fallback) {
                            return Some(i);
                        }
                    }
                    None
                }
                DataComponent::Vector { coordinates, .. } => {
                    for s in coordinates {
                        if let Some(i) = leaf(s, next, fallback) {
                            return Some(i);
                        }
                    }
                    None
                }
                DataComponent::Array { element, size, .. } => {
                    for _ in 0..*size {
                        if let Some(i) = walk(element, next, fallback) {
                            return Some(i);
                        }
                    }
                    None
                }
                DataComponent::Scalar(s) => leaf(s, next, fallback),
            }
        }

        fn leaf(
            s: &ScalarComponent,
            next: &mut usize,
            fallback: &mut Option<usize>,
        ) -> Option<usize> {
            let idx = *next;
            *next += 1;
            if s.scalar_type == ScalarType::Time {
                match s.definition.as_deref() {
                    Some(DEF_PHENOMENON_TIME) | Some(DEF_SAMPLING_TIME) => return Some(idx),
                    _ => {
                        if fallback.is_none() {
                            *fallback = Some(idx);
                        }
                    }
                }
            }
            None
        }

        let mut next = 0;
        let mut fallback = None;
        walk(self, &mut next, &mut fallback).or(fallback)
    }

    /// Structural compatibility: same tree shape, names, and leaf types.
    /// Units, labels, definitions, and reference frames may differ. Strict
    /// equality is plain `==`.
    pub fn shape_compatible(&self, other: &DataComponent) -> bool {
        match (self, other) {
            (
                DataComponent::Record { name: a, fields: fa },
                DataComponent::Record { name: b, fields: fb },
            ) => {
                a == b
                    && fa.len() == fb.len()
                    && fa.iter().zip(fb).all(|(x, y)| x.shape_compatible(y))
            }
            (
                DataComponent::Vector {
                    name: a,
                    coordinates: ca,
                    ..
                },
                DataComponent::Vector {
                    name: b,
                    coordinates: cb,
                    ..
                },
            ) => {
                a == b
                    && ca.len() == cb.len()
                    && ca
                        .iter()
                        .zip(cb)
                        .all(|(x, y)| x.name == y.name && x.scalar_type == y.scalar_type)
            }
            (
                DataComponent::Array {
                    name: a,
                    element: ea,
                    size: sa,
                },
                DataComponent::Array {
                    name: b,
                    element: eb,
                    size: sb,
                },
            ) => a == b && sa == sb && ea.shape_compatible(eb),
            (DataComponent::Scalar(x), DataComponent::Scalar(y)) => {
                x.name == y.name && x.scalar_type == y.scalar_type
            }
            _ => false,
        }
    }
}

/// A single leaf value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Boolean(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// The value as an instant, when it plausibly is one. Numeric values
    /// are read as epoch milliseconds.
    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            FieldValue::Int(ms) => Some(Timestamp(*ms)),
            FieldValue::Float(ms) => Some(Timestamp(*ms as i64)),
            FieldValue::Text(s) => Timestamp::parse_iso(s),
            FieldValue::Boolean(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// One record of a data stream: leaf values in depth-first schema order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataBlock(pub Vec<FieldValue>);

impl DataBlock {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&FieldValue> {
        self.0.get(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(name: &str, t: ScalarType) -> DataComponent {
        DataComponent::Scalar(ScalarComponent {
            name: name.to_string(),
            scalar_type: t,
            definition: None,
            uom: None,
            label: None,
        })
    }

    fn weather_record() -> DataComponent {
        DataComponent::Record {
            name: "weather".to_string(),
            fields: vec![
                DataComponent::Scalar(ScalarComponent {
                    name: "time".to_string(),
                    scalar_type: ScalarType::Time,
                    definition: Some(DEF_PHENOMENON_TIME.to_string()),
                    uom: None,
                    label: None,
                }),
                scalar("temp", ScalarType::Quantity),
                scalar("station", ScalarType::Text),
            ],
        }
    }

    #[test]
    fn flat_len_counts_leaves() {
        assert_eq!(weather_record().flat_len(), 3);
        let arr = DataComponent::Array {
            name: "samples".to_string(),
            element: Box::new(weather_record()),
            size: 4,
        };
        assert_eq!(arr.flat_len(), 12);
    }

    #[test]
    fn time_leaf_prefers_phenomenon_time_definition() {
        let rec = DataComponent::Record {
            name: "r".to_string(),
            fields: vec![
                scalar("other_time", ScalarType::Time),
                DataComponent::Scalar(ScalarComponent {
                    name: "phen".to_string(),
                    scalar_type: ScalarType::Time,
                    definition: Some(DEF_PHENOMENON_TIME.to_string()),
                    uom: None,
                    label: None,
                }),
            ],
        };
        assert_eq!(rec.time_leaf_index(), Some(1));
    }

    #[test]
    fn time_leaf_falls_back_to_first_time_scalar() {
        let rec = DataComponent::Record {
            name: "r".to_string(),
            fields: vec![scalar("temp", ScalarType::Quantity), scalar("t", ScalarType::Time)],
        };
        assert_eq!(rec.time_leaf_index(), Some(1));
        assert_eq!(scalar("temp", ScalarType::Quantity).time_leaf_index(), None);
    }

    #[test]
    fn shape_compatibility_relaxes_uom_only() {
        let a = weather_record();
        let mut b = a.clone();
        if let DataComponent::Record { fields, .. } = &mut b {
            if let DataComponent::Scalar(s) = &mut fields[1] {
                s.uom = Some("Cel".to_string());
            }
        }
        assert!(a.shape_compatible(&b));
        assert_ne!(a, b);

        let mut c = a.clone();
        if let DataComponent::Record { fields, .. } = &mut c {
            fields.push(scalar("extra", ScalarType::Count));
        }
        assert!(!a.shape_compatible(&c));
    }
}
