//! Feature descriptions: the metadata shape shared by systems and
//! features of interest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::geo::Geometry;
use crate::id::InternalId;
use crate::time::Timestamp;

/// Minimum length of a feature unique identifier.
pub const MIN_UID_LEN: usize = 12;

/// A typed property value on a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    Boolean(bool),
    Number(f64),
    Text(String),
}

/// The describing metadata of a feature, versioned by valid time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDesc {
    /// Globally unique identifier, at least [`MIN_UID_LEN`] characters.
    pub uid: String,
    /// Human-readable name; required, non-empty.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropValue>,
    /// Start of the validity interval. `None` at submission time means
    /// "valid from now".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_time: Option<Timestamp>,
}

impl FeatureDesc {
    pub fn new(uid: impl Into<String>, name: impl Into<String>) -> Self {
        FeatureDesc {
            uid: uid.into(),
            name: name.into(),
            description: None,
            feature_type: None,
            geometry: None,
            properties: BTreeMap::new(),
            valid_time: None,
        }
    }

    /// Checks the structural invariants every stored feature must satisfy.
    pub fn validation_error(&self) -> Option<String> {
        if self.uid.is_empty() {
            return Some("unique ID must not be empty".to_string());
        }
        if self.uid.len() < MIN_UID_LEN {
            return Some(format!(
                "unique ID must be at least {MIN_UID_LEN} characters: {:?}",
                self.uid
            ));
        }
        if self.name.trim().is_empty() {
            return Some("name must not be empty".to_string());
        }
        None
    }
}

/// A system (or procedure): a feature plus an optional parent link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemDesc {
    #[serde(flatten)]
    pub feature: FeatureDesc,
    /// Internal ID of the parent system, [`crate::ROOT_PARENT`] for roots.
    #[serde(default)]
    pub parent_id: InternalId,
}

impl SystemDesc {
    pub fn new(uid: impl Into<String>, name: impl Into<String>) -> Self {
        SystemDesc {
            feature: FeatureDesc::new(uid, name),
            parent_id: 0,
        }
    }

    pub fn uid(&self) -> &str {
        &self.feature.uid
    }
}
