//! Wire representations shared by the feature collections.

use std::collections::BTreeMap;

use serde::Deserialize;
use sonde_datastore::FeatureKey;
use sonde_types::{FeatureDesc, Geometry, IdEncoder, PropValue, SystemDesc, Timestamp};

use crate::resource::ApiError;

/// Incoming feature body for systems and FOIs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureBody {
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub feature_type: Option<String>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub properties: Option<BTreeMap<String, PropValue>>,
    /// RFC 3339 instant or `now`.
    #[serde(default)]
    pub valid_time: Option<String>,
    /// External ID of the parent system; only meaningful for systems.
    #[serde(default)]
    pub parent: Option<String>,
}

impl FeatureBody {
    pub fn into_desc(self) -> Result<FeatureDesc, ApiError> {
        let valid_time = match &self.valid_time {
            None => None,
            Some(raw) => Some(
                Timestamp::parse_iso(raw)
                    .ok_or_else(|| ApiError::BadRequest(format!("invalid validTime: {raw:?}")))?,
            ),
        };
        Ok(FeatureDesc {
            uid: self.uid,
            name: self.name,
            description: self.description,
            feature_type: self.feature_type,
            geometry: self.geometry,
            properties: self.properties.unwrap_or_default(),
            valid_time,
        })
    }

    pub fn into_system(self, sys_encoder: &IdEncoder) -> Result<SystemDesc, ApiError> {
        let parent_id = match &self.parent {
            None => 0,
            Some(raw) => {
                let id = sys_encoder.decode(raw);
                if id <= 0 {
                    return Err(ApiError::BadRequest(format!("invalid parent: {raw:?}")));
                }
                id
            }
        };
        Ok(SystemDesc {
            feature: self.into_desc()?,
            parent_id,
        })
    }
}

/// Serialized feature entry.
pub fn feature_json(
    encoder: &IdEncoder,
    key: &FeatureKey,
    desc: &FeatureDesc,
) -> serde_json::Value {
    serde_json::json!({
        "id": encoder.encode(key.internal_id),
        "uid": desc.uid,
        "name": desc.name,
        "description": desc.description,
        "featureType": desc.feature_type,
        "geometry": desc.geometry,
        "properties": desc.properties,
        "validTime": desc.valid_time.map(|t| t.to_iso()),
    })
}

/// Serialized system entry; adds the parent link.
pub fn system_json(encoder: &IdEncoder, key: &FeatureKey, desc: &SystemDesc) -> serde_json::Value {
    let mut value = feature_json(encoder, key, &desc.feature);
    if let serde_json::Value::Object(map) = &mut value {
        let parent = if desc.parent_id > 0 {
            serde_json::Value::String(encoder.encode(desc.parent_id))
        } else {
            serde_json::Value::Null
        };
        map.insert("parent".to_string(), parent);
    }
    value
}
