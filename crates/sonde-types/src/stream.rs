//! Data stream descriptors.

use serde::{Deserialize, Serialize};

use crate::id::InternalId;
use crate::swe::DataComponent;
use crate::time::{TimeExtent, Timestamp};

/// How record blocks of a stream are encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordEncoding {
    #[default]
    Json,
    Text,
    Binary,
}

/// Descriptor of one output channel of a system.
///
/// `(system_id, output_name, valid_time)` is unique: a structure change
/// creates a new version, a metadata-only change updates in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataStreamInfo {
    pub system_id: InternalId,
    pub output_name: String,
    pub record_schema: DataComponent,
    #[serde(default)]
    pub record_encoding: RecordEncoding,
    /// Start of this version's validity interval.
    pub valid_time: Timestamp,
    /// Phenomenon-time span of stored observations; grows monotonically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_time_range: Option<TimeExtent>,
    /// Result-time span of stored observations; grows monotonically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_time_range: Option<TimeExtent>,
}

impl DataStreamInfo {
    pub fn new(
        system_id: InternalId,
        output_name: impl Into<String>,
        record_schema: DataComponent,
    ) -> Self {
        DataStreamInfo {
            system_id,
            output_name: output_name.into(),
            record_schema,
            record_encoding: RecordEncoding::default(),
            valid_time: Timestamp::now(),
            observed_time_range: None,
            result_time_range: None,
        }
    }
}
