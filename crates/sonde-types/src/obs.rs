//! Observation values.

use serde::{Deserialize, Serialize};

use crate::id::{InternalId, NO_FOI};
use crate::swe::DataBlock;
use crate::time::Timestamp;

/// A single observation as stored and served.
///
/// The store indexes observations under `(series, phenomenon_time)` where a
/// series is the `(data_stream_id, foi_id, result_time)` triple; the fields
/// here are the denormalised form consumers see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsData {
    pub data_stream_id: InternalId,
    /// [`NO_FOI`] when the observation is not about any feature.
    #[serde(default)]
    pub foi_id: InternalId,
    /// When the measured event occurred in the world.
    pub phenomenon_time: Timestamp,
    /// When the measurement was produced.
    pub result_time: Timestamp,
    pub result: DataBlock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl ObsData {
    pub fn new(
        data_stream_id: InternalId,
        phenomenon_time: Timestamp,
        result: DataBlock,
    ) -> Self {
        ObsData {
            data_stream_id,
            foi_id: NO_FOI,
            phenomenon_time,
            result_time: phenomenon_time,
            result,
            parameters: None,
        }
    }

    pub fn with_foi(mut self, foi_id: InternalId) -> Self {
        self.foi_id = foi_id;
        self
    }

    pub fn with_result_time(mut self, t: Timestamp) -> Self {
        self.result_time = t;
        self
    }
}
