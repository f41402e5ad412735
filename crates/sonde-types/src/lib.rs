//! Shared types and constants for the Sonde observation hub.
//!
//! This crate provides the foundational types used across all Sonde crates:
//! internal/external identifiers, timestamps and time extents, geometry,
//! record schemas and data blocks, and the event types carried by the bus.
//!
//! No crate in the workspace depends on anything *except* `sonde-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

mod event;
mod feature;
mod geo;
mod id;
mod obs;
mod stream;
mod swe;
mod time;

pub use event::{topics, DataEvent, EventKind, EventKindSet, FoiEvent, HubEvent};
pub use feature::{FeatureDesc, PropValue, SystemDesc};
pub use geo::{Bbox, Geometry};
pub use id::{IdEncoder, InternalId, NO_FOI, ROOT_PARENT};
pub use obs::ObsData;
pub use stream::{DataStreamInfo, RecordEncoding};
pub use swe::{
    DataBlock, DataComponent, FieldValue, ScalarComponent, ScalarType, DEF_PHENOMENON_TIME,
    DEF_SAMPLING_TIME,
};
pub use time::{TimeExtent, Timestamp};
