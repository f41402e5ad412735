//! Time-indexed observation stores for the Sonde observation hub.
//!
//! One [`ObsDatabase`] owns one embedded database file and exposes four
//! stores behind a single transactional boundary:
//!
//! - [`SystemStore`]: versioned system / procedure descriptions
//! - [`FoiStore`]: versioned features of interest
//! - [`DataStreamStore`]: output descriptors with structural versioning
//! - [`ObsStore`]: series-keyed, time-indexed observations
//!
//! Queries are expressed in the [`filter`] algebra; results stream lazily
//! out of read snapshots. All mutations serialise through the facade and
//! commit atomically per [`ObsDatabase::execute_transaction`].

mod database;
mod datastreams;
mod error;
mod features;
mod fois;
mod obs;
mod systems;

pub mod filter;

pub use database::{DatabaseConfig, ObsDatabase, TxScope};
pub use datastreams::{DataStreamStore, RegisterOutcome, StreamRegistration, StreamUpdate};
pub use error::DatastoreError;
pub use features::{FeatureKey, VersionedFeature};
pub use fois::{FoiEntries, FoiStore};
pub use obs::{ObsEntries, ObsKey, ObsStore, SeriesInfo};
pub use systems::{SystemEntries, SystemStore};
