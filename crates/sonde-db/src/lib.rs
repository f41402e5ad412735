//! SQLite layer for the Sonde observation hub.
//!
//! Provides connection pooling (via `r2d2`), WAL-mode initialization,
//! embedded SQL migrations, and a typed ordered key-value map adapter on
//! top of SQLite tables. Every store in Sonde reads and writes through the
//! named maps defined here: binary keys are encoded order-preserving, so
//! SQLite's primary-key B-tree gives the same point/range scan behaviour
//! an embedded ordered KV engine would.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: one file per database, concurrent readers
//!   with a single writer, and write-ahead commits — the access pattern the
//!   stores are built around.
//! - **`WITHOUT ROWID` blob-keyed tables as named maps**: the table's
//!   clustered primary key *is* the map order, so range scans over
//!   composite keys never touch a secondary index.
//! - **Versioned value envelopes**: every stored value carries a one-byte
//!   schema tag; readers accept old tags and upgrade at read time, and
//!   reject newer tags with a clear error.

mod codec;
mod error;
mod ids;
mod keys;
mod kv;
mod migrations;
mod pool;

pub use codec::{decode_body, decode_envelope, encode_value, Envelope};
pub use error::DbError;
pub use ids::IdSequence;
pub use keys::{
    feature_key, id_key, obs_key, prefix_end, push_i64, read_i64, series_ds_key,
    split_feature_key, split_obs_key, split_series_ds_key, uid_key,
};
pub use kv::{MapDef, RangeScan};
pub use migrations::run_migrations;
pub use pool::{create_pool, open_writer, DbPool, DbRuntimeSettings};
