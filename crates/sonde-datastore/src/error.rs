//! Error types for the data stores.

use thiserror::Error;

/// Errors surfaced by store operations.
///
/// Filter-intersection emptiness is deliberately *not* a variant: stores
/// catch [`crate::filter::EmptyIntersection`] internally and return empty
/// result streams instead.
#[derive(Debug, Error)]
pub enum DatastoreError {
    /// Underlying storage failure.
    #[error(transparent)]
    Db(#[from] sonde_db::DbError),

    /// A UID collision at an overlapping valid-time interval.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A structurally invalid entity or malformed argument.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The database was opened read-only.
    #[error("data store is read-only")]
    ReadOnly,

    /// The database file could not be opened or initialised.
    #[error("database initialization failed: {0}")]
    Init(String),

    /// A stream update changed the record structure incompatibly; callers
    /// recover by creating a new stream version.
    #[error("incompatible record structure for data stream update")]
    StructureIncompatible,
}

impl From<rusqlite::Error> for DatastoreError {
    fn from(e: rusqlite::Error) -> Self {
        DatastoreError::Db(sonde_db::DbError::from(e))
    }
}

impl From<serde_json::Error> for DatastoreError {
    fn from(e: serde_json::Error) -> Self {
        DatastoreError::Db(sonde_db::DbError::from(e))
    }
}
