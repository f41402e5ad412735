//! Error type for the storage layer.

use thiserror::Error;

/// Errors that can occur in the key-value layer.
#[derive(Debug, Error)]
pub enum DbError {
    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The connection pool could not hand out a connection.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A stored value could not be serialised or deserialised.
    #[error("value serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value was written by a newer schema than this build knows.
    #[error("stored value has schema version {found}, newest supported is {supported}")]
    UnsupportedVersion { found: u8, supported: u8 },

    /// A key or value blob does not have the expected layout.
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}
