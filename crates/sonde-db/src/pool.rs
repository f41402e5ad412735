//! Connection pool creation and writer connection setup.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};

use crate::error::DbError;

/// A type alias for the SQLite read connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Tunables applied to every connection at open time.
#[derive(Debug, Clone, Copy)]
pub struct DbRuntimeSettings {
    pub busy_timeout_ms: u32,
    pub pool_max_size: u32,
    /// Page cache budget in bytes; 0 keeps SQLite's default.
    pub memory_cache_size: u64,
    /// When set, connections are opened read-only and writes are rejected
    /// at the SQLite level as well as by the facade.
    pub read_only: bool,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        DbRuntimeSettings {
            busy_timeout_ms: 5000,
            pool_max_size: 8,
            memory_cache_size: 0,
            read_only: false,
        }
    }
}

fn init_pragmas(conn: &Connection, settings: &DbRuntimeSettings) -> Result<(), rusqlite::Error> {
    // journal_mode is a property of the database file; a read-only
    // connection cannot (and need not) set it.
    if !settings.read_only {
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    }
    conn.execute_batch(&format!(
        "PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = {};",
        settings.busy_timeout_ms
    ))?;
    if settings.memory_cache_size > 0 {
        // Negative cache_size is a KiB budget rather than a page count.
        conn.execute_batch(&format!(
            "PRAGMA cache_size = -{};",
            settings.memory_cache_size / 1024
        ))?;
    }
    Ok(())
}

fn open_flags(settings: &DbRuntimeSettings) -> OpenFlags {
    if settings.read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_FULL_MUTEX
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX
    }
}

/// Creates the read connection pool.
///
/// Use `:memory:` only in tests that never need a second connection; the
/// stores share data between the writer and the pool through the database
/// file, so production paths must be real files.
///
/// # Errors
///
/// Returns `DbError::Pool` if the connection pool cannot be created.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, DbError> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(open_flags(&settings))
        .with_init(move |conn| init_pragmas(conn, &settings));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size.max(1))
        .build(manager)?;

    Ok(pool)
}

/// Opens the single writer connection the facade serialises mutations
/// through.
///
/// # Errors
///
/// Returns `DbError::Sqlite` if the file cannot be opened or configured.
pub fn open_writer(db_path: &str, settings: DbRuntimeSettings) -> Result<Connection, DbError> {
    let conn = Connection::open_with_flags(db_path, open_flags(&settings))?;
    init_pragmas(&conn, &settings)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_applies_wal_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pool.db");
        let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default())
            .expect("pool creation should succeed");
        let conn = pool.get().expect("should get a connection");

        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("should query journal_mode");
        assert_eq!(mode, "wal");
    }

    #[test]
    fn writer_and_pool_share_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("shared.db");
        let settings = DbRuntimeSettings::default();

        let writer = open_writer(path.to_str().unwrap(), settings).expect("writer");
        writer
            .execute_batch("CREATE TABLE probe (id INTEGER PRIMARY KEY); INSERT INTO probe VALUES (1);")
            .expect("write");

        let pool = create_pool(path.to_str().unwrap(), settings).expect("pool");
        let conn = pool.get().expect("conn");
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM probe", [], |row| row.get(0))
            .expect("read");
        assert_eq!(n, 1);
    }
}
