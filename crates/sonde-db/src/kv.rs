//! Named ordered maps over SQLite tables.
//!
//! A [`MapDef`] names one `(k BLOB PRIMARY KEY, v BLOB) WITHOUT ROWID`
//! table and provides point and range operations over it. All operations
//! take a connection explicitly so the same code runs inside facade
//! transactions and against pooled readers.

use std::collections::VecDeque;

use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::DbError;

/// One named ordered map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapDef {
    pub table: &'static str,
}

impl MapDef {
    pub const fn new(table: &'static str) -> Self {
        MapDef { table }
    }

    /// Point lookup.
    pub fn get(&self, conn: &Connection, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let mut stmt =
            conn.prepare_cached(&format!("SELECT v FROM {} WHERE k = ?1", self.table))?;
        Ok(stmt.query_row(params![key], |row| row.get(0)).optional()?)
    }

    /// Inserts or replaces. Returns the number of key+value bytes written,
    /// which the facade feeds into its dirty-byte accounting.
    pub fn put(&self, conn: &Connection, key: &[u8], value: &[u8]) -> Result<usize, DbError> {
        let mut stmt = conn.prepare_cached(&format!(
            "INSERT INTO {} (k, v) VALUES (?1, ?2)
             ON CONFLICT (k) DO UPDATE SET v = excluded.v",
            self.table
        ))?;
        stmt.execute(params![key, value])?;
        Ok(key.len() + value.len())
    }

    /// Deletes a key; `true` when an entry existed.
    pub fn delete(&self, conn: &Connection, key: &[u8]) -> Result<bool, DbError> {
        let mut stmt = conn.prepare_cached(&format!("DELETE FROM {} WHERE k = ?1", self.table))?;
        Ok(stmt.execute(params![key])? > 0)
    }

    /// First entry with `lo <= k` and, when bounded, `k < hi`.
    pub fn first_in_range(
        &self,
        conn: &Connection,
        lo: &[u8],
        hi: Option<&[u8]>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, DbError> {
        self.edge_in_range(conn, lo, hi, "ASC")
    }

    /// Last entry with `lo <= k` and, when bounded, `k < hi`.
    pub fn last_in_range(
        &self,
        conn: &Connection,
        lo: &[u8],
        hi: Option<&[u8]>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, DbError> {
        self.edge_in_range(conn, lo, hi, "DESC")
    }

    fn edge_in_range(
        &self,
        conn: &Connection,
        lo: &[u8],
        hi: Option<&[u8]>,
        order: &str,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, DbError> {
        let row = match hi {
            Some(hi) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT k, v FROM {} WHERE k >= ?1 AND k < ?2 ORDER BY k {order} LIMIT 1",
                    self.table
                ))?;
                stmt.query_row(params![lo, hi], |row| Ok((row.get(0)?, row.get(1)?)))
                    .optional()?
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT k, v FROM {} WHERE k >= ?1 ORDER BY k {order} LIMIT 1",
                    self.table
                ))?;
                stmt.query_row(params![lo], |row| Ok((row.get(0)?, row.get(1)?)))
                    .optional()?
            }
        };
        Ok(row)
    }

    /// Number of entries in `[lo, hi)`.
    pub fn count_range(
        &self,
        conn: &Connection,
        lo: &[u8],
        hi: Option<&[u8]>,
    ) -> Result<u64, DbError> {
        let n: i64 = match hi {
            Some(hi) => conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE k >= ?1 AND k < ?2", self.table),
                params![lo, hi],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE k >= ?1", self.table),
                params![lo],
                |row| row.get(0),
            )?,
        };
        Ok(n as u64)
    }

    /// Deletes every entry in `[lo, hi)`, returning the count removed.
    pub fn delete_range(
        &self,
        conn: &Connection,
        lo: &[u8],
        hi: Option<&[u8]>,
    ) -> Result<usize, DbError> {
        let n = match hi {
            Some(hi) => conn.execute(
                &format!("DELETE FROM {} WHERE k >= ?1 AND k < ?2", self.table),
                params![lo, hi],
            )?,
            None => conn.execute(
                &format!("DELETE FROM {} WHERE k >= ?1", self.table),
                params![lo],
            )?,
        };
        Ok(n)
    }

    /// One page of an ascending scan: up to `limit` entries starting at
    /// `lo` (inclusive when `inclusive`, strictly after otherwise) and
    /// below `hi` when bounded. Cursors layered over a shared connection
    /// page through ranges with this.
    pub fn scan_page(
        &self,
        conn: &Connection,
        lo: &[u8],
        inclusive: bool,
        hi: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        let cmp = if inclusive { ">=" } else { ">" };
        let rows = match hi {
            Some(hi) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT k, v FROM {} WHERE k {cmp} ?1 AND k < ?2 ORDER BY k ASC LIMIT ?3",
                    self.table
                ))?;
                let mapped = stmt.query_map(params![lo, hi, limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                mapped.collect::<Result<_, _>>()?
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT k, v FROM {} WHERE k {cmp} ?1 ORDER BY k ASC LIMIT ?2",
                    self.table
                ))?;
                let mapped = stmt.query_map(params![lo, limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                mapped.collect::<Result<_, _>>()?
            }
        };
        Ok(rows)
    }

    /// One-shot ascending scan of `[lo, hi)` collected into a `Vec`.
    ///
    /// Prefer [`RangeScan`] for result sets of unknown size.
    pub fn scan_collect(
        &self,
        conn: &Connection,
        lo: &[u8],
        hi: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        let mut out = Vec::new();
        let mut fetch = |sql: &str, p: &[&dyn rusqlite::ToSql]| -> Result<(), DbError> {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(p, |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            for row in rows {
                out.push(row?);
            }
            Ok(())
        };
        match hi {
            Some(hi) => fetch(
                &format!(
                    "SELECT k, v FROM {} WHERE k >= ?1 AND k < ?2 ORDER BY k ASC",
                    self.table
                ),
                &[&lo, &hi],
            )?,
            None => fetch(
                &format!("SELECT k, v FROM {} WHERE k >= ?1 ORDER BY k ASC", self.table),
                &[&lo],
            )?,
        }
        Ok(out)
    }
}

/// Default number of entries a [`RangeScan`] fetches per batch.
const SCAN_BATCH: usize = 256;

/// A lazy ascending range scan.
///
/// The cursor owns a pooled read connection and pulls key-ordered batches
/// via keyset pagination, so arbitrarily large ranges stream in constant
/// memory. Dropping the scan releases the connection; callers must not
/// hold scans across long pauses or the pool drains.
pub struct RangeScan {
    conn: PooledConnection<SqliteConnectionManager>,
    map: MapDef,
    /// Exclusive upper bound; `None` is unbounded.
    hi: Option<Vec<u8>>,
    /// Next batch starts strictly after this key; the initial position is
    /// inclusive and tracked by `started`.
    pos: Vec<u8>,
    started: bool,
    batch: VecDeque<(Vec<u8>, Vec<u8>)>,
    done: bool,
}

impl RangeScan {
    pub fn new(
        conn: PooledConnection<SqliteConnectionManager>,
        map: MapDef,
        lo: Vec<u8>,
        hi: Option<Vec<u8>>,
    ) -> Self {
        RangeScan {
            conn,
            map,
            hi,
            pos: lo,
            started: false,
            batch: VecDeque::new(),
            done: false,
        }
    }

    fn fetch_batch(&mut self) -> Result<(), DbError> {
        let rows = self.map.scan_page(
            &self.conn,
            &self.pos,
            !self.started,
            self.hi.as_deref(),
            SCAN_BATCH,
        )?;
        self.started = true;
        if rows.len() < SCAN_BATCH {
            self.done = true;
        }
        if let Some((last_key, _)) = rows.last() {
            self.pos = last_key.clone();
        }
        self.batch.extend(rows);
        Ok(())
    }
}

impl Iterator for RangeScan {
    type Item = Result<(Vec<u8>, Vec<u8>), DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.batch.is_empty() {
            if self.done {
                return None;
            }
            if let Err(e) = self.fetch_batch() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.batch.pop_front().map(Ok)
    }
}
