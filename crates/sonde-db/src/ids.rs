//! Persistent monotonic ID sequences.
//!
//! Each sequence is one row in the `kv_meta` map. The next value is cached
//! in an atomic so allocation is one `fetch_add` plus a write-through of
//! the new high-water mark inside the caller's transaction. IDs are
//! positive, strictly increasing, and never reused for committed entries:
//! a rolled-back allocation leaves a gap, not a duplicate.

use std::sync::atomic::{AtomicI64, Ordering};

use rusqlite::Connection;
use sonde_types::InternalId;

use crate::error::DbError;
use crate::kv::MapDef;

const META: MapDef = MapDef::new("kv_meta");

/// One named allocator over the shared meta map.
#[derive(Debug)]
pub struct IdSequence {
    name: &'static str,
    next: AtomicI64,
}

impl IdSequence {
    /// Loads the sequence state, starting a fresh sequence at 1.
    pub fn load(conn: &Connection, name: &'static str) -> Result<Self, DbError> {
        let next = match META.get(conn, &Self::meta_key(name))? {
            Some(blob) => {
                let raw: [u8; 8] = blob
                    .as_slice()
                    .try_into()
                    .map_err(|_| DbError::Corrupt(format!("sequence {name} state")))?;
                i64::from_be_bytes(raw)
            }
            None => 1,
        };
        Ok(IdSequence {
            name,
            next: AtomicI64::new(next),
        })
    }

    /// Allocates the next ID, persisting the new high-water mark through
    /// `conn` (expected to be inside the facade's write transaction).
    pub fn allocate(&self, conn: &Connection) -> Result<InternalId, DbError> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        META.put(
            conn,
            &Self::meta_key(self.name),
            &(id + 1).to_be_bytes(),
        )?;
        Ok(id)
    }

    fn meta_key(name: &str) -> Vec<u8> {
        let mut k = b"seq:".to_vec();
        k.extend_from_slice(name.as_bytes());
        k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE kv_meta (k BLOB PRIMARY KEY, v BLOB NOT NULL) WITHOUT ROWID;")
            .unwrap();
        conn
    }

    #[test]
    fn sequences_are_monotonic_and_persistent() {
        let conn = meta_conn();
        let seq = IdSequence::load(&conn, "probe").unwrap();
        assert_eq!(seq.allocate(&conn).unwrap(), 1);
        assert_eq!(seq.allocate(&conn).unwrap(), 2);

        // A reload resumes after the persisted high-water mark.
        let reloaded = IdSequence::load(&conn, "probe").unwrap();
        assert_eq!(reloaded.allocate(&conn).unwrap(), 3);
    }

    #[test]
    fn sequences_are_independent() {
        let conn = meta_conn();
        let a = IdSequence::load(&conn, "a").unwrap();
        let b = IdSequence::load(&conn, "b").unwrap();
        assert_eq!(a.allocate(&conn).unwrap(), 1);
        assert_eq!(b.allocate(&conn).unwrap(), 1);
    }
}
