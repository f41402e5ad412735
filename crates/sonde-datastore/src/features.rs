//! Generic versioned feature storage.
//!
//! Systems and features of interest share the same storage shape: a map
//! keyed by `(internal_id, valid_time)` holding one description per
//! version, plus a UID lookup map. This module implements that shape once;
//! the concrete stores instantiate it and layer their resource-specific
//! filtering on top.

use std::collections::{BTreeSet, VecDeque};
use std::marker::PhantomData;

use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sonde_db::{
    decode_body, decode_envelope, encode_value, feature_key, id_key, prefix_end,
    split_feature_key, uid_key, IdSequence, MapDef, RangeScan,
};
use sonde_types::{FeatureDesc, InternalId, SystemDesc, TimeExtent, Timestamp};

use crate::error::DatastoreError;
use crate::filter::TemporalFilter;

/// Current schema tag for stored feature envelopes. Older tags are
/// upgraded in [`FeatureTable::decode`]; newer tags are rejected.
pub(crate) const FEATURE_SCHEMA_V1: u8 = 1;

/// Storage key of one feature version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeatureKey {
    pub internal_id: InternalId,
    pub valid_time: Timestamp,
}

/// A stored entity versioned by valid time.
pub trait VersionedFeature: Serialize + DeserializeOwned + Clone {
    /// Resource kind name used in error messages.
    const KIND: &'static str;

    fn desc(&self) -> &FeatureDesc;
    fn desc_mut(&mut self) -> &mut FeatureDesc;
}

impl VersionedFeature for FeatureDesc {
    const KIND: &'static str = "feature";

    fn desc(&self) -> &FeatureDesc {
        self
    }

    fn desc_mut(&mut self) -> &mut FeatureDesc {
        self
    }
}

impl VersionedFeature for SystemDesc {
    const KIND: &'static str = "system";

    fn desc(&self) -> &FeatureDesc {
        &self.feature
    }

    fn desc_mut(&mut self) -> &mut FeatureDesc {
        &mut self.feature
    }
}

/// The two maps backing one feature store.
pub(crate) struct FeatureTable<T> {
    pub map: MapDef,
    pub uid_map: MapDef,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for FeatureTable<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FeatureTable<T> {}

impl<T: VersionedFeature> FeatureTable<T> {
    pub const fn new(map: MapDef, uid_map: MapDef) -> Self {
        FeatureTable {
            map,
            uid_map,
            _marker: PhantomData,
        }
    }

    pub fn decode(&self, blob: &[u8]) -> Result<T, DatastoreError> {
        let env = decode_envelope(blob)?;
        match env.tag {
            FEATURE_SCHEMA_V1 => Ok(decode_body(env)?),
            found => Err(sonde_db::DbError::UnsupportedVersion {
                found,
                supported: FEATURE_SCHEMA_V1,
            }
            .into()),
        }
    }

    pub fn uid_to_id(&self, conn: &Connection, uid: &str) -> Result<Option<InternalId>, DatastoreError> {
        match self.uid_map.get(conn, &uid_key(uid))? {
            Some(blob) => {
                let raw: [u8; 8] = blob.as_slice().try_into().map_err(|_| {
                    sonde_db::DbError::Corrupt(format!("{} uid index entry", T::KIND))
                })?;
                Ok(Some(i64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    pub fn get(&self, conn: &Connection, key: FeatureKey) -> Result<Option<T>, DatastoreError> {
        match self
            .map
            .get(conn, &feature_key(key.internal_id, key.valid_time))?
        {
            Some(blob) => Ok(Some(self.decode(&blob)?)),
            None => Ok(None),
        }
    }

    /// All versions of one entity, ascending by valid time.
    pub fn versions(
        &self,
        conn: &Connection,
        id: InternalId,
    ) -> Result<Vec<(FeatureKey, T)>, DatastoreError> {
        let lo = id_key(id);
        let hi = prefix_end(&lo);
        let mut out = Vec::new();
        for (k, v) in self.map.scan_collect(conn, &lo, hi.as_deref())? {
            let (internal_id, valid_time) = split_feature_key(&k)?;
            out.push((
                FeatureKey {
                    internal_id,
                    valid_time,
                },
                self.decode(&v)?,
            ));
        }
        Ok(out)
    }

    /// Adds a new entity (or a version preceding all stored versions of an
    /// existing UID). Fails with `AlreadyExists` when the UID already has
    /// a version whose validity interval overlaps the new one.
    pub fn add(
        &self,
        conn: &Connection,
        seq: &IdSequence,
        mut value: T,
        dirty: &mut usize,
    ) -> Result<FeatureKey, DatastoreError> {
        if let Some(msg) = value.desc().validation_error() {
            return Err(DatastoreError::InvalidRequest(msg));
        }
        let valid_time = value.desc().valid_time.unwrap_or_else(Timestamp::now);
        value.desc_mut().valid_time = Some(valid_time);
        let uid = value.desc().uid.clone();

        let id = match self.uid_to_id(conn, &uid)? {
            Some(existing) => {
                // Any version starting at or before the new valid time has
                // an interval that covers it.
                let versions = self.versions(conn, existing)?;
                if versions.iter().any(|(k, _)| k.valid_time <= valid_time) {
                    return Err(DatastoreError::AlreadyExists(format!(
                        "{} {uid} at {valid_time}",
                        T::KIND
                    )));
                }
                existing
            }
            None => {
                let id = seq.allocate(conn).map_err(DatastoreError::from)?;
                *dirty += self
                    .uid_map
                    .put(conn, &uid_key(&uid), &id.to_be_bytes())?;
                id
            }
        };

        let blob = encode_value(FEATURE_SCHEMA_V1, &value)?;
        *dirty += self.map.put(conn, &feature_key(id, valid_time), &blob)?;
        Ok(FeatureKey {
            internal_id: id,
            valid_time,
        })
    }

    /// Appends a version of an existing entity. The previous version's
    /// implicit end is truncated by key order, nothing is rewritten.
    pub fn add_version(
        &self,
        conn: &Connection,
        mut value: T,
        dirty: &mut usize,
    ) -> Result<FeatureKey, DatastoreError> {
        if let Some(msg) = value.desc().validation_error() {
            return Err(DatastoreError::InvalidRequest(msg));
        }
        let uid = value.desc().uid.clone();
        let id = self
            .uid_to_id(conn, &uid)?
            .ok_or_else(|| DatastoreError::NotFound(format!("{} {uid}", T::KIND)))?;
        let valid_time = value.desc().valid_time.unwrap_or_else(Timestamp::now);
        value.desc_mut().valid_time = Some(valid_time);

        let blob = encode_value(FEATURE_SCHEMA_V1, &value)?;
        *dirty += self.map.put(conn, &feature_key(id, valid_time), &blob)?;
        Ok(FeatureKey {
            internal_id: id,
            valid_time,
        })
    }

    /// Overwrites one version in place, preserving UID and valid time.
    /// Returns the previous value.
    pub fn put(
        &self,
        conn: &Connection,
        key: FeatureKey,
        mut value: T,
        dirty: &mut usize,
    ) -> Result<T, DatastoreError> {
        if let Some(msg) = value.desc().validation_error() {
            return Err(DatastoreError::InvalidRequest(msg));
        }
        let previous = self.get(conn, key)?.ok_or_else(|| {
            DatastoreError::NotFound(format!("{} version {}", T::KIND, key.internal_id))
        })?;
        if previous.desc().uid != value.desc().uid {
            return Err(DatastoreError::InvalidRequest(
                "the UID of a stored version cannot change".to_string(),
            ));
        }
        value.desc_mut().valid_time = Some(key.valid_time);
        let blob = encode_value(FEATURE_SCHEMA_V1, &value)?;
        *dirty += self
            .map
            .put(conn, &feature_key(key.internal_id, key.valid_time), &blob)?;
        Ok(previous)
    }

    /// Removes one version; drops the UID index entry with the last one.
    pub fn remove_version(
        &self,
        conn: &Connection,
        key: FeatureKey,
    ) -> Result<bool, DatastoreError> {
        let Some(existing) = self.get(conn, key)? else {
            return Ok(false);
        };
        self.map
            .delete(conn, &feature_key(key.internal_id, key.valid_time))?;
        if self.versions(conn, key.internal_id)?.is_empty() {
            self.uid_map.delete(conn, &uid_key(&existing.desc().uid))?;
        }
        Ok(true)
    }

    /// Resolves "the version current for `now`": the one whose interval
    /// contains the instant, else the nearest one (earlier preferred).
    pub fn current_version(
        &self,
        conn: &Connection,
        id: InternalId,
        now: Timestamp,
    ) -> Result<Option<(FeatureKey, T)>, DatastoreError> {
        let versions = self.versions(conn, id)?;
        if versions.is_empty() {
            return Ok(None);
        }
        let idx = match versions.iter().rposition(|(k, _)| k.valid_time <= now) {
            Some(i) => i,
            // Everything starts in the future; the first version is nearest.
            None => 0,
        };
        Ok(Some(versions[idx].clone()))
    }
}

/// Validity interval of version `idx` within its sorted version list:
/// `[valid_time, next_valid_time)`, open-ended for the last version.
pub(crate) fn version_interval<T>(versions: &[(FeatureKey, T)], idx: usize) -> TimeExtent {
    let begin = versions[idx].0.valid_time;
    let end = versions
        .get(idx + 1)
        .map(|(k, _)| k.valid_time.saturating_sub_millis(1))
        .unwrap_or(Timestamp::MAX);
    TimeExtent::new(begin, end)
}

/// Picks the version indices a temporal filter selects from one entity's
/// sorted version list.
pub(crate) fn select_versions<T>(
    versions: &[(FeatureKey, T)],
    temporal: &TemporalFilter,
    now: Timestamp,
) -> Vec<usize> {
    if versions.is_empty() {
        return Vec::new();
    }
    match temporal.window(now) {
        None => vec![versions.len() - 1],
        Some(window) => (0..versions.len())
            .filter(|i| version_interval(versions, *i).intersects(&window))
            .collect(),
    }
}

/// Outcome of resolving a filter's ID-producing fields before a scan:
/// either the intersection is provably empty (not an error) or a real
/// store failure occurred and must propagate.
pub(crate) enum Abort {
    Empty,
    Failed(DatastoreError),
}

impl From<crate::filter::EmptyIntersection> for Abort {
    fn from(_: crate::filter::EmptyIntersection) -> Self {
        Abort::Empty
    }
}

impl From<DatastoreError> for Abort {
    fn from(e: DatastoreError) -> Self {
        Abort::Failed(e)
    }
}

/// Value-level selection hooks a concrete store supplies to the generic
/// entry iterator.
pub trait FeatureSelect<T>: Send {
    fn temporal(&self) -> &TemporalFilter;
    fn test_value(&self, value: &T) -> bool;
    fn limit(&self) -> Option<usize>;
}

enum ScanMode {
    /// Iterate an explicit, sorted ID list over an owned read connection.
    IdList {
        conn: PooledConnection<SqliteConnectionManager>,
        ids: VecDeque<InternalId>,
    },
    /// Stream the whole map through a [`RangeScan`], grouping adjacent
    /// versions by ID.
    FullScan {
        scan: RangeScan,
        group: Vec<(FeatureKey, Vec<u8>)>,
        /// First row of the next group, held across the flush boundary.
        carry: Option<(FeatureKey, Vec<u8>)>,
    },
}

/// Lazy `selectEntries` iterator: entries come out in internal-ID order,
/// versions ascending by valid time within each entity. Owns a pooled
/// read connection (directly or through its range scan); dropping the
/// iterator releases the snapshot.
pub struct FeatureEntries<T, S> {
    table: FeatureTable<T>,
    mode: ScanMode,
    select: S,
    now: Timestamp,
    pending: VecDeque<(FeatureKey, T)>,
    emitted: usize,
    failed: bool,
}

impl<T: VersionedFeature, S: FeatureSelect<T>> FeatureEntries<T, S> {
    /// `ids`: `Some` restricts the scan to those IDs (already intersected
    /// with every ID-producing filter field); `None` scans the whole map.
    pub(crate) fn new(
        table: FeatureTable<T>,
        conn: PooledConnection<SqliteConnectionManager>,
        ids: Option<BTreeSet<InternalId>>,
        select: S,
        now: Timestamp,
    ) -> Self {
        let mode = match ids {
            Some(set) => ScanMode::IdList {
                conn,
                ids: set.into_iter().collect(),
            },
            None => ScanMode::FullScan {
                scan: RangeScan::new(conn, table.map, Vec::new(), None),
                group: Vec::new(),
                carry: None,
            },
        };
        FeatureEntries {
            table,
            mode,
            select,
            now,
            pending: VecDeque::new(),
            emitted: 0,
            failed: false,
        }
    }

    /// An iterator that yields nothing; used when filter intersection
    /// resolution proves the result empty.
    pub(crate) fn empty(
        table: FeatureTable<T>,
        conn: PooledConnection<SqliteConnectionManager>,
        select: S,
    ) -> Self {
        Self::new(table, conn, Some(BTreeSet::new()), select, Timestamp::now())
    }

    fn process_group(&mut self, versions: Vec<(FeatureKey, T)>) {
        for idx in select_versions(&versions, self.select.temporal(), self.now) {
            let (key, value) = &versions[idx];
            if self.select.test_value(value) {
                self.pending.push_back((*key, value.clone()));
            }
        }
    }

    /// Assembles and processes the next entity group. Returns `false`
    /// once the scan is exhausted.
    fn advance(&mut self) -> Result<bool, DatastoreError> {
        match &mut self.mode {
            ScanMode::IdList { conn, ids } => {
                let Some(id) = ids.pop_front() else {
                    return Ok(false);
                };
                let versions = self.table.versions(conn, id)?;
                self.process_group(versions);
                Ok(true)
            }
            ScanMode::FullScan { .. } => self.advance_full_scan(),
        }
    }

    fn advance_full_scan(&mut self) -> Result<bool, DatastoreError> {
        let ScanMode::FullScan { scan, group, carry } = &mut self.mode
        else {
            unreachable!("advance_full_scan called in id-list mode");
        };

        loop {
            let boundary = match (carry.as_ref(), group.last()) {
                (Some((key, _)), Some((prev, _))) => prev.internal_id != key.internal_id,
                _ => false,
            };
            if boundary {
                // Flush the assembled group below; the carried row opens
                // the next group on the following call.
                break;
            }
            if let Some(row) = carry.take() {
                group.push(row);
            }
            match scan.next() {
                Some(Ok((k, v))) => {
                    let (internal_id, valid_time) = split_feature_key(&k)?;
                    *carry = Some((
                        FeatureKey {
                            internal_id,
                            valid_time,
                        },
                        v,
                    ));
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }

        if group.is_empty() {
            return Ok(false);
        }
        let raw = std::mem::take(group);
        let versions = self.decode_group(raw)?;
        self.process_group(versions);
        Ok(true)
    }

    fn decode_group(
        &self,
        raw: Vec<(FeatureKey, Vec<u8>)>,
    ) -> Result<Vec<(FeatureKey, T)>, DatastoreError> {
        raw.into_iter()
            .map(|(k, blob)| Ok((k, self.table.decode(&blob)?)))
            .collect()
    }
}

impl<T: VersionedFeature, S: FeatureSelect<T>> Iterator for FeatureEntries<T, S> {
    type Item = Result<(FeatureKey, T), DatastoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(limit) = self.select.limit() {
            if self.emitted >= limit {
                return None;
            }
        }
        loop {
            if let Some(entry) = self.pending.pop_front() {
                self.emitted += 1;
                return Some(Ok(entry));
            }
            match self.advance() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
