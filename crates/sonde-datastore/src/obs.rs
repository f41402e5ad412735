//! The observation store.
//!
//! Observations accumulate under *series*: one series per
//! `(data_stream_id, foi_id, result_time)` triple, created lazily on the
//! first matching append. The primary map orders observations by
//! `(series_id, phenomenon_time)`; a secondary map keyed by
//! `(data_stream_id, result_time, foi_id)` resolves series for appends
//! and stream-wide scans.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, VecDeque};

use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sonde_db::{
    decode_body, decode_envelope, encode_value, id_key, obs_key, prefix_end, split_obs_key,
    split_series_ds_key, series_ds_key, MapDef,
};
use sonde_types::{InternalId, ObsData, TimeExtent, Timestamp};

use crate::database::{DbCore, ObsDatabase};
use crate::error::DatastoreError;
use crate::features::Abort;
use crate::filter::ObsFilter;
use crate::{datastreams, fois};

pub(crate) const SERIES_MAP: MapDef = MapDef::new("kv_obs_series");
pub(crate) const SERIES_DS_MAP: MapDef = MapDef::new("kv_obs_series_ds");
pub(crate) const OBS_MAP: MapDef = MapDef::new("kv_obs");

const OBS_SCHEMA_V1: u8 = 1;
const PAGE: usize = 256;

/// Storage key of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObsKey {
    pub series_id: InternalId,
    pub phenomenon_time: Timestamp,
}

/// The triple identifying one observation series.
///
/// `result_time` is [`Timestamp::MIN`] when the series' observations carry
/// their phenomenon time as result time; without that sentinel every
/// append with a fresh timestamp would open its own series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub data_stream_id: InternalId,
    pub foi_id: InternalId,
    pub result_time: Timestamp,
}

impl SeriesInfo {
    /// True when result time tracks each observation's phenomenon time.
    pub fn result_time_is_phenomenon_time(&self) -> bool {
        self.result_time == Timestamp::MIN
    }
}

fn series_result_time(data: &ObsData) -> Timestamp {
    if data.result_time == data.phenomenon_time {
        Timestamp::MIN
    } else {
        data.result_time
    }
}

fn decode_obs(blob: &[u8]) -> Result<ObsData, DatastoreError> {
    let env = decode_envelope(blob)?;
    match env.tag {
        OBS_SCHEMA_V1 => Ok(decode_body(env)?),
        found => Err(sonde_db::DbError::UnsupportedVersion {
            found,
            supported: OBS_SCHEMA_V1,
        }
        .into()),
    }
}

fn decode_series(blob: &[u8]) -> Result<SeriesInfo, DatastoreError> {
    let env = decode_envelope(blob)?;
    match env.tag {
        OBS_SCHEMA_V1 => Ok(decode_body(env)?),
        found => Err(sonde_db::DbError::UnsupportedVersion {
            found,
            supported: OBS_SCHEMA_V1,
        }
        .into()),
    }
}

fn parse_series_id(blob: &[u8]) -> Result<InternalId, DatastoreError> {
    let raw: [u8; 8] = blob
        .try_into()
        .map_err(|_| sonde_db::DbError::Corrupt("series index entry".to_string()))?;
    Ok(i64::from_be_bytes(raw))
}

/// Appends one observation, creating its series on first sighting and
/// growing the owning stream's time ranges. Single facade transaction, so
/// series allocation, the append, and the range extension land together.
pub(crate) fn add_in(
    conn: &Connection,
    core: &DbCore,
    data: ObsData,
    dirty: &mut usize,
) -> Result<ObsKey, DatastoreError> {
    if datastreams::get(conn, data.data_stream_id)?.is_none() {
        return Err(DatastoreError::InvalidRequest(format!(
            "unknown data stream {}",
            data.data_stream_id
        )));
    }

    let series_rt = series_result_time(&data);
    let triple_key = series_ds_key(data.data_stream_id, series_rt, data.foi_id);
    let series_id = match SERIES_DS_MAP.get(conn, &triple_key)? {
        Some(blob) => parse_series_id(&blob)?,
        None => {
            let id = core.seq_series.allocate(conn).map_err(DatastoreError::from)?;
            let info = SeriesInfo {
                data_stream_id: data.data_stream_id,
                foi_id: data.foi_id,
                result_time: series_rt,
            };
            *dirty += SERIES_MAP.put(conn, &id_key(id), &encode_value(OBS_SCHEMA_V1, &info)?)?;
            *dirty += SERIES_DS_MAP.put(conn, &triple_key, &id.to_be_bytes())?;
            id
        }
    };

    let key = ObsKey {
        series_id,
        phenomenon_time: data.phenomenon_time,
    };
    *dirty += OBS_MAP.put(
        conn,
        &obs_key(series_id, data.phenomenon_time),
        &encode_value(OBS_SCHEMA_V1, &data)?,
    )?;

    datastreams::extend_time_ranges(
        conn,
        data.data_stream_id,
        data.phenomenon_time,
        data.result_time,
        dirty,
    )?;

    Ok(key)
}

/// Overwrites the observation at `key`; last write wins within a series.
pub(crate) fn put_in(
    conn: &Connection,
    key: ObsKey,
    data: ObsData,
    dirty: &mut usize,
) -> Result<(), DatastoreError> {
    let series = get_series(conn, key.series_id)?
        .ok_or_else(|| DatastoreError::NotFound(format!("series {}", key.series_id)))?;
    if series.data_stream_id != data.data_stream_id
        || series.foi_id != data.foi_id
        || series.result_time != series_result_time(&data)
        || key.phenomenon_time != data.phenomenon_time
    {
        return Err(DatastoreError::InvalidRequest(
            "observation fields do not match the series of the target key".to_string(),
        ));
    }
    *dirty += OBS_MAP.put(
        conn,
        &obs_key(key.series_id, key.phenomenon_time),
        &encode_value(OBS_SCHEMA_V1, &data)?,
    )?;
    Ok(())
}

pub(crate) fn remove_in(conn: &Connection, key: ObsKey) -> Result<bool, DatastoreError> {
    OBS_MAP
        .delete(conn, &obs_key(key.series_id, key.phenomenon_time))
        .map_err(DatastoreError::from)
}

pub(crate) fn get(conn: &Connection, key: ObsKey) -> Result<Option<ObsData>, DatastoreError> {
    match OBS_MAP.get(conn, &obs_key(key.series_id, key.phenomenon_time))? {
        Some(blob) => Ok(Some(decode_obs(&blob)?)),
        None => Ok(None),
    }
}

pub(crate) fn get_series(
    conn: &Connection,
    series_id: InternalId,
) -> Result<Option<SeriesInfo>, DatastoreError> {
    match SERIES_MAP.get(conn, &id_key(series_id))? {
        Some(blob) => Ok(Some(decode_series(&blob)?)),
        None => Ok(None),
    }
}

/// Streams with at least one series about one of the given FOIs.
pub(crate) fn collect_ds_ids_for_fois(
    core: &DbCore,
    foi_ids: &BTreeSet<InternalId>,
) -> Result<BTreeSet<InternalId>, DatastoreError> {
    let conn = core.reader()?;
    let mut out = BTreeSet::new();
    for (_, v) in SERIES_MAP.scan_collect(&conn, &[], None)? {
        let series = decode_series(&v)?;
        if foi_ids.contains(&series.foi_id) {
            out.insert(series.data_stream_id);
        }
    }
    Ok(out)
}

/// Resolves the disjoint series prefixes a filter scans, ascending by
/// series ID.
fn resolve_series(
    core: &DbCore,
    conn: &Connection,
    filter: &ObsFilter,
    now: Timestamp,
) -> Result<Vec<(InternalId, SeriesInfo)>, Abort> {
    let ds_ids = match &filter.data_streams {
        Some(f) => {
            let set = datastreams::collect_ids(core, f)?;
            if set.is_empty() {
                return Err(Abort::Empty);
            }
            Some(set)
        }
        None => None,
    };
    let foi_ids = match &filter.fois {
        Some(f) => {
            let set = fois::collect_ids(core, f)?;
            if set.is_empty() {
                return Err(Abort::Empty);
            }
            Some(set)
        }
        None => None,
    };
    let result_window = filter.result_time.window(now);

    let keep = |series: &SeriesInfo| -> bool {
        if let Some(fois) = &foi_ids {
            if !fois.contains(&series.foi_id) {
                return false;
            }
        }
        if let Some(w) = &result_window {
            // The sentinel defers the result-time check to the per-entry
            // predicate, since result time then varies per observation.
            if !series.result_time_is_phenomenon_time() && !w.contains(series.result_time) {
                return false;
            }
        }
        true
    };

    let mut out = Vec::new();
    match ds_ids {
        Some(set) => {
            for ds in set {
                let prefix = id_key(ds);
                let hi = prefix_end(&prefix);
                for (k, v) in SERIES_DS_MAP
                    .scan_collect(conn, &prefix, hi.as_deref())
                    .map_err(DatastoreError::from)?
                {
                    let (data_stream_id, result_time, foi_id) =
                        split_series_ds_key(&k).map_err(DatastoreError::from)?;
                    let series = SeriesInfo {
                        data_stream_id,
                        foi_id,
                        result_time,
                    };
                    if keep(&series) {
                        out.push((parse_series_id(&v)?, series));
                    }
                }
            }
            out.sort_by_key(|(id, _)| *id);
        }
        None => {
            for (k, v) in SERIES_MAP
                .scan_collect(conn, &[], None)
                .map_err(DatastoreError::from)?
            {
                let series = decode_series(&v)?;
                if keep(&series) {
                    let id = sonde_db::read_i64(&k, 0).map_err(DatastoreError::from)?;
                    out.push((id, series));
                }
            }
        }
    }
    Ok(out)
}

/// One series' position in an ongoing scan.
struct SeriesCursor {
    series_id: InternalId,
    lo: Vec<u8>,
    hi: Option<Vec<u8>>,
    started: bool,
    /// `LatestVersion` phenomenon filters read only the newest entry.
    latest_only: bool,
    buf: VecDeque<(ObsKey, ObsData)>,
    done: bool,
}

impl SeriesCursor {
    fn new(series_id: InternalId, window: Option<TimeExtent>) -> Self {
        let (lo, hi, latest_only) = match window {
            Some(w) => {
                let lo = obs_key(series_id, w.begin);
                let hi = if w.end == Timestamp::MAX {
                    prefix_end(&id_key(series_id))
                } else {
                    Some(obs_key(series_id, Timestamp(w.end.millis().saturating_add(1))))
                };
                (lo, hi, false)
            }
            None => (
                obs_key(series_id, Timestamp::MIN),
                prefix_end(&id_key(series_id)),
                true,
            ),
        };
        SeriesCursor {
            series_id,
            lo,
            hi,
            started: false,
            latest_only,
            buf: VecDeque::new(),
            done: false,
        }
    }

    fn refill(&mut self, conn: &Connection) -> Result<(), DatastoreError> {
        if self.latest_only {
            self.done = true;
            if let Some((k, v)) = OBS_MAP.last_in_range(conn, &self.lo, self.hi.as_deref())? {
                self.buf.push_back(decode_entry(&k, &v)?);
            }
            return Ok(());
        }
        let rows = OBS_MAP.scan_page(conn, &self.lo, !self.started, self.hi.as_deref(), PAGE)?;
        self.started = true;
        if rows.len() < PAGE {
            self.done = true;
        }
        if let Some((last, _)) = rows.last() {
            self.lo = last.clone();
        }
        for (k, v) in rows {
            self.buf.push_back(decode_entry(&k, &v)?);
        }
        Ok(())
    }

    fn pop(&mut self, conn: &Connection) -> Result<Option<(ObsKey, ObsData)>, DatastoreError> {
        if self.buf.is_empty() && !self.done {
            self.refill(conn)?;
        }
        Ok(self.buf.pop_front())
    }
}

fn decode_entry(k: &[u8], v: &[u8]) -> Result<(ObsKey, ObsData), DatastoreError> {
    let (series_id, phenomenon_time) = split_obs_key(k)?;
    Ok((
        ObsKey {
            series_id,
            phenomenon_time,
        },
        decode_obs(v)?,
    ))
}

enum ObsOrder {
    /// `(series_id, phenomenon_time)` order: cursors drain sequentially.
    SeriesTime { current: usize },
    /// Global phenomenon-time order: k-way merge over the cursors.
    Time {
        heap: BinaryHeap<Reverse<(i64, InternalId, usize)>>,
        primed: bool,
    },
}

/// Lazy observation entry stream. Owns one pooled read connection shared
/// by all series cursors; dropping the stream releases the snapshot.
pub struct ObsEntries {
    conn: PooledConnection<SqliteConnectionManager>,
    cursors: Vec<SeriesCursor>,
    order: ObsOrder,
    filter: ObsFilter,
    now: Timestamp,
    emitted: usize,
    failed: bool,
}

impl ObsEntries {
    fn empty(conn: PooledConnection<SqliteConnectionManager>, filter: ObsFilter) -> Self {
        ObsEntries {
            conn,
            cursors: Vec::new(),
            order: ObsOrder::SeriesTime { current: 0 },
            filter,
            now: Timestamp::now(),
            emitted: 0,
            failed: false,
        }
    }

    fn next_inner(&mut self) -> Result<Option<(ObsKey, ObsData)>, DatastoreError> {
        loop {
            let candidate = match &mut self.order {
                ObsOrder::SeriesTime { current } => loop {
                    if *current >= self.cursors.len() {
                        break None;
                    }
                    match self.cursors[*current].pop(&self.conn)? {
                        Some(entry) => break Some(entry),
                        None => *current += 1,
                    }
                },
                ObsOrder::Time { heap, primed } => {
                    if !*primed {
                        *primed = true;
                        for i in 0..self.cursors.len() {
                            if let Some((k, v)) = self.cursors[i].pop(&self.conn)? {
                                self.cursors[i].buf.push_front((k, v));
                                heap.push(Reverse((
                                    k.phenomenon_time.millis(),
                                    k.series_id,
                                    i,
                                )));
                            }
                        }
                    }
                    match heap.pop() {
                        None => None,
                        Some(Reverse((_, _, i))) => {
                            let entry = self.cursors[i]
                                .pop(&self.conn)?
                                .expect("heap entry had a buffered head");
                            if let Some((k, v)) = self.cursors[i].pop(&self.conn)? {
                                self.cursors[i].buf.push_front((k, v));
                                heap.push(Reverse((
                                    k.phenomenon_time.millis(),
                                    k.series_id,
                                    i,
                                )));
                            }
                            Some(entry)
                        }
                    }
                }
            };

            let Some((key, data)) = candidate else {
                return Ok(None);
            };
            if self.filter.test(&data, self.now) {
                return Ok(Some((key, data)));
            }
        }
    }
}

impl Iterator for ObsEntries {
    type Item = Result<(ObsKey, ObsData), DatastoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(limit) = self.filter.limit {
            if self.emitted >= limit {
                return None;
            }
        }
        match self.next_inner() {
            Ok(Some(entry)) => {
                self.emitted += 1;
                Some(Ok(entry))
            }
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

pub(crate) fn entries(
    core: &DbCore,
    filter: &ObsFilter,
    time_ordered: bool,
) -> Result<ObsEntries, DatastoreError> {
    let conn = core.reader()?;
    let now = Timestamp::now();

    let series = match resolve_series(core, &conn, filter, now) {
        Ok(s) => s,
        Err(Abort::Empty) => return Ok(ObsEntries::empty(conn, filter.clone())),
        Err(Abort::Failed(e)) => return Err(e),
    };

    let phen_window = filter.phenomenon_time.window(now);
    let cursors: Vec<SeriesCursor> = series
        .into_iter()
        .map(|(id, _)| SeriesCursor::new(id, phen_window))
        .collect();

    let order = if time_ordered {
        ObsOrder::Time {
            heap: BinaryHeap::with_capacity(cursors.len()),
            primed: false,
        }
    } else {
        ObsOrder::SeriesTime { current: 0 }
    };

    Ok(ObsEntries {
        conn,
        cursors,
        order,
        filter: filter.clone(),
        now,
        emitted: 0,
        failed: false,
    })
}

/// Removes everything with phenomenon time strictly before `cutoff`,
/// pruning series left empty.
pub(crate) fn purge_before(db: &ObsDatabase, cutoff: Timestamp) -> Result<u64, DatastoreError> {
    db.execute_transaction(|tx| {
        let conn: &Connection = &tx.tx;
        let mut removed = 0u64;
        for (k, v) in SERIES_MAP.scan_collect(conn, &[], None)? {
            let series_id = sonde_db::read_i64(&k, 0)?;
            let lo = obs_key(series_id, Timestamp::MIN);
            let hi = obs_key(series_id, cutoff);
            removed += OBS_MAP.delete_range(conn, &lo, Some(&hi))? as u64;

            let prefix = id_key(series_id);
            let end = prefix_end(&prefix);
            if OBS_MAP.count_range(conn, &prefix, end.as_deref())? == 0 {
                let series = decode_series(&v)?;
                SERIES_MAP.delete(conn, &k)?;
                SERIES_DS_MAP.delete(
                    conn,
                    &series_ds_key(series.data_stream_id, series.result_time, series.foi_id),
                )?;
            }
        }
        Ok(removed)
    })
}

/// The observation store view.
pub struct ObsStore<'a> {
    pub(crate) db: &'a ObsDatabase,
}

impl ObsStore<'_> {
    /// Atomic append: series resolution, the write, and the stream's
    /// time-range extension commit together.
    pub fn add(&self, data: ObsData) -> Result<ObsKey, DatastoreError> {
        self.db.execute_transaction(|tx| tx.add_obs(data))
    }

    /// Last write wins for an existing `(series, phenomenonTime)` slot.
    pub fn put(&self, key: ObsKey, data: ObsData) -> Result<(), DatastoreError> {
        self.db.execute_transaction(|tx| tx.put_obs(key, data))
    }

    pub fn get(&self, key: ObsKey) -> Result<Option<ObsData>, DatastoreError> {
        let conn = self.db.core().reader()?;
        get(&conn, key)
    }

    pub fn get_series(&self, series_id: InternalId) -> Result<Option<SeriesInfo>, DatastoreError> {
        let conn = self.db.core().reader()?;
        get_series(&conn, series_id)
    }

    pub fn remove(&self, key: ObsKey) -> Result<bool, DatastoreError> {
        self.db.execute_transaction(|tx| tx.remove_obs(key))
    }

    /// Resolves the series a filter would scan, without reading any
    /// observation rows. Useful for linking FOIs and streams.
    pub fn select_series(
        &self,
        filter: &ObsFilter,
    ) -> Result<Vec<(InternalId, SeriesInfo)>, DatastoreError> {
        let core = self.db.core();
        let conn = core.reader()?;
        match resolve_series(core, &conn, filter, Timestamp::now()) {
            Ok(series) => Ok(series),
            Err(Abort::Empty) => Ok(Vec::new()),
            Err(Abort::Failed(e)) => Err(e),
        }
    }

    /// Lazy scan in `(series_id, phenomenon_time)` order.
    pub fn select_entries(&self, filter: &ObsFilter) -> Result<ObsEntries, DatastoreError> {
        entries(self.db.core(), filter, false)
    }

    /// Lazy scan merged into global phenomenon-time order.
    pub fn select_entries_time_ordered(
        &self,
        filter: &ObsFilter,
    ) -> Result<ObsEntries, DatastoreError> {
        entries(self.db.core(), filter, true)
    }

    pub fn count_matching(&self, filter: &ObsFilter) -> Result<u64, DatastoreError> {
        let mut n = 0u64;
        for entry in self.select_entries(filter)? {
            entry?;
            n += 1;
        }
        Ok(n)
    }

    pub fn remove_entries(&self, filter: &ObsFilter) -> Result<u64, DatastoreError> {
        let keys: Vec<ObsKey> = self
            .select_entries(filter)?
            .map(|r| r.map(|(k, _)| k))
            .collect::<Result<_, _>>()?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.db.execute_transaction(|tx| {
            let mut removed = 0u64;
            for key in keys {
                if tx.remove_obs(key)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }
}
