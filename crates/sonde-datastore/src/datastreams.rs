//! The data-stream store.
//!
//! Descriptors live under their internal ID; a second map keyed by
//! `(system_id, output_name, valid_time)` orders the versions of each
//! output and backs lookup by producer output.
//!
//! Registration follows the structural-compatibility rules: an identical
//! descriptor is a no-op, a compatible structure change updates in place
//! advancing the valid time, an incompatible one starts a new stream
//! version with its own identity.

use std::collections::BTreeSet;

use rusqlite::Connection;
use sonde_db::{
    decode_body, decode_envelope, encode_value, id_key, prefix_end, push_i64, read_i64, MapDef,
};
use sonde_types::{DataComponent, DataStreamInfo, InternalId, RecordEncoding, TimeExtent, Timestamp};

use crate::database::{DbCore, ObsDatabase};
use crate::error::DatastoreError;
use crate::features::{select_versions, Abort, FeatureKey};
use crate::filter::DataStreamFilter;
use crate::{fois, obs, systems};

pub(crate) const DS_MAP: MapDef = MapDef::new("kv_datastreams");
pub(crate) const DS_SYS_MAP: MapDef = MapDef::new("kv_datastreams_sys");

const STREAM_SCHEMA_V1: u8 = 1;

/// Outcome of an in-place stream update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamUpdate {
    /// Nothing differed; nothing was written.
    Unchanged,
    /// Metadata-only or compatible change applied in place.
    Updated,
    /// The structure changed incompatibly; a new version was created and
    /// the previous one keeps its identity.
    NewVersion(InternalId),
}

/// Outcome of registering a producer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRegistration {
    /// The stream the producer should write against from now on.
    pub stream_id: InternalId,
    pub outcome: RegisterOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    Unchanged,
    Updated,
    NewVersion { previous: InternalId },
}

fn sys_index_key(system_id: InternalId, output_name: &str, valid_time: Timestamp) -> Vec<u8> {
    let mut k = Vec::with_capacity(17 + output_name.len());
    push_i64(&mut k, system_id);
    k.extend_from_slice(output_name.as_bytes());
    k.push(0);
    push_i64(&mut k, valid_time.millis());
    k
}

fn sys_output_prefix(system_id: InternalId, output_name: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(9 + output_name.len());
    push_i64(&mut k, system_id);
    k.extend_from_slice(output_name.as_bytes());
    k.push(0);
    k
}

fn index_value(id: InternalId) -> [u8; 8] {
    id.to_be_bytes()
}

fn parse_index_value(blob: &[u8]) -> Result<InternalId, DatastoreError> {
    let raw: [u8; 8] = blob
        .try_into()
        .map_err(|_| sonde_db::DbError::Corrupt("data stream index entry".to_string()))?;
    Ok(i64::from_be_bytes(raw))
}

pub(crate) fn decode(blob: &[u8]) -> Result<DataStreamInfo, DatastoreError> {
    let env = decode_envelope(blob)?;
    match env.tag {
        STREAM_SCHEMA_V1 => Ok(decode_body(env)?),
        found => Err(sonde_db::DbError::UnsupportedVersion {
            found,
            supported: STREAM_SCHEMA_V1,
        }
        .into()),
    }
}

pub(crate) fn get(conn: &Connection, id: InternalId) -> Result<Option<DataStreamInfo>, DatastoreError> {
    match DS_MAP.get(conn, &id_key(id))? {
        Some(blob) => Ok(Some(decode(&blob)?)),
        None => Ok(None),
    }
}

/// Latest version registered for one output of a system.
pub(crate) fn latest_for_output(
    conn: &Connection,
    system_id: InternalId,
    output_name: &str,
) -> Result<Option<(InternalId, DataStreamInfo)>, DatastoreError> {
    let prefix = sys_output_prefix(system_id, output_name);
    let hi = prefix_end(&prefix);
    match DS_SYS_MAP.last_in_range(conn, &prefix, hi.as_deref())? {
        Some((_, v)) => {
            let id = parse_index_value(&v)?;
            let info = get(conn, id)?.ok_or_else(|| {
                sonde_db::DbError::Corrupt(format!("dangling data stream index for {id}"))
            })?;
            Ok(Some((id, info)))
        }
        None => Ok(None),
    }
}

pub(crate) fn add_in(
    conn: &Connection,
    core: &DbCore,
    mut info: DataStreamInfo,
    dirty: &mut usize,
) -> Result<InternalId, DatastoreError> {
    if info.output_name.trim().is_empty() {
        return Err(DatastoreError::InvalidRequest(
            "output name must not be empty".to_string(),
        ));
    }
    if systems::TABLE.versions(conn, info.system_id)?.is_empty() {
        return Err(DatastoreError::InvalidRequest(format!(
            "unknown system {}",
            info.system_id
        )));
    }
    let id = core.seq_datastreams.allocate(conn).map_err(DatastoreError::from)?;
    let key = sys_index_key(info.system_id, &info.output_name, info.valid_time);
    info.observed_time_range = None;
    info.result_time_range = None;
    *dirty += DS_MAP.put(conn, &id_key(id), &encode_value(STREAM_SCHEMA_V1, &info)?)?;
    *dirty += DS_SYS_MAP.put(conn, &key, &index_value(id))?;
    Ok(id)
}

pub(crate) fn update_in(
    conn: &Connection,
    core: &DbCore,
    id: InternalId,
    mut info: DataStreamInfo,
    dirty: &mut usize,
) -> Result<StreamUpdate, DatastoreError> {
    let existing = get(conn, id)?
        .ok_or_else(|| DatastoreError::NotFound(format!("data stream {id}")))?;
    if info.system_id != existing.system_id || info.output_name != existing.output_name {
        return Err(DatastoreError::InvalidRequest(
            "a data stream cannot move to another system or output".to_string(),
        ));
    }

    if info.record_schema == existing.record_schema
        && info.record_encoding == existing.record_encoding
    {
        return Ok(StreamUpdate::Unchanged);
    }

    if info.record_schema.shape_compatible(&existing.record_schema) {
        // In-place update keeps identity, valid time, and observed ranges.
        info.valid_time = existing.valid_time;
        info.observed_time_range = existing.observed_time_range;
        info.result_time_range = existing.result_time_range;
        *dirty += DS_MAP.put(conn, &id_key(id), &encode_value(STREAM_SCHEMA_V1, &info)?)?;
        return Ok(StreamUpdate::Updated);
    }

    info.valid_time = Timestamp::now();
    let new_id = add_in(conn, core, info, dirty)?;
    Ok(StreamUpdate::NewVersion(new_id))
}

/// Resolves or creates the stream for `(system, output)` at registration
/// time.
pub(crate) fn register_in(
    conn: &Connection,
    core: &DbCore,
    system_id: InternalId,
    output_name: &str,
    schema: DataComponent,
    encoding: RecordEncoding,
    dirty: &mut usize,
) -> Result<StreamRegistration, DatastoreError> {
    match latest_for_output(conn, system_id, output_name)? {
        None => {
            let mut info = DataStreamInfo::new(system_id, output_name, schema);
            info.record_encoding = encoding;
            let id = add_in(conn, core, info, dirty)?;
            Ok(StreamRegistration {
                stream_id: id,
                outcome: RegisterOutcome::Created,
            })
        }
        Some((id, existing)) => {
            if existing.record_schema == schema && existing.record_encoding == encoding {
                return Ok(StreamRegistration {
                    stream_id: id,
                    outcome: RegisterOutcome::Unchanged,
                });
            }
            if existing.record_schema.shape_compatible(&schema) {
                // Compatible refinement: update in place, advancing the
                // validity start and moving the index entry with it.
                let now = Timestamp::now();
                let mut info = existing.clone();
                info.record_schema = schema;
                info.record_encoding = encoding;
                info.valid_time = now;
                DS_SYS_MAP.delete(conn, &sys_index_key(system_id, output_name, existing.valid_time))?;
                *dirty += DS_SYS_MAP.put(
                    conn,
                    &sys_index_key(system_id, output_name, now),
                    &index_value(id),
                )?;
                *dirty += DS_MAP.put(conn, &id_key(id), &encode_value(STREAM_SCHEMA_V1, &info)?)?;
                return Ok(StreamRegistration {
                    stream_id: id,
                    outcome: RegisterOutcome::Updated,
                });
            }
            let mut info = DataStreamInfo::new(system_id, output_name, schema);
            info.record_encoding = encoding;
            info.valid_time = Timestamp::now();
            let new_id = add_in(conn, core, info, dirty)?;
            Ok(StreamRegistration {
                stream_id: new_id,
                outcome: RegisterOutcome::NewVersion { previous: id },
            })
        }
    }
}

pub(crate) fn remove_in(conn: &Connection, id: InternalId) -> Result<bool, DatastoreError> {
    let Some(info) = get(conn, id)? else {
        return Ok(false);
    };
    DS_MAP.delete(conn, &id_key(id))?;
    DS_SYS_MAP.delete(
        conn,
        &sys_index_key(info.system_id, &info.output_name, info.valid_time),
    )?;
    Ok(true)
}

/// Monotonically grows a stream's observed/result time ranges after an
/// observation append. Never shrinks either range.
pub(crate) fn extend_time_ranges(
    conn: &Connection,
    id: InternalId,
    phenomenon_time: Timestamp,
    result_time: Timestamp,
    dirty: &mut usize,
) -> Result<(), DatastoreError> {
    let Some(mut info) = get(conn, id)? else {
        return Err(DatastoreError::NotFound(format!("data stream {id}")));
    };
    match &mut info.observed_time_range {
        Some(range) => range.extend_to(phenomenon_time),
        none => *none = Some(TimeExtent::instant(phenomenon_time)),
    }
    match &mut info.result_time_range {
        Some(range) => range.extend_to(result_time),
        none => *none = Some(TimeExtent::instant(result_time)),
    }
    *dirty += DS_MAP.put(conn, &id_key(id), &encode_value(STREAM_SCHEMA_V1, &info)?)?;
    Ok(())
}

/// Version list of one output, ascending by valid time, as pseudo feature
/// keys so the shared temporal selection applies.
fn output_versions(
    conn: &Connection,
    system_id: InternalId,
    output_name: &str,
) -> Result<Vec<(FeatureKey, InternalId)>, DatastoreError> {
    let prefix = sys_output_prefix(system_id, output_name);
    let hi = prefix_end(&prefix);
    let mut out = Vec::new();
    for (k, v) in DS_SYS_MAP.scan_collect(conn, &prefix, hi.as_deref())? {
        let vt = Timestamp(read_i64(&k, k.len() - 8)?);
        out.push((
            FeatureKey {
                internal_id: system_id,
                valid_time: vt,
            },
            parse_index_value(&v)?,
        ));
    }
    Ok(out)
}

/// Selects matching streams. Descriptor cardinality is small, so this
/// collects rather than streams.
pub(crate) fn select_collect(
    core: &DbCore,
    filter: &DataStreamFilter,
) -> Result<Vec<(InternalId, DataStreamInfo)>, DatastoreError> {
    let conn = core.reader()?;
    let now = Timestamp::now();

    let resolved: Result<_, Abort> = (|| {
        let mut ids = filter.internal_ids.clone();

        if let Some(foi_filter) = &filter.fois {
            let foi_ids = fois::collect_ids(core, foi_filter)?;
            if foi_ids.is_empty() {
                return Err(Abort::Empty);
            }
            let with_fois = obs::collect_ds_ids_for_fois(core, &foi_ids)?;
            if with_fois.is_empty() {
                return Err(Abort::Empty);
            }
            ids = crate::filter::intersect_sets(&ids, &Some(with_fois))?;
        }

        let system_ids = match &filter.systems {
            Some(sf) => {
                let set = systems::collect_ids_inner(core, sf)?;
                if set.is_empty() {
                    return Err(Abort::Empty);
                }
                Some(set)
            }
            None => None,
        };

        Ok((ids, system_ids))
    })();

    let (ids, system_ids) = match resolved {
        Ok(r) => r,
        Err(Abort::Empty) => return Ok(Vec::new()),
        Err(Abort::Failed(e)) => return Err(e),
    };

    let mut out = Vec::new();
    let mut limit_left = filter.limit.unwrap_or(usize::MAX);

    let candidates: Vec<(InternalId, DataStreamInfo)> = match &ids {
        Some(set) => {
            let mut c = Vec::new();
            for id in set {
                if let Some(info) = get(&conn, *id)? {
                    c.push((*id, info));
                }
            }
            c
        }
        None => {
            // Walk the (system, output, valid_time) index so versions of
            // one output come out grouped and ordered.
            let mut c = Vec::new();
            for (_k, v) in DS_SYS_MAP.scan_collect(&conn, &[], None)? {
                let id = parse_index_value(&v)?;
                if let Some(info) = get(&conn, id)? {
                    c.push((id, info));
                }
            }
            c
        }
    };

    for (id, info) in candidates {
        if limit_left == 0 {
            break;
        }
        if let Some(sys_ids) = &system_ids {
            if !sys_ids.contains(&info.system_id) {
                continue;
            }
        }
        if !filter.test(&info) {
            continue;
        }
        // Temporal selection is positional within the output's versions.
        let versions = output_versions(&conn, info.system_id, &info.output_name)?;
        let Some(pos) = versions.iter().position(|(_, vid)| *vid == id) else {
            continue;
        };
        if !select_versions(&versions, &filter.valid_time, now).contains(&pos) {
            continue;
        }
        out.push((id, info));
        limit_left -= 1;
    }

    Ok(out)
}

/// Distinct stream IDs matching the filter.
pub(crate) fn collect_ids(
    core: &DbCore,
    filter: &DataStreamFilter,
) -> Result<BTreeSet<InternalId>, DatastoreError> {
    Ok(select_collect(core, filter)?
        .into_iter()
        .map(|(id, _)| id)
        .collect())
}

/// Distinct IDs of systems owning a matching stream.
pub(crate) fn collect_system_ids(
    core: &DbCore,
    filter: &DataStreamFilter,
) -> Result<BTreeSet<InternalId>, DatastoreError> {
    Ok(select_collect(core, filter)?
        .into_iter()
        .map(|(_, info)| info.system_id)
        .collect())
}

/// The data-stream store view.
pub struct DataStreamStore<'a> {
    pub(crate) db: &'a ObsDatabase,
}

impl DataStreamStore<'_> {
    pub fn add(&self, info: DataStreamInfo) -> Result<InternalId, DatastoreError> {
        self.db.execute_transaction(|tx| tx.add_data_stream(info))
    }

    /// Applies the compatibility rules; see [`StreamUpdate`].
    pub fn update(&self, id: InternalId, info: DataStreamInfo) -> Result<StreamUpdate, DatastoreError> {
        self.db
            .execute_transaction(|tx| tx.update_data_stream(id, info))
    }

    /// Resolves or creates the stream for one producer output.
    pub fn register_output(
        &self,
        system_id: InternalId,
        output_name: &str,
        schema: DataComponent,
        encoding: RecordEncoding,
    ) -> Result<StreamRegistration, DatastoreError> {
        self.db
            .execute_transaction(|tx| tx.register_output(system_id, output_name, schema, encoding))
    }

    pub fn get(&self, id: InternalId) -> Result<Option<DataStreamInfo>, DatastoreError> {
        let conn = self.db.core().reader()?;
        get(&conn, id)
    }

    pub fn latest_for_output(
        &self,
        system_id: InternalId,
        output_name: &str,
    ) -> Result<Option<(InternalId, DataStreamInfo)>, DatastoreError> {
        let conn = self.db.core().reader()?;
        latest_for_output(&conn, system_id, output_name)
    }

    pub fn select_entries(
        &self,
        filter: &DataStreamFilter,
    ) -> Result<Vec<(InternalId, DataStreamInfo)>, DatastoreError> {
        select_collect(self.db.core(), filter)
    }

    pub fn count_matching(&self, filter: &DataStreamFilter) -> Result<u64, DatastoreError> {
        Ok(self.select_entries(filter)?.len() as u64)
    }

    pub fn remove(&self, id: InternalId) -> Result<bool, DatastoreError> {
        self.db.execute_transaction(|tx| tx.remove_data_stream(id))
    }

    pub fn remove_entries(&self, filter: &DataStreamFilter) -> Result<u64, DatastoreError> {
        let ids: Vec<InternalId> = self
            .select_entries(filter)?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        self.db.execute_transaction(|tx| {
            let mut removed = 0u64;
            for id in ids {
                if tx.remove_data_stream(id)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }
}
