//! The system / procedure store.

use std::collections::BTreeSet;

use sonde_db::MapDef;
use sonde_types::{InternalId, SystemDesc, Timestamp, ROOT_PARENT};

use crate::database::{DbCore, ObsDatabase};
use crate::error::DatastoreError;
use crate::features::{Abort, FeatureEntries, FeatureKey, FeatureSelect, FeatureTable};
use crate::filter::{ParentFilter, SystemFilter, TemporalFilter};
use crate::datastreams;

pub(crate) const TABLE: FeatureTable<SystemDesc> = FeatureTable::new(
    MapDef::new("kv_systems"),
    MapDef::new("kv_systems_uid"),
);

/// How the parent constraint was resolved for a scan.
pub(crate) enum ParentSelect {
    Any,
    RootOnly,
    In(BTreeSet<InternalId>),
}

/// Selection hooks for the generic entry iterator.
pub struct SysSelect {
    filter: SystemFilter,
    parent: ParentSelect,
}

impl FeatureSelect<SystemDesc> for SysSelect {
    fn temporal(&self) -> &TemporalFilter {
        &self.filter.valid_time
    }

    fn test_value(&self, value: &SystemDesc) -> bool {
        let parent_ok = match &self.parent {
            ParentSelect::Any => true,
            ParentSelect::RootOnly => value.parent_id == ROOT_PARENT,
            ParentSelect::In(ids) => ids.contains(&value.parent_id),
        };
        parent_ok && self.filter.test(value)
    }

    fn limit(&self) -> Option<usize> {
        self.filter.limit
    }
}

/// Lazy system entry stream.
pub type SystemEntries = FeatureEntries<SystemDesc, SysSelect>;

/// Builds the entry iterator for a filter, with every ID-producing field
/// already pushed down into the scan's ID list.
pub(crate) fn entries(
    core: &DbCore,
    filter: &SystemFilter,
) -> Result<SystemEntries, DatastoreError> {
    let conn = core.reader()?;
    let now = Timestamp::now();

    let resolved: Result<_, Abort> = (|| {
        let mut ids = filter.internal_ids.clone();

        if let Some(uids) = &filter.unique_ids {
            let mut uid_ids = BTreeSet::new();
            for uid in uids {
                if let Some(id) = TABLE.uid_to_id(&conn, uid)? {
                    uid_ids.insert(id);
                }
            }
            if uid_ids.is_empty() {
                return Err(Abort::Empty);
            }
            ids = crate::filter::intersect_sets(&ids, &Some(uid_ids))?;
        }

        if let Some(ds_filter) = &filter.data_streams {
            let with_streams = datastreams::collect_system_ids(core, ds_filter)?;
            if with_streams.is_empty() {
                return Err(Abort::Empty);
            }
            ids = crate::filter::intersect_sets(&ids, &Some(with_streams))?;
        }

        let parent = match &filter.parent {
            None => ParentSelect::Any,
            Some(ParentFilter::RootOnly) => ParentSelect::RootOnly,
            Some(ParentFilter::Matching(pf)) => {
                let parents = collect_ids_inner(core, pf)?;
                if parents.is_empty() {
                    return Err(Abort::Empty);
                }
                ParentSelect::In(parents)
            }
        };

        Ok((ids, parent))
    })();

    match resolved {
        Ok((ids, parent)) => Ok(FeatureEntries::new(
            TABLE,
            conn,
            ids,
            SysSelect {
                filter: filter.clone(),
                parent,
            },
            now,
        )),
        Err(Abort::Empty) => Ok(FeatureEntries::empty(
            TABLE,
            conn,
            SysSelect {
                filter: filter.clone(),
                parent: ParentSelect::Any,
            },
        )),
        Err(Abort::Failed(e)) => Err(e),
    }
}

/// Distinct internal IDs of systems matching the filter.
pub(crate) fn collect_ids_inner(
    core: &DbCore,
    filter: &SystemFilter,
) -> Result<BTreeSet<InternalId>, DatastoreError> {
    let mut ids = BTreeSet::new();
    for entry in entries(core, filter)? {
        let (key, _) = entry?;
        ids.insert(key.internal_id);
    }
    Ok(ids)
}

/// The system store view.
pub struct SystemStore<'a> {
    pub(crate) db: &'a ObsDatabase,
}

impl SystemStore<'_> {
    /// Adds a new system. See spec'd UID-overlap rules on the generic
    /// feature table.
    pub fn add(&self, desc: SystemDesc) -> Result<FeatureKey, DatastoreError> {
        let key = self.db.execute_transaction(|tx| tx.add_system(desc))?;
        Ok(key)
    }

    /// Appends a version to an existing system.
    pub fn add_version(&self, desc: SystemDesc) -> Result<FeatureKey, DatastoreError> {
        self.db.execute_transaction(|tx| tx.add_system_version(desc))
    }

    /// Overwrites one stored version in place; returns the previous value.
    pub fn put(&self, key: FeatureKey, desc: SystemDesc) -> Result<SystemDesc, DatastoreError> {
        self.db.execute_transaction(|tx| tx.put_system(key, desc))
    }

    pub fn get(&self, key: FeatureKey) -> Result<Option<SystemDesc>, DatastoreError> {
        let conn = self.db.core().reader()?;
        TABLE.get(&conn, key)
    }

    pub fn uid_to_id(&self, uid: &str) -> Result<Option<InternalId>, DatastoreError> {
        let conn = self.db.core().reader()?;
        TABLE.uid_to_id(&conn, uid)
    }

    /// The version whose validity interval contains the wall clock, else
    /// the nearest one (earlier preferred).
    pub fn current_version(
        &self,
        id: InternalId,
    ) -> Result<Option<(FeatureKey, SystemDesc)>, DatastoreError> {
        let conn = self.db.core().reader()?;
        TABLE.current_version(&conn, id, Timestamp::now())
    }

    pub fn current_version_by_uid(
        &self,
        uid: &str,
    ) -> Result<Option<(FeatureKey, SystemDesc)>, DatastoreError> {
        let conn = self.db.core().reader()?;
        match TABLE.uid_to_id(&conn, uid)? {
            Some(id) => TABLE.current_version(&conn, id, Timestamp::now()),
            None => Ok(None),
        }
    }

    /// All versions of one system, ascending by valid time.
    pub fn history(&self, id: InternalId) -> Result<Vec<(FeatureKey, SystemDesc)>, DatastoreError> {
        let conn = self.db.core().reader()?;
        TABLE.versions(&conn, id)
    }

    /// Lazy entry stream in internal-ID-then-valid-time order. Drop the
    /// iterator to release its read snapshot.
    pub fn select_entries(&self, filter: &SystemFilter) -> Result<SystemEntries, DatastoreError> {
        entries(self.db.core(), filter)
    }

    pub fn count_matching(&self, filter: &SystemFilter) -> Result<u64, DatastoreError> {
        let mut n = 0u64;
        for entry in self.select_entries(filter)? {
            entry?;
            n += 1;
        }
        Ok(n)
    }

    /// Removes every version matched by the filter; returns the count.
    pub fn remove_entries(&self, filter: &SystemFilter) -> Result<u64, DatastoreError> {
        let keys: Vec<FeatureKey> = self
            .select_entries(filter)?
            .map(|r| r.map(|(k, _)| k))
            .collect::<Result<_, _>>()?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.db.execute_transaction(|tx| {
            let mut removed = 0u64;
            for key in keys {
                if tx.remove_system_version(key)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }
}
