//! The feature-of-interest store.

use std::collections::BTreeSet;

use sonde_db::MapDef;
use sonde_types::{FeatureDesc, InternalId, Timestamp};

use crate::database::{DbCore, ObsDatabase};
use crate::error::DatastoreError;
use crate::features::{Abort, FeatureEntries, FeatureKey, FeatureSelect, FeatureTable};
use crate::filter::{FoiFilter, TemporalFilter};

pub(crate) const TABLE: FeatureTable<FeatureDesc> =
    FeatureTable::new(MapDef::new("kv_fois"), MapDef::new("kv_fois_uid"));

pub struct FoiSelect {
    filter: FoiFilter,
}

impl FeatureSelect<FeatureDesc> for FoiSelect {
    fn temporal(&self) -> &TemporalFilter {
        &self.filter.valid_time
    }

    fn test_value(&self, value: &FeatureDesc) -> bool {
        self.filter.test(value)
    }

    fn limit(&self) -> Option<usize> {
        self.filter.limit
    }
}

/// Lazy FOI entry stream.
pub type FoiEntries = FeatureEntries<FeatureDesc, FoiSelect>;

pub(crate) fn entries(core: &DbCore, filter: &FoiFilter) -> Result<FoiEntries, DatastoreError> {
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
        Ok(ids)
    })();

    let select = FoiSelect {
        filter: filter.clone(),
    };
    match resolved {
        Ok(ids) => Ok(FeatureEntries::new(TABLE, conn, ids, select, now)),
        Err(Abort::Empty) => Ok(FeatureEntries::empty(TABLE, conn, select)),
        Err(Abort::Failed(e)) => Err(e),
    }
}

/// Distinct internal IDs of FOIs matching the filter.
pub(crate) fn collect_ids(
    core: &DbCore,
    filter: &FoiFilter,
) -> Result<BTreeSet<InternalId>, DatastoreError> {
    let mut ids = BTreeSet::new();
    for entry in entries(core, filter)? {
        let (key, _) = entry?;
        ids.insert(key.internal_id);
    }
    Ok(ids)
}

/// The FOI store view.
pub struct FoiStore<'a> {
    pub(crate) db: &'a ObsDatabase,
}

impl FoiStore<'_> {
    pub fn add(&self, desc: FeatureDesc) -> Result<FeatureKey, DatastoreError> {
        self.db.execute_transaction(|tx| tx.add_foi(desc))
    }

    pub fn add_version(&self, desc: FeatureDesc) -> Result<FeatureKey, DatastoreError> {
        self.db.execute_transaction(|tx| tx.add_foi_version(desc))
    }

    pub fn put(&self, key: FeatureKey, desc: FeatureDesc) -> Result<FeatureDesc, DatastoreError> {
        self.db.execute_transaction(|tx| tx.put_foi(key, desc))
    }

    pub fn get(&self, key: FeatureKey) -> Result<Option<FeatureDesc>, DatastoreError> {
        let conn = self.db.core().reader()?;
        TABLE.get(&conn, key)
    }

    pub fn uid_to_id(&self, uid: &str) -> Result<Option<InternalId>, DatastoreError> {
        let conn = self.db.core().reader()?;
        TABLE.uid_to_id(&conn, uid)
    }

    pub fn current_version(
        &self,
        id: InternalId,
    ) -> Result<Option<(FeatureKey, FeatureDesc)>, DatastoreError> {
        let conn = self.db.core().reader()?;
        TABLE.current_version(&conn, id, Timestamp::now())
    }

    pub fn current_version_by_uid(
        &self,
        uid: &str,
    ) -> Result<Option<(FeatureKey, FeatureDesc)>, DatastoreError> {
        let conn = self.db.core().reader()?;
        match TABLE.uid_to_id(&conn, uid)? {
            Some(id) => TABLE.current_version(&conn, id, Timestamp::now()),
            None => Ok(None),
        }
    }

    pub fn select_entries(&self, filter: &FoiFilter) -> Result<FoiEntries, DatastoreError> {
        entries(self.db.core(), filter)
    }

    pub fn count_matching(&self, filter: &FoiFilter) -> Result<u64, DatastoreError> {
        let mut n = 0u64;
        for entry in self.select_entries(filter)? {
            entry?;
            n += 1;
        }
        Ok(n)
    }

    pub fn remove_entries(&self, filter: &FoiFilter) -> Result<u64, DatastoreError> {
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
                if tx.remove_foi_version(key)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }
}
