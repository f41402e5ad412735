//! The `ObsDatabase` facade.
//!
//! One facade owns one SQLite file: a single writer connection that every
//! mutation serialises through, a pool of readers that see committed
//! snapshots, the ID sequences, and the auto-checkpoint thread. The four
//! stores are lightweight views over the facade.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use sonde_db::{create_pool, open_writer, run_migrations, DbPool, DbRuntimeSettings, IdSequence};
use sonde_types::{FeatureDesc, InternalId, ObsData, RecordEncoding, SystemDesc, Timestamp};

use crate::datastreams::{self, StreamRegistration, StreamUpdate};
use crate::error::DatastoreError;
use crate::features::FeatureKey;
use crate::fois::FoiStore;
use crate::obs::{self, ObsKey, ObsStore};
use crate::systems::SystemStore;
use crate::DataStreamStore;

/// Configuration of one observation database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file.
    pub storage_path: String,
    /// Registration key of this database; scopes external ID scrambling.
    pub database_num: u32,
    pub read_only: bool,
    /// Page cache budget in bytes; 0 keeps the engine default.
    pub memory_cache_size: u64,
    /// Dirty-byte threshold that triggers an auto-checkpoint.
    pub auto_commit_buffer_size: u64,
    /// Elapsed-time trigger for auto-checkpoints.
    pub auto_commit_period: Duration,
    pub busy_timeout_ms: u32,
    pub pool_max_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            storage_path: "sonde-obs.db".to_string(),
            database_num: 1,
            read_only: false,
            memory_cache_size: 0,
            auto_commit_buffer_size: 4 * 1024 * 1024,
            auto_commit_period: Duration::from_secs(10),
            busy_timeout_ms: 5000,
            pool_max_size: 8,
        }
    }
}

pub(crate) struct DbCore {
    pub pool: DbPool,
    pub writer: Mutex<Connection>,
    pub read_only: bool,
    pub database_num: u32,
    pub seq_systems: IdSequence,
    pub seq_fois: IdSequence,
    pub seq_datastreams: IdSequence,
    pub seq_series: IdSequence,
    dirty_bytes: AtomicU64,
    auto_commit_buffer_size: u64,
    auto_commit_period: Duration,
    last_commit: Mutex<Instant>,
}

impl DbCore {
    pub(crate) fn reader(
        &self,
    ) -> Result<PooledConnection<SqliteConnectionManager>, DatastoreError> {
        Ok(self.pool.get().map_err(sonde_db::DbError::from)?)
    }

    /// Flushes the write-ahead log into the main file and resets the
    /// auto-commit triggers.
    fn checkpoint(&self) -> Result<(), DatastoreError> {
        let writer = self.writer.lock().expect("writer lock poisoned");
        // wal_checkpoint returns (busy, wal pages, checkpointed pages).
        writer
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(sonde_db::DbError::from)?;
        self.dirty_bytes.store(0, Ordering::Relaxed);
        *self.last_commit.lock().expect("last_commit lock poisoned") = Instant::now();
        Ok(())
    }

    fn checkpoint_if_due(&self) -> Result<bool, DatastoreError> {
        let dirty = self.dirty_bytes.load(Ordering::Relaxed);
        let elapsed = self
            .last_commit
            .lock()
            .expect("last_commit lock poisoned")
            .elapsed();
        if dirty >= self.auto_commit_buffer_size
            || (dirty > 0 && elapsed >= self.auto_commit_period)
        {
            self.checkpoint()?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Mutating operations available inside one facade transaction.
///
/// All writes performed through a scope commit together when the closure
/// returns `Ok` and roll back together on `Err` or after an explicit
/// [`TxScope::rollback`].
pub struct TxScope<'a> {
    pub(crate) tx: Transaction<'a>,
    pub(crate) core: &'a DbCore,
    pub(crate) dirty: usize,
    rolled_back: bool,
}

impl TxScope<'_> {
    /// Abandons every write performed in this scope. The enclosing
    /// `execute_transaction` still returns the closure's value.
    pub fn rollback(&mut self) {
        self.rolled_back = true;
    }

    pub fn add_system(&mut self, desc: SystemDesc) -> Result<FeatureKey, DatastoreError> {
        let TxScope { tx, core, dirty, .. } = self;
        crate::systems::TABLE.add(tx, &core.seq_systems, desc, dirty)
    }

    pub fn add_system_version(&mut self, desc: SystemDesc) -> Result<FeatureKey, DatastoreError> {
        let TxScope { tx, dirty, .. } = self;
        crate::systems::TABLE.add_version(tx, desc, dirty)
    }

    pub fn put_system(
        &mut self,
        key: FeatureKey,
        desc: SystemDesc,
    ) -> Result<SystemDesc, DatastoreError> {
        let TxScope { tx, dirty, .. } = self;
        crate::systems::TABLE.put(tx, key, desc, dirty)
    }

    pub fn remove_system_version(&mut self, key: FeatureKey) -> Result<bool, DatastoreError> {
        crate::systems::TABLE.remove_version(&self.tx, key)
    }

    pub fn add_foi(&mut self, desc: FeatureDesc) -> Result<FeatureKey, DatastoreError> {
        let TxScope { tx, core, dirty, .. } = self;
        crate::fois::TABLE.add(tx, &core.seq_fois, desc, dirty)
    }

    pub fn add_foi_version(&mut self, desc: FeatureDesc) -> Result<FeatureKey, DatastoreError> {
        let TxScope { tx, dirty, .. } = self;
        crate::fois::TABLE.add_version(tx, desc, dirty)
    }

    pub fn put_foi(
        &mut self,
        key: FeatureKey,
        desc: FeatureDesc,
    ) -> Result<FeatureDesc, DatastoreError> {
        let TxScope { tx, dirty, .. } = self;
        crate::fois::TABLE.put(tx, key, desc, dirty)
    }

    pub fn remove_foi_version(&mut self, key: FeatureKey) -> Result<bool, DatastoreError> {
        crate::fois::TABLE.remove_version(&self.tx, key)
    }

    pub fn add_data_stream(
        &mut self,
        info: sonde_types::DataStreamInfo,
    ) -> Result<InternalId, DatastoreError> {
        let TxScope { tx, core, dirty, .. } = self;
        datastreams::add_in(tx, core, info, dirty)
    }

    pub fn update_data_stream(
        &mut self,
        id: InternalId,
        info: sonde_types::DataStreamInfo,
    ) -> Result<StreamUpdate, DatastoreError> {
        let TxScope { tx, core, dirty, .. } = self;
        datastreams::update_in(tx, core, id, info, dirty)
    }

    /// Resolves or creates the stream for one producer output; see the
    /// compatibility rules on [`datastreams::register_in`].
    pub fn register_output(
        &mut self,
        system_id: InternalId,
        output_name: &str,
        schema: sonde_types::DataComponent,
        encoding: RecordEncoding,
    ) -> Result<StreamRegistration, DatastoreError> {
        let TxScope { tx, core, dirty, .. } = self;
        datastreams::register_in(tx, core, system_id, output_name, schema, encoding, dirty)
    }

    pub fn remove_data_stream(&mut self, id: InternalId) -> Result<bool, DatastoreError> {
        datastreams::remove_in(&self.tx, id)
    }

    pub fn add_obs(&mut self, data: ObsData) -> Result<ObsKey, DatastoreError> {
        let TxScope { tx, core, dirty, .. } = self;
        obs::add_in(tx, core, data, dirty)
    }

    pub fn put_obs(&mut self, key: ObsKey, data: ObsData) -> Result<(), DatastoreError> {
        let TxScope { tx, dirty, .. } = self;
        obs::put_in(tx, key, data, dirty)
    }

    pub fn remove_obs(&mut self, key: ObsKey) -> Result<bool, DatastoreError> {
        obs::remove_in(&self.tx, key)
    }
}

/// The observation database: four stores behind one transactional
/// boundary.
pub struct ObsDatabase {
    core: Arc<DbCore>,
    stop_tx: Option<mpsc::Sender<()>>,
    autocommit: Option<thread::JoinHandle<()>>,
}

impl ObsDatabase {
    /// Opens (and on first use initialises) the database file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened, migrations cannot run, or a
    /// read-only database has never been initialised.
    pub fn open(config: &DatabaseConfig) -> Result<Self, DatastoreError> {
        let settings = DbRuntimeSettings {
            busy_timeout_ms: config.busy_timeout_ms,
            pool_max_size: config.pool_max_size,
            memory_cache_size: config.memory_cache_size,
            read_only: config.read_only,
        };

        let writer = open_writer(&config.storage_path, settings)?;
        if !config.read_only {
            let applied = run_migrations(&writer)
                .map_err(|e| DatastoreError::Init(e.to_string()))?;
            if applied > 0 {
                tracing::info!(
                    count = applied,
                    path = %config.storage_path,
                    "applied database migrations"
                );
            }
        }

        let seq_systems = IdSequence::load(&writer, "systems")?;
        let seq_fois = IdSequence::load(&writer, "fois")?;
        let seq_datastreams = IdSequence::load(&writer, "datastreams")?;
        let seq_series = IdSequence::load(&writer, "series")?;

        let pool = create_pool(&config.storage_path, settings)?;

        let core = Arc::new(DbCore {
            pool,
            writer: Mutex::new(writer),
            read_only: config.read_only,
            database_num: config.database_num,
            seq_systems,
            seq_fois,
            seq_datastreams,
            seq_series,
            dirty_bytes: AtomicU64::new(0),
            auto_commit_buffer_size: config.auto_commit_buffer_size,
            auto_commit_period: config.auto_commit_period,
            last_commit: Mutex::new(Instant::now()),
        });

        let (stop_tx, autocommit) = if config.read_only {
            (None, None)
        } else {
            let (tx, rx) = mpsc::channel::<()>();
            let thread_core = Arc::clone(&core);
            // Poll faster than the commit period so the dirty-byte trigger
            // fires promptly too.
            let tick = config.auto_commit_period.min(Duration::from_secs(1));
            let handle = thread::Builder::new()
                .name("sonde-autocommit".to_string())
                .spawn(move || loop {
                    match rx.recv_timeout(tick) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            if let Err(e) = thread_core.checkpoint_if_due() {
                                tracing::error!(error = %e, "auto-checkpoint failed");
                            }
                        }
                        _ => {
                            if let Err(e) = thread_core.checkpoint() {
                                tracing::error!(error = %e, "final checkpoint failed");
                            }
                            return;
                        }
                    }
                })
                .expect("failed to spawn autocommit thread");
            (Some(tx), Some(handle))
        };

        Ok(ObsDatabase {
            core,
            stop_tx,
            autocommit,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.core.read_only
    }

    pub fn database_num(&self) -> u32 {
        self.core.database_num
    }

    pub fn systems(&self) -> SystemStore<'_> {
        SystemStore { db: self }
    }

    pub fn fois(&self) -> FoiStore<'_> {
        FoiStore { db: self }
    }

    pub fn data_streams(&self) -> DataStreamStore<'_> {
        DataStreamStore { db: self }
    }

    pub fn observations(&self) -> ObsStore<'_> {
        ObsStore { db: self }
    }

    pub(crate) fn core(&self) -> &DbCore {
        &self.core
    }

    /// Runs `f` inside one write transaction. On `Ok` the writes commit
    /// and become visible to subsequent reads; on `Err` (or after
    /// [`TxScope::rollback`]) the database reverts to its state at entry.
    pub fn execute_transaction<T>(
        &self,
        f: impl FnOnce(&mut TxScope<'_>) -> Result<T, DatastoreError>,
    ) -> Result<T, DatastoreError> {
        if self.core.read_only {
            return Err(DatastoreError::ReadOnly);
        }
        let mut guard = self.core.writer.lock().expect("writer lock poisoned");
        let tx = guard
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sonde_db::DbError::from)?;
        let mut scope = TxScope {
            tx,
            core: &self.core,
            dirty: 0,
            rolled_back: false,
        };
        let result = f(&mut scope);
        let TxScope {
            tx,
            dirty,
            rolled_back,
            ..
        } = scope;
        match result {
            Ok(value) if !rolled_back => {
                tx.commit().map_err(sonde_db::DbError::from)?;
                self.core.dirty_bytes.fetch_add(dirty as u64, Ordering::Relaxed);
                Ok(value)
            }
            Ok(value) => {
                tx.rollback().map_err(sonde_db::DbError::from)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback() {
                    tracing::error!(error = %rb, "transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Forces a durability flush of everything committed so far.
    pub fn commit(&self) -> Result<(), DatastoreError> {
        if self.core.read_only {
            return Err(DatastoreError::ReadOnly);
        }
        self.core.checkpoint()
    }

    /// Removes observations with phenomenon time strictly before `cutoff`
    /// and prunes series left empty. Returns the number removed.
    pub fn purge_observations_before(&self, cutoff: Timestamp) -> Result<u64, DatastoreError> {
        obs::purge_before(self, cutoff)
    }
}

impl Drop for ObsDatabase {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.autocommit.take() {
            let _ = handle.join();
        }
    }
}
