//! Engine Module
//!
//! Database-scoped owner of the WAL, the catalog and every open table.
//!
//! ## Responsibilities
//! - Recover the WAL and replay committed submissions into the stores
//! - Open, create, close and drop tables
//! - Checkpoint: flush every store, then truncate the WAL
//!
//! ## Directory Layout
//! ```text
//! {data_dir}/
//!   ├── wal.log
//!   ├── catalog.bin
//!   └── tables/
//!         ├── orders.pages     (page-based)
//!         └── events.append    (append-only / columnar)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::crypto::{AesGcmCipher, Cipher};
use crate::error::{AtlasError, Result};
use crate::storage::SpillFile;
use crate::table::{Catalog, Table, TableDescriptor, TableStore};
use crate::wal::{GroupCommitConfig, GroupCommitter, LogOperation, RecoveryResult, WalRecovery, WalWriter};

/// Outcome of replaying the WAL on open
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    pub recovery: RecoveryResult,
    /// Committed operations found in the log
    pub operations: u64,
    /// Operations that changed a store
    pub applied: u64,
    /// Operations for tables no longer in the catalog
    pub skipped: u64,
    /// Operations aimed at pages that were damaged on disk
    pub unrecoverable: u64,
}

/// The embedded database
///
/// ## Concurrency Model
///
/// - Each table serializes its own writers; tables do not block each other
/// - All tables share one WAL, so concurrent commits across tables are
///   grouped into the same flushes
/// - `checkpoint` locks every open table once its submitted statements have
///   resolved, so no submission is in flight while the log is truncated
pub struct Engine {
    config: Config,
    tables_dir: PathBuf,
    cipher: Option<Arc<dyn Cipher>>,
    wal: Arc<GroupCommitter>,
    catalog: Mutex<Catalog>,
    /// Dropped tables whose records the log may still hold
    dropped: Mutex<BTreeSet<String>>,
    tables: RwLock<BTreeMap<String, Arc<Table>>>,
    replay: ReplayReport,
}

impl Engine {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const WAL_FILENAME: &'static str = "wal.log";
    const CATALOG_FILENAME: &'static str = "catalog.bin";
    const TABLES_DIR: &'static str = "tables";

    /// Open or create a database with the given config
    ///
    /// On startup:
    /// 1. Validate the config and create directories
    /// 2. Recover the WAL (torn tail and uncommitted data truncated)
    /// 3. Load the catalog and open every table's store
    /// 4. Replay committed operations in LSN order
    /// 5. Build indexes, flush the stores and checkpoint the WAL
    pub fn open(config: Config) -> Result<Self> {
        // Step 1: Directories
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        let tables_dir = config.data_dir.join(Self::TABLES_DIR);
        fs::create_dir_all(&tables_dir)?;
        let wal_path = config.data_dir.join(Self::WAL_FILENAME);

        let cipher: Option<Arc<dyn Cipher>> = match &config.encryption_key {
            Some(key) => Some(Arc::new(AesGcmCipher::new(key)?)),
            None => None,
        };

        // Step 2: WAL recovery
        let (commits, recovery) = if wal_path.exists() {
            WalRecovery::recover(&wal_path)?
        } else {
            (Vec::new(), RecoveryResult::default())
        };

        // Step 3: Catalog and stores
        let catalog = Catalog::load(&config.data_dir.join(Self::CATALOG_FILENAME))?;
        let mut stores = BTreeMap::new();
        for descriptor in catalog.descriptors() {
            let store = TableStore::open(&tables_dir, descriptor, &config, cipher.clone())?;
            stores.insert(descriptor.name.clone(), store);
        }

        // Step 4: Replay
        let mut replay = ReplayReport {
            recovery: recovery.clone(),
            ..Default::default()
        };
        for commit in &commits {
            for record in &commit.records {
                let payload = match &cipher {
                    Some(cipher) => cipher.decrypt(&record.payload)?,
                    None => record.payload.clone(),
                };
                let op = LogOperation::decode(&payload)?;
                replay.operations += 1;
                match stores.get_mut(op.table()) {
                    Some(store) => match store.redo(&op, record.lsn) {
                        Ok(true) => replay.applied += 1,
                        Ok(false) => {}
                        Err(e @ AtlasError::StorageCorruption { .. }) => {
                            error!(table = op.table(), lsn = record.lsn, error = %e, "Cannot replay onto damaged page");
                            replay.unrecoverable += 1;
                        }
                        Err(e) => return Err(e),
                    },
                    None => replay.skipped += 1,
                }
            }
        }
        if replay.operations > 0 {
            info!(
                operations = replay.operations,
                applied = replay.applied,
                skipped = replay.skipped,
                unrecoverable = replay.unrecoverable,
                "Replayed WAL"
            );
        }

        // Step 5: Start the log at the recovered LSN
        let start_lsn = recovery.next_lsn.max(1);
        let writer = if wal_path.exists() {
            WalWriter::open(&wal_path, start_lsn, cipher.clone())?
        } else {
            WalWriter::create(&wal_path, start_lsn, cipher.clone())?
        };
        let wal = Arc::new(GroupCommitter::start(writer, GroupCommitConfig::from(&config))?);

        let mut tables = BTreeMap::new();
        for (name, mut store) in stores {
            store.flush()?;
            let descriptor = catalog
                .get(&name)
                .cloned()
                .ok_or_else(|| AtlasError::TableNotFound(name.clone()))?;
            let table = Table::open(descriptor, store, config.hash_index_enabled, Arc::clone(&wal))?;
            tables.insert(name, Arc::new(table));
        }
        wal.checkpoint()?;

        info!(
            data_dir = %config.data_dir.display(),
            tables = tables.len(),
            next_lsn = start_lsn,
            encrypted = cipher.is_some(),
            "Opened engine"
        );

        Ok(Self {
            config,
            tables_dir,
            cipher,
            wal,
            catalog: Mutex::new(catalog),
            dropped: Mutex::new(BTreeSet::new()),
            tables: RwLock::new(tables),
            replay,
        })
    }

    // =========================================================================
    // Tables
    // =========================================================================

    /// Create a table and open it
    pub fn create_table(&self, descriptor: TableDescriptor) -> Result<Arc<Table>> {
        descriptor.validate()?;
        if self.dropped.lock().contains(&descriptor.name) {
            // Records of the dropped table must not replay into the new one
            self.checkpoint()?;
        }
        let mut catalog = self.catalog.lock();
        if catalog.contains(&descriptor.name) {
            return Err(AtlasError::TableExists(descriptor.name));
        }

        let store = TableStore::create(&self.tables_dir, &descriptor, &self.config, self.cipher.clone())?;
        catalog.insert(descriptor.clone());
        if let Err(e) = catalog.save() {
            catalog.remove(&descriptor.name);
            let _ = fs::remove_file(TableStore::path_for(&self.tables_dir, &descriptor));
            return Err(e);
        }

        let name = descriptor.name.clone();
        let table = Arc::new(Table::open(
            descriptor,
            store,
            self.config.hash_index_enabled,
            Arc::clone(&self.wal),
        )?);
        self.tables.write().insert(name.clone(), Arc::clone(&table));
        info!(table = %name, "Created table");
        Ok(table)
    }

    /// Handle to an open table
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        if let Some(table) = self.tables.read().get(name) {
            return Ok(Arc::clone(table));
        }
        if self.catalog.lock().contains(name) {
            return Err(AtlasError::TableClosed(name.to_string()));
        }
        Err(AtlasError::TableNotFound(name.to_string()))
    }

    /// Open a cataloged table that was closed
    pub fn open_table(&self, name: &str) -> Result<Arc<Table>> {
        let catalog = self.catalog.lock();
        let mut tables = self.tables.write();
        if let Some(table) = tables.get(name) {
            return Ok(Arc::clone(table));
        }
        let descriptor = catalog
            .get(name)
            .cloned()
            .ok_or_else(|| AtlasError::TableNotFound(name.to_string()))?;

        let store = TableStore::open(&self.tables_dir, &descriptor, &self.config, self.cipher.clone())?;
        let table = Arc::new(Table::open(
            descriptor,
            store,
            self.config.hash_index_enabled,
            Arc::clone(&self.wal),
        )?);
        tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// Flush and detach a table; it stays in the catalog
    pub fn close_table(&self, name: &str) -> Result<()> {
        let table = self
            .tables
            .write()
            .remove(name)
            .ok_or_else(|| AtlasError::TableNotFound(name.to_string()))?;
        table.close()
    }

    /// Remove a table from the catalog and delete its file
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let mut catalog = self.catalog.lock();
        let descriptor = catalog
            .remove(name)
            .ok_or_else(|| AtlasError::TableNotFound(name.to_string()))?;
        if let Err(e) = catalog.save() {
            catalog.insert(descriptor);
            return Err(e);
        }
        drop(catalog);

        if let Some(table) = self.tables.write().remove(name) {
            if let Err(e) = table.close() {
                warn!(table = name, error = %e, "Flush before drop failed");
            }
        }
        let path = TableStore::path_for(&self.tables_dir, &descriptor);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let spill = SpillFile::path_for(&path);
        if spill.exists() {
            fs::remove_file(&spill)?;
        }
        info!(table = name, "Dropped table");

        // The drop is already durable; a later checkpoint truncates its records
        if let Err(e) = self.checkpoint() {
            warn!(table = name, error = %e, "Checkpoint after drop deferred");
            self.dropped.lock().insert(name.to_string());
        }
        Ok(())
    }

    /// Names of every cataloged table
    pub fn table_names(&self) -> Vec<String> {
        self.catalog.lock().names().map(str::to_string).collect()
    }

    // =========================================================================
    // Durability
    // =========================================================================

    /// Flush every open table, then truncate the WAL
    ///
    /// Refused while any table has an open batch. Returns the LSN the new log
    /// starts at.
    pub fn checkpoint(&self) -> Result<u64> {
        let tables = self.tables.read();
        let mut guards: Vec<_> = tables.iter().map(|(name, t)| (name, t.lock())).collect();

        for (name, inner) in guards.iter_mut() {
            if inner.is_open() {
                inner.flush(name.as_str())?;
            }
        }
        let start_lsn = self.wal.checkpoint()?;
        drop(guards);
        self.dropped.lock().clear();

        info!(start_lsn, tables = tables.len(), "Checkpoint complete");
        Ok(start_lsn)
    }

    /// Checkpoint, close every table and stop the WAL worker
    pub fn close(self) -> Result<()> {
        self.checkpoint()?;
        for table in self.tables.read().values() {
            table.close()?;
        }
        self.wal.close();
        info!(data_dir = %self.config.data_dir.display(), "Closed engine");
        Ok(())
    }

    /// Stop without flushing any table, as a crash would
    #[doc(hidden)]
    pub fn crash(self) {
        self.wal.close();
        warn!(data_dir = %self.config.data_dir.display(), "Simulated crash");
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn wal(&self) -> &GroupCommitter {
        &self.wal
    }

    /// What recovery found when this engine was opened
    pub fn replay_report(&self) -> &ReplayReport {
        &self.replay
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.config.data_dir)
            .field("tables", &self.tables.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
