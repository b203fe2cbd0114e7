//! Storage strategy dispatch
//!
//! Both strategies expose the same operations; the table picks one at
//! creation and keeps it for its open lifetime.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::crypto::Cipher;
use crate::error::{AtlasError, Result};
use crate::row::{Row, RowPosition, Schema};
use crate::storage::{
    transpose, AppendStore, AppendStoreStats, AppendUndo, ColumnarSnapshot, FlushReport,
    PageStore, PageStoreStats, PageUndo,
};
use crate::wal::LogOperation;

use super::{StorageStrategy, TableDescriptor};

/// Store counters, by strategy
#[derive(Debug, Clone)]
pub enum StoreStats {
    Paged(PageStoreStats),
    Append(AppendStoreStats),
}

/// A detached unit, by strategy
#[derive(Debug)]
pub(crate) enum StoreUndo {
    Paged(PageUndo),
    Append(AppendUndo),
}

/// The store bound to a table
#[derive(Debug)]
pub(crate) enum TableStore {
    Paged(PageStore),
    Append(AppendStore),
}

impl TableStore {
    /// File holding a table's rows under `dir`
    pub fn path_for(dir: &Path, descriptor: &TableDescriptor) -> PathBuf {
        let ext = match descriptor.strategy {
            StorageStrategy::PageBased => "pages",
            StorageStrategy::AppendOnly | StorageStrategy::Columnar => "append",
        };
        dir.join(format!("{}.{}", descriptor.name, ext))
    }

    pub fn create(
        dir: &Path,
        descriptor: &TableDescriptor,
        config: &Config,
        cipher: Option<Arc<dyn Cipher>>,
    ) -> Result<Self> {
        let path = Self::path_for(dir, descriptor);
        let schema = descriptor.schema.clone();
        Ok(match descriptor.strategy {
            StorageStrategy::PageBased => TableStore::Paged(PageStore::create(
                &path,
                &descriptor.name,
                schema,
                config.page_size,
                config.page_cache_capacity,
                cipher,
            )?),
            strategy => TableStore::Append(AppendStore::create(
                &path,
                &descriptor.name,
                schema,
                strategy == StorageStrategy::Columnar,
                cipher,
            )?),
        })
    }

    pub fn open(
        dir: &Path,
        descriptor: &TableDescriptor,
        config: &Config,
        cipher: Option<Arc<dyn Cipher>>,
    ) -> Result<Self> {
        let path = Self::path_for(dir, descriptor);
        let schema = descriptor.schema.clone();
        Ok(match descriptor.strategy {
            StorageStrategy::PageBased => TableStore::Paged(PageStore::open(
                &path,
                schema,
                config.page_cache_capacity,
                cipher,
            )?),
            strategy => TableStore::Append(AppendStore::open(
                &path,
                &descriptor.name,
                schema,
                strategy == StorageStrategy::Columnar,
                cipher,
            )?),
        })
    }

    pub fn schema(&self) -> &Schema {
        match self {
            TableStore::Paged(store) => store.schema(),
            TableStore::Append(store) => store.schema(),
        }
    }

    /// Reject rows the store cannot hold before anything is mutated
    pub fn check_row(&self, row: &Row) -> Result<()> {
        match self {
            TableStore::Paged(store) => store.encode(row).map(|_| ()),
            TableStore::Append(_) => Ok(()),
        }
    }

    pub fn insert(&mut self, row: &Row) -> Result<RowPosition> {
        match self {
            TableStore::Paged(store) => store.insert(row),
            TableStore::Append(store) => Ok(store.append(row.clone())),
        }
    }

    pub fn update(&mut self, position: RowPosition, row: &Row) -> Result<RowPosition> {
        match self {
            TableStore::Paged(store) => store.update(position, row),
            TableStore::Append(store) => store.update(position, row.clone()),
        }
    }

    pub fn delete(&mut self, position: RowPosition) -> Result<Row> {
        match self {
            TableStore::Paged(store) => store.delete(position),
            TableStore::Append(store) => store.delete(position),
        }
    }

    pub fn get(&self, position: RowPosition) -> Result<Option<Row>> {
        match self {
            TableStore::Paged(store) => store.get(position),
            TableStore::Append(store) => Ok(store.get(position).cloned()),
        }
    }

    pub fn scan(&self) -> Result<Vec<(RowPosition, Row)>> {
        match self {
            TableStore::Paged(store) => store.scan(),
            TableStore::Append(store) => Ok(store.scan()),
        }
    }

    /// Rows on undamaged pages; only a page store can have damaged pages
    pub fn scan_intact(&self) -> Result<Vec<(RowPosition, Row)>> {
        match self {
            TableStore::Paged(store) => store.scan_intact(),
            TableStore::Append(store) => Ok(store.scan()),
        }
    }

    pub fn damaged_pages(&self) -> Vec<u32> {
        match self {
            TableStore::Paged(store) => store.damaged_pages(),
            TableStore::Append(_) => Vec::new(),
        }
    }

    pub fn snapshot(&self) -> Result<Arc<ColumnarSnapshot>> {
        match self {
            TableStore::Paged(store) => Ok(Arc::new(transpose(store.schema(), &store.scan()?))),
            TableStore::Append(store) => Ok(store.snapshot()),
        }
    }

    pub fn live_rows(&self) -> u64 {
        match self {
            TableStore::Paged(store) => store.live_rows(),
            TableStore::Append(store) => store.live_rows(),
        }
    }

    pub fn mutation_seq(&self) -> u64 {
        match self {
            TableStore::Paged(store) => store.mutation_seq(),
            TableStore::Append(store) => store.mutation_seq(),
        }
    }

    // =========================================================================
    // Units
    // =========================================================================

    pub fn begin_unit(&mut self) -> Result<()> {
        match self {
            TableStore::Paged(store) => store.begin_unit(),
            TableStore::Append(store) => store.begin_unit(),
        }
    }

    /// Open the unit of a batch
    ///
    /// A page store then spills instead of pinning; an append store keeps
    /// its staged entries in memory either way.
    pub fn begin_batch_unit(&mut self) -> Result<()> {
        match self {
            TableStore::Paged(store) => store.begin_batch_unit(),
            TableStore::Append(store) => store.begin_unit(),
        }
    }

    pub fn in_unit(&self) -> bool {
        match self {
            TableStore::Paged(store) => store.in_unit(),
            TableStore::Append(store) => store.in_unit(),
        }
    }

    pub fn detach_unit(&mut self) -> Option<StoreUndo> {
        match self {
            TableStore::Paged(store) => store.detach_unit().map(StoreUndo::Paged),
            TableStore::Append(store) => store.detach_unit().map(StoreUndo::Append),
        }
    }

    /// Publish a detached unit; returns the pages it touched
    pub fn finish_unit(&mut self, undo: StoreUndo, commit_lsn: Option<u64>) -> Result<Vec<u32>> {
        match (self, undo) {
            (TableStore::Paged(store), StoreUndo::Paged(undo)) => {
                store.finish_unit(undo, commit_lsn)
            }
            (TableStore::Append(store), StoreUndo::Append(undo)) => {
                store.finish_unit(undo);
                Ok(Vec::new())
            }
            _ => Err(AtlasError::BatchState(
                "unit detached from a different kind of store".to_string(),
            )),
        }
    }

    pub fn undo_unit(&mut self, undo: StoreUndo) {
        match (self, undo) {
            (TableStore::Paged(store), StoreUndo::Paged(undo)) => store.undo_unit(undo),
            (TableStore::Append(store), StoreUndo::Append(undo)) => store.undo_unit(undo),
            _ => {}
        }
    }

    /// Publish the open unit; returns the pages it touched
    pub fn commit_unit(&mut self, commit_lsn: Option<u64>) -> Result<Vec<u32>> {
        match self {
            TableStore::Paged(store) => store.commit_unit(commit_lsn),
            TableStore::Append(store) => {
                store.commit_unit();
                Ok(Vec::new())
            }
        }
    }

    pub fn rollback_unit(&mut self) {
        match self {
            TableStore::Paged(store) => store.rollback_unit(),
            TableStore::Append(store) => store.rollback_unit(),
        }
    }

    // =========================================================================
    // Flush & recovery
    // =========================================================================

    /// Flush what a committed unit touched
    pub fn flush_touched(&mut self, pages: &[u32]) -> Result<FlushReport> {
        match self {
            TableStore::Paged(store) => store.flush_pages(pages),
            TableStore::Append(store) => store.flush(),
        }
    }

    pub fn flush(&mut self) -> Result<FlushReport> {
        match self {
            TableStore::Paged(store) => store.flush(),
            TableStore::Append(store) => store.flush(),
        }
    }

    pub fn redo(&mut self, op: &LogOperation, lsn: u64) -> Result<bool> {
        match self {
            TableStore::Paged(store) => store.redo(op, lsn),
            TableStore::Append(store) => store.redo(op, lsn),
        }
    }

    pub fn stats(&self) -> StoreStats {
        match self {
            TableStore::Paged(store) => StoreStats::Paged(store.stats()),
            TableStore::Append(store) => StoreStats::Append(store.stats()),
        }
    }
}
