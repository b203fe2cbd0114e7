//! Table coordinator
//!
//! ## Concurrency Model: Single-Writer / Multiple-Reader
//!
//! - **Writes** take the table's write lock to stage and submit, then
//!   release it while the submission is flushed, so writers to one table
//!   share WAL syncs
//! - **Reads** (select/get/lookup) take the read lock; cached page reads
//!   additionally take only the page cache's mutex
//!
//! ## Statements and Batches
//!
//! Outside a batch every statement is its own unit: it is staged in the store
//! and indexes, submitted to the WAL as one submission, and published or
//! rolled back depending on the outcome.
//!
//! ```text
//!   lock ─► settle ─► stage ─► submit ─► detach unit ─► unlock
//!                                                         │ wait
//!   lock ─► settle (publish oldest first, or undo) ◄──────┘
//! ```
//!
//! A submitted unit waits in the pending queue until its ticket resolves;
//! whoever next holds the lock publishes durable units in LSN order. A
//! failed submission fails every later one as well, so the failed tail of
//! the queue is undone newest first. Later statements see pending rows
//! before they are durable.
//!
//! Inside a batch the statements share one unit and their operations are
//! collected; `end_batch` submits them all as ONE submission and then flushes
//! each touched page once. A statement that fails its checks leaves the batch
//! intact; a failure after it started mutating aborts the whole batch.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

use crate::error::{AtlasError, Result};
use crate::index::{IndexJournal, IndexKey, IndexSet};
use crate::row::{Row, RowPosition, Value};
use crate::storage::{ColumnarSnapshot, FlushReport};
use crate::wal::{CommitTicket, GroupCommitter, LogOperation, TicketOutcome};

use super::store::StoreUndo;
use super::{Predicate, TableDescriptor, TableState, TableStats, TableStore};

/// Operations collected by an open batch
#[derive(Debug, Default)]
struct BatchState {
    ops: Vec<LogOperation>,
    statements: usize,
}

/// A statement whose submission is in flight
#[derive(Debug)]
struct PendingUnit {
    ticket: CommitTicket,
    store: StoreUndo,
    indexes: IndexJournal,
}

/// Mutable state behind the table lock
#[derive(Debug)]
pub(crate) struct TableInner {
    state: TableState,
    store: TableStore,
    indexes: IndexSet,
    batch: Option<BatchState>,
    /// Submitted statements, oldest first
    pending: VecDeque<PendingUnit>,
}

/// One open table: schema, storage strategy and indexes
pub struct Table {
    name: String,
    descriptor: TableDescriptor,
    wal: Arc<GroupCommitter>,
    inner: RwLock<TableInner>,
}

impl Table {
    /// Bind an opened store to its indexes, bulk-loading them from the rows
    pub(crate) fn open(
        descriptor: TableDescriptor,
        store: TableStore,
        hash_index_enabled: bool,
        wal: Arc<GroupCommitter>,
    ) -> Result<Self> {
        let mut indexes = IndexSet::new(
            &descriptor.name,
            &descriptor.schema,
            &descriptor.effective_indexes(),
            hash_index_enabled,
        )?;
        if !indexes.is_empty() {
            // Rows on damaged pages cannot be read, so they are left out
            let rows = store.scan_intact()?;
            indexes.rebuild(rows.iter().map(|(pos, row)| (*pos, row)))?;
        }

        info!(
            table = %descriptor.name,
            strategy = %descriptor.strategy,
            rows = store.live_rows(),
            indexes = indexes.len(),
            "Opened table"
        );

        Ok(Self {
            name: descriptor.name.clone(),
            descriptor,
            wal,
            inner: RwLock::new(TableInner {
                state: TableState::Open,
                store,
                indexes,
                batch: None,
                pending: VecDeque::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> TableState {
        self.inner.read().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == TableState::Open
    }

    pub fn in_batch(&self) -> bool {
        self.inner.read().batch.is_some()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert `row`, returning where it was stored
    pub fn insert(&self, row: Row) -> Result<RowPosition> {
        self.run(|inner, ops| inner.insert(&self.name, row, ops))
    }

    /// Replace the row at `position`
    ///
    /// Returns the row's position afterwards, which differs from `position`
    /// when the row had to move.
    pub fn update(&self, position: RowPosition, row: Row) -> Result<RowPosition> {
        self.run(|inner, ops| inner.update(&self.name, position, row, ops))
    }

    /// Rewrite every row matching `predicate` with `f`; returns the count
    pub fn update_where<F>(&self, predicate: &Predicate, f: F) -> Result<usize>
    where
        F: Fn(&Row) -> Row,
    {
        self.run(|inner, ops| {
            let matches = inner.select(&self.descriptor, predicate)?;
            for (position, row) in &matches {
                let new_row = f(row);
                inner.update(&self.name, *position, new_row, ops)?;
            }
            Ok(matches.len())
        })
    }

    /// Delete the row at `position`, returning it
    pub fn delete(&self, position: RowPosition) -> Result<Row> {
        self.run(|inner, ops| inner.delete(&self.name, position, ops))
    }

    /// Delete every row matching `predicate`; returns the count
    pub fn delete_where(&self, predicate: &Predicate) -> Result<usize> {
        self.run(|inner, ops| {
            let matches = inner.select(&self.descriptor, predicate)?;
            for (position, _) in &matches {
                inner.delete(&self.name, *position, ops)?;
            }
            Ok(matches.len())
        })
    }

    /// Execute one statement against the store and indexes
    fn run<T, F>(&self, statement: F) -> Result<T>
    where
        F: FnOnce(&mut TableInner, &mut Vec<LogOperation>) -> Result<T>,
    {
        let mut inner = self.inner.write();
        inner.ensure_open(&self.name)?;
        inner.settle(&self.name);
        let mut ops = Vec::new();

        if inner.batch.is_some() {
            let seq = inner.store.mutation_seq();
            let journal = inner.indexes.journal_len();
            return match statement(&mut *inner, &mut ops) {
                Ok(value) => {
                    if let Some(batch) = inner.batch.as_mut() {
                        batch.ops.append(&mut ops);
                        batch.statements += 1;
                    }
                    Ok(value)
                }
                Err(e) => {
                    let mutated = inner.store.mutation_seq() != seq
                        || inner.indexes.journal_len() != journal;
                    if mutated {
                        warn!(table = %self.name, error = %e, "Statement failed mid-batch, aborting batch");
                        inner.abort_batch();
                    }
                    Err(e)
                }
            };
        }

        inner.store.begin_unit()?;
        inner.indexes.begin_unit();

        let staged = statement(&mut *inner, &mut ops).and_then(|value| {
            if ops.is_empty() {
                return Ok((value, None));
            }
            let handle = self.wal.submit(encode_ops(&ops)?)?;
            Ok((value, Some(handle)))
        });

        let (value, handle) = match staged {
            Ok((value, Some(handle))) => (value, handle),
            Ok((value, None)) => {
                inner.publish(&self.name, None);
                return Ok(value);
            }
            Err(e) => {
                inner.store.rollback_unit();
                inner.indexes.rollback_unit();
                return Err(e);
            }
        };

        inner.detach(handle.ticket());
        drop(inner);

        let outcome = handle.wait();

        let mut inner = self.inner.write();
        inner.settle(&self.name);
        outcome.map(|_| value)
    }

    /// Write lock with no submitted statement left unresolved
    fn quiesce(&self) -> RwLockWriteGuard<'_, TableInner> {
        loop {
            let mut inner = self.inner.write();
            inner.settle(&self.name);
            let unresolved = inner
                .pending
                .iter()
                .find(|unit| unit.ticket.outcome().is_none())
                .map(|unit| unit.ticket.clone());
            let Some(ticket) = unresolved else {
                return inner;
            };
            drop(inner);
            ticket.wait();
        }
    }

    // =========================================================================
    // Batches
    // =========================================================================

    /// Start collecting statements into one WAL submission
    pub fn begin_batch(&self) -> Result<()> {
        let mut inner = self.quiesce();
        inner.ensure_open(&self.name)?;
        if inner.batch.is_some() {
            return Err(AtlasError::BatchState(format!(
                "batch already open on '{}'",
                self.name
            )));
        }
        inner.store.begin_batch_unit()?;
        inner.indexes.begin_unit();
        inner.batch = Some(BatchState::default());
        debug!(table = %self.name, "Began batch");
        Ok(())
    }

    /// Commit the batch as one submission, then flush each touched page once
    pub fn end_batch(&self) -> Result<FlushReport> {
        let mut inner = self.inner.write();
        inner.ensure_open(&self.name)?;
        let batch = inner.batch.take().ok_or_else(|| {
            AtlasError::BatchState(format!("no batch open on '{}'", self.name))
        })?;

        if batch.ops.is_empty() {
            inner.publish(&self.name, None);
            return Ok(FlushReport::default());
        }

        let receipt = encode_ops(&batch.ops).and_then(|records| self.wal.commit(records));
        let receipt = match receipt {
            Ok(receipt) => receipt,
            Err(e) => {
                error!(table = %self.name, ops = batch.ops.len(), error = %e, "Batch commit failed");
                inner.store.rollback_unit();
                inner.indexes.rollback_unit();
                return Err(e);
            }
        };

        let touched = inner.publish(&self.name, Some(receipt.commit_lsn));
        let report = inner.store.flush_touched(&touched)?;
        debug!(
            table = %self.name,
            statements = batch.statements,
            ops = batch.ops.len(),
            commit_lsn = receipt.commit_lsn,
            pages_written = report.pages_written,
            "Committed batch"
        );
        Ok(report)
    }

    /// Discard every statement of the open batch
    pub fn abort_batch(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.ensure_open(&self.name)?;
        if inner.batch.is_none() {
            return Err(AtlasError::BatchState(format!(
                "no batch open on '{}'",
                self.name
            )));
        }
        inner.abort_batch();
        debug!(table = %self.name, "Aborted batch");
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Rows matching `predicate`, in position order
    pub fn select(&self, predicate: &Predicate) -> Result<Vec<(RowPosition, Row)>> {
        let inner = self.inner.read();
        inner.ensure_open(&self.name)?;
        inner.select(&self.descriptor, predicate)
    }

    pub fn get(&self, position: RowPosition) -> Result<Option<Row>> {
        let inner = self.inner.read();
        inner.ensure_open(&self.name)?;
        inner.store.get(position)
    }

    /// Rows whose `column` equals `value`
    pub fn lookup(&self, column: &str, value: &Value) -> Result<Vec<(RowPosition, Row)>> {
        self.select(&Predicate::Eq(column.to_string(), value.clone()))
    }

    /// Index positions for `value`, or `None` when `column` is not indexed
    pub fn lookup_positions(&self, column: &str, value: &Value) -> Result<Option<Vec<RowPosition>>> {
        let inner = self.inner.read();
        inner.ensure_open(&self.name)?;
        Ok(inner.indexes.lookup(column, value))
    }

    /// Column-major copy of the live rows
    pub fn snapshot(&self) -> Result<Arc<ColumnarSnapshot>> {
        let inner = self.inner.read();
        inner.ensure_open(&self.name)?;
        inner.store.snapshot()
    }

    pub fn len(&self) -> u64 {
        self.inner.read().store.live_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Rebuild every index from the stored rows
    pub fn reindex(&self) -> Result<()> {
        let mut inner = self.quiesce();
        inner.ensure_open(&self.name)?;
        inner.ensure_no_batch(&self.name, "reindex")?;
        let rows = inner.store.scan()?;
        inner
            .indexes
            .rebuild(rows.iter().map(|(pos, row)| (*pos, row)))?;
        info!(table = %self.name, rows = rows.len(), "Reindexed table");
        Ok(())
    }

    /// Fail with `IndexInconsistency` unless every index matches the store
    pub fn verify_indexes(&self) -> Result<()> {
        let inner = self.inner.read();
        inner.ensure_open(&self.name)?;
        let rows = inner.store.scan()?;
        inner.indexes.verify(rows.iter().map(|(pos, row)| (*pos, row)))
    }

    /// Write all dirty state of the store and sync it
    pub fn flush(&self) -> Result<FlushReport> {
        let mut inner = self.quiesce();
        inner.ensure_open(&self.name)?;
        inner.flush(&self.name)
    }

    /// Flush and detach; later calls fail with `TableClosed`
    ///
    /// An open batch is aborted first.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.quiesce();
        if inner.state == TableState::Closed {
            return Ok(());
        }
        if inner.batch.is_some() {
            warn!(table = %self.name, "Closing table with an open batch, aborting it");
            inner.abort_batch();
        }
        inner.store.flush()?;
        inner.state = TableState::Closed;
        info!(table = %self.name, "Closed table");
        Ok(())
    }

    pub fn stats(&self) -> TableStats {
        let inner = self.inner.read();
        TableStats {
            name: self.name.clone(),
            strategy: self.descriptor.strategy,
            live_rows: inner.store.live_rows(),
            store: inner.store.stats(),
            indexes: inner.indexes.statistics(),
            in_batch: inner.batch.is_some(),
        }
    }

    /// Exclusive access for engine-wide checkpoints, with nothing in flight
    pub(crate) fn lock(&self) -> RwLockWriteGuard<'_, TableInner> {
        self.quiesce()
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("strategy", &self.descriptor.strategy)
            .finish()
    }
}

fn encode_ops(ops: &[LogOperation]) -> Result<Vec<Vec<u8>>> {
    ops.iter().map(LogOperation::encode).collect()
}

// =============================================================================
// Inner operations (write lock held)
// =============================================================================

impl TableInner {
    fn ensure_open(&self, name: &str) -> Result<()> {
        match self.state {
            TableState::Open => Ok(()),
            TableState::Closed => Err(AtlasError::TableClosed(name.to_string())),
        }
    }

    fn ensure_no_batch(&self, name: &str, action: &str) -> Result<()> {
        if self.batch.is_some() {
            return Err(AtlasError::BatchState(format!(
                "cannot {} '{}' while a batch is open",
                action, name
            )));
        }
        Ok(())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state == TableState::Open
    }

    /// Flush the store; refused while a batch holds staged pages
    pub(crate) fn flush(&mut self, name: &str) -> Result<FlushReport> {
        self.ensure_no_batch(name, "flush")?;
        self.store.flush()
    }

    /// Make the open unit visible after its submission is durable
    fn publish(&mut self, name: &str, commit_lsn: Option<u64>) -> Vec<u32> {
        let touched = match self.store.commit_unit(commit_lsn) {
            Ok(touched) => touched,
            Err(e) => {
                // The submission is durable; only the page LSN stamp is missing
                warn!(table = %name, error = %e, "Failed to stamp committed pages");
                Vec::new()
            }
        };
        self.indexes.commit_unit();
        touched
    }

    /// Move the open statement unit to the pending queue
    fn detach(&mut self, ticket: CommitTicket) {
        let Some(store) = self.store.detach_unit() else {
            return;
        };
        let indexes = self.indexes.detach_unit().unwrap_or_default();
        self.pending.push_back(PendingUnit {
            ticket,
            store,
            indexes,
        });
    }

    /// Publish or undo pending statements whose tickets have resolved
    fn settle(&mut self, name: &str) {
        while let Some(front) = self.pending.front() {
            match front.ticket.outcome() {
                None => return,
                Some(TicketOutcome::Durable { commit_lsn }) => {
                    let Some(unit) = self.pending.pop_front() else {
                        return;
                    };
                    if let Err(e) = self.store.finish_unit(unit.store, Some(commit_lsn)) {
                        // The submission is durable; only the page LSN stamp is missing
                        warn!(table = %name, error = %e, "Failed to stamp committed pages");
                    }
                }
                Some(TicketOutcome::Failed) => {
                    // Later units were staged on top of this one
                    if self.pending.iter().any(|unit| unit.ticket.outcome().is_none()) {
                        return;
                    }
                    let undone = self.pending.len();
                    while let Some(unit) = self.pending.pop_back() {
                        if let Some(TicketOutcome::Durable { commit_lsn }) = unit.ticket.outcome() {
                            error!(table = %name, commit_lsn, "Undoing a durable statement queued behind a failed one");
                        }
                        self.store.undo_unit(unit.store);
                        self.indexes.undo(unit.indexes);
                    }
                    warn!(table = %name, undone, "Rolled back statements whose submission failed");
                    return;
                }
            }
        }
    }

    fn abort_batch(&mut self) {
        self.batch = None;
        self.store.rollback_unit();
        self.indexes.rollback_unit();
    }

    fn insert(&mut self, name: &str, row: Row, ops: &mut Vec<LogOperation>) -> Result<RowPosition> {
        self.store.schema().validate(&row)?;
        self.store.check_row(&row)?;
        self.indexes.check_insert(&row)?;

        let position = self.store.insert(&row)?;
        self.indexes.insert_row(&row, position)?;
        ops.push(LogOperation::Insert {
            table: name.to_string(),
            position,
            row,
        });
        Ok(position)
    }

    fn update(
        &mut self,
        name: &str,
        position: RowPosition,
        row: Row,
        ops: &mut Vec<LogOperation>,
    ) -> Result<RowPosition> {
        self.store.schema().validate(&row)?;
        self.store.check_row(&row)?;
        let old = self
            .store
            .get(position)?
            .ok_or(AtlasError::InvalidPosition(position.as_u64()))?;
        self.indexes.check_update(position, &row)?;

        let new_position = self.store.update(position, &row)?;
        self.indexes.update_row(&old, position, &row, new_position)?;

        if new_position == position {
            ops.push(LogOperation::Update {
                table: name.to_string(),
                position,
                row,
            });
        } else {
            ops.push(LogOperation::Delete {
                table: name.to_string(),
                position,
            });
            ops.push(LogOperation::Insert {
                table: name.to_string(),
                position: new_position,
                row,
            });
        }
        Ok(new_position)
    }

    fn delete(&mut self, name: &str, position: RowPosition, ops: &mut Vec<LogOperation>) -> Result<Row> {
        let old = self.store.delete(position)?;
        self.indexes.remove_row(&old, position);
        ops.push(LogOperation::Delete {
            table: name.to_string(),
            position,
        });
        Ok(old)
    }

    fn select(
        &self,
        descriptor: &TableDescriptor,
        predicate: &Predicate,
    ) -> Result<Vec<(RowPosition, Row)>> {
        match predicate {
            Predicate::All => self.store.scan(),
            Predicate::Position(position) => Ok(self
                .store
                .get(*position)?
                .map(|row| vec![(*position, row)])
                .unwrap_or_default()),
            Predicate::Matches(f) => Ok(self
                .store
                .scan()?
                .into_iter()
                .filter(|(_, row)| f(row))
                .collect()),
            Predicate::Eq(column, value) => {
                let idx = descriptor.schema.column_index(column).ok_or_else(|| {
                    AtlasError::SchemaMismatch(format!(
                        "no column '{}' in '{}'",
                        column, descriptor.name
                    ))
                })?;
                let key = IndexKey::from_value(value);
                let equal = |row: &Row| {
                    row.get(idx)
                        .map_or(false, |v| IndexKey::from_value(v) == key)
                };

                match self.indexes.lookup(column, value) {
                    Some(mut positions) => {
                        positions.sort_unstable();
                        let mut rows = Vec::with_capacity(positions.len());
                        for position in positions {
                            match self.store.get(position)? {
                                Some(row) if equal(&row) => rows.push((position, row)),
                                _ => {
                                    return Err(AtlasError::IndexInconsistency {
                                        index: format!("{}.{}", descriptor.name, column),
                                        reason: format!("entry points at {} which does not match", position),
                                    })
                                }
                            }
                        }
                        Ok(rows)
                    }
                    None => Ok(self
                        .store
                        .scan()?
                        .into_iter()
                        .filter(|(_, row)| equal(row))
                        .collect()),
                }
            }
        }
    }
}
