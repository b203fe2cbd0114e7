//! All indexes of one table
//!
//! Changes made inside a unit are journaled as `(index, key, position)`
//! triples so a failed unit can be undone without touching row data.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::{AtlasError, Result};
use crate::row::{Row, RowPosition, Schema, Value};

use super::{HashIndex, IndexDef, IndexKey, IndexStatistics};

#[derive(Debug)]
enum JournalEntry {
    Added {
        index: usize,
        key: IndexKey,
        position: RowPosition,
    },
    Removed {
        index: usize,
        key: IndexKey,
        position: RowPosition,
    },
}

/// Journal of a unit taken out of the set while its submission is in flight
#[derive(Debug, Default)]
pub struct IndexJournal {
    entries: Vec<JournalEntry>,
}

impl IndexJournal {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The indexes attached to a table
#[derive(Debug)]
pub struct IndexSet {
    table: String,
    indexes: Vec<HashIndex>,
    /// Column name of each index
    columns: Vec<String>,
    journal: Option<Vec<JournalEntry>>,
}

impl IndexSet {
    /// Build empty indexes for `defs`
    ///
    /// With `hash_index_enabled` off only unique indexes are kept; they are
    /// needed to enforce uniqueness.
    pub fn new(
        table: &str,
        schema: &Schema,
        defs: &[IndexDef],
        hash_index_enabled: bool,
    ) -> Result<Self> {
        let mut indexes = Vec::with_capacity(defs.len());
        let mut columns = Vec::with_capacity(defs.len());
        for def in defs {
            let column = schema.column_index(&def.column).ok_or_else(|| {
                AtlasError::SchemaMismatch(format!(
                    "index on unknown column '{}' of '{}'",
                    def.column, table
                ))
            })?;
            if !def.unique && !hash_index_enabled {
                debug!(table, column = %def.column, "Hash indexes disabled, skipping");
                continue;
            }
            indexes.push(HashIndex::new(def.name(table), column, def.unique));
            columns.push(def.column.clone());
        }
        Ok(Self {
            table: table.to_string(),
            indexes,
            columns,
            journal: None,
        })
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    pub fn indexes(&self) -> &[HashIndex] {
        &self.indexes
    }

    // =========================================================================
    // Checks
    // =========================================================================

    /// Fail with `DuplicateKey` if inserting `row` would break a unique index
    pub fn check_insert(&self, row: &Row) -> Result<()> {
        for index in self.indexes.iter().filter(|i| i.is_unique()) {
            if index.conflicts(&index.key_of(row), None) {
                return Err(AtlasError::DuplicateKey {
                    index: index.name().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Fail with `DuplicateKey` if replacing the row at `position` would
    /// break a unique index
    pub fn check_update(&self, position: RowPosition, new_row: &Row) -> Result<()> {
        for index in self.indexes.iter().filter(|i| i.is_unique()) {
            if index.conflicts(&index.key_of(new_row), Some(position)) {
                return Err(AtlasError::DuplicateKey {
                    index: index.name().to_string(),
                });
            }
        }
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    fn record(&mut self, entry: JournalEntry) {
        if let Some(journal) = &mut self.journal {
            journal.push(entry);
        }
    }

    fn add(&mut self, index: usize, key: IndexKey, position: RowPosition) -> Result<()> {
        self.indexes[index].add(key.clone(), position)?;
        self.record(JournalEntry::Added {
            index,
            key,
            position,
        });
        Ok(())
    }

    fn remove(&mut self, index: usize, key: IndexKey, position: RowPosition) {
        if self.indexes[index].remove(&key, position) {
            self.record(JournalEntry::Removed {
                index,
                key,
                position,
            });
        }
    }

    /// Index a newly stored row
    pub fn insert_row(&mut self, row: &Row, position: RowPosition) -> Result<()> {
        for index in 0..self.indexes.len() {
            let key = self.indexes[index].key_of(row);
            if let Err(e) = self.add(index, key, position) {
                // Undo the indexes already updated for this row
                for done in 0..index {
                    let key = self.indexes[done].key_of(row);
                    self.remove(done, key, position);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drop the entries of a removed row
    pub fn remove_row(&mut self, row: &Row, position: RowPosition) {
        for index in 0..self.indexes.len() {
            let key = self.indexes[index].key_of(row);
            self.remove(index, key, position);
        }
    }

    /// Move entries from the old row to the new one
    ///
    /// Indexes whose key and position are both unchanged are not touched.
    pub fn update_row(
        &mut self,
        old_row: &Row,
        old_position: RowPosition,
        new_row: &Row,
        new_position: RowPosition,
    ) -> Result<()> {
        for index in 0..self.indexes.len() {
            let old_key = self.indexes[index].key_of(old_row);
            let new_key = self.indexes[index].key_of(new_row);
            if old_key == new_key && old_position == new_position {
                continue;
            }
            self.remove(index, old_key.clone(), old_position);
            if let Err(e) = self.add(index, new_key, new_position) {
                self.add(index, old_key, old_position)?;
                return Err(e);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Units
    // =========================================================================

    pub fn begin_unit(&mut self) {
        self.journal = Some(Vec::new());
    }

    pub fn commit_unit(&mut self) {
        self.journal = None;
    }

    /// Reverse every change journaled since `begin_unit`
    pub fn rollback_unit(&mut self) {
        if let Some(journal) = self.detach_unit() {
            self.undo(journal);
        }
    }

    /// End the unit but keep its journal, so it can still be undone
    pub fn detach_unit(&mut self) -> Option<IndexJournal> {
        self.journal
            .take()
            .map(|entries| IndexJournal { entries })
    }

    /// Reverse a detached journal; journals must be undone newest first
    pub fn undo(&mut self, journal: IndexJournal) {
        let undone = journal.len();
        for entry in journal.entries.into_iter().rev() {
            match entry {
                JournalEntry::Added {
                    index,
                    key,
                    position,
                } => {
                    self.indexes[index].remove(&key, position);
                }
                JournalEntry::Removed {
                    index,
                    key,
                    position,
                } => {
                    if let Err(e) = self.indexes[index].add(key, position) {
                        warn!(table = %self.table, error = %e, "Index rollback conflict");
                    }
                }
            }
        }
        debug!(table = %self.table, undone, "Rolled back index changes");
    }

    /// Entries journaled in the open unit
    pub fn journal_len(&self) -> usize {
        self.journal.as_ref().map_or(0, Vec::len)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Positions whose `column` equals `value`, or `None` if the column has no index
    pub fn lookup(&self, column: &str, value: &Value) -> Option<Vec<RowPosition>> {
        self.find(column)
            .map(|index| index.lookup_positions(&IndexKey::from_value(value)))
    }

    pub fn is_indexed(&self, column: &str) -> bool {
        self.find(column).is_some()
    }

    fn find(&self, column: &str) -> Option<&HashIndex> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.indexes[idx])
    }

    // =========================================================================
    // Rebuild & Verify
    // =========================================================================

    /// Rebuild every index from `rows`
    pub fn rebuild<'a, I>(&mut self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = (RowPosition, &'a Row)> + Clone,
    {
        for index in &mut self.indexes {
            let pairs: Vec<(IndexKey, RowPosition)> = rows
                .clone()
                .into_iter()
                .map(|(position, row)| (index.key_of(row), position))
                .collect();
            index.bulk_load(pairs)?;
        }
        self.journal = None;
        Ok(())
    }

    /// Check that each index holds exactly the `(key, position)` pairs of `rows`
    pub fn verify<'a, I>(&self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = (RowPosition, &'a Row)> + Clone,
    {
        for index in &self.indexes {
            let mut expected: BTreeMap<IndexKey, Vec<RowPosition>> = BTreeMap::new();
            for (position, row) in rows.clone() {
                expected.entry(index.key_of(row)).or_default().push(position);
            }

            let mut actual: BTreeMap<IndexKey, Vec<RowPosition>> = index
                .iter()
                .map(|(key, positions)| (key.clone(), positions.to_vec()))
                .collect();

            for positions in expected.values_mut().chain(actual.values_mut()) {
                positions.sort_unstable();
            }

            if expected != actual {
                let missing = expected
                    .iter()
                    .find(|(key, positions)| actual.get(*key) != Some(*positions));
                let orphaned = actual
                    .iter()
                    .find(|(key, positions)| expected.get(*key) != Some(*positions));
                return Err(AtlasError::IndexInconsistency {
                    index: index.name().to_string(),
                    reason: match (missing, orphaned) {
                        (Some((key, _)), _) => format!("entries for {:?} differ from the store", key),
                        (None, Some((key, _))) => format!("orphaned entries for {:?}", key),
                        (None, None) => "entry counts differ".to_string(),
                    },
                });
            }
        }
        Ok(())
    }

    pub fn statistics(&self) -> Vec<(String, IndexStatistics)> {
        self.indexes
            .iter()
            .map(|index| (index.name().to_string(), index.statistics()))
            .collect()
    }
}
