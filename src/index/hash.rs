//! Hash index
//!
//! AHash-keyed map from [`IndexKey`] to the positions holding it. Unique
//! indexes allow any number of nulls but at most one position per other key.

use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;

use crate::error::{AtlasError, Result};
use crate::row::{Row, RowPosition, Value};

use super::IndexKey;

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time counters for one index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexStatistics {
    /// `(key, position)` pairs
    pub entries: u64,
    pub distinct_keys: usize,
    /// Keys the map can hold before it resizes
    pub bucket_capacity: usize,
    pub load_factor: f64,
    pub max_positions_per_key: usize,
    pub adds: u64,
    pub removes: u64,
    pub lookups: u64,
    pub rebuilds: u64,
}

// ============================================================================
// Hash Index
// ============================================================================

/// Equality index over one column
#[derive(Debug)]
pub struct HashIndex {
    name: String,
    column: usize,
    unique: bool,
    map: AHashMap<IndexKey, Vec<RowPosition>>,
    entries: u64,
    adds: u64,
    removes: u64,
    rebuilds: u64,
    lookups: AtomicU64,
}

impl HashIndex {
    /// Index over the column at ordinal `column`
    pub fn new(name: impl Into<String>, column: usize, unique: bool) -> Self {
        Self {
            name: name.into(),
            column,
            unique,
            map: AHashMap::new(),
            entries: 0,
            adds: 0,
            removes: 0,
            rebuilds: 0,
            lookups: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordinal of the indexed column
    pub fn column(&self) -> usize {
        self.column
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn len(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Key this index derives from `row`
    pub fn key_of(&self, row: &Row) -> IndexKey {
        IndexKey::from_value(row.get(self.column).unwrap_or(&Value::Null))
    }

    // ========================================================================
    // Insert / Remove
    // ========================================================================

    /// Whether adding `key` would violate uniqueness
    ///
    /// A position equal to `ignore` does not count, so a row can keep its own
    /// key across an update.
    pub fn conflicts(&self, key: &IndexKey, ignore: Option<RowPosition>) -> bool {
        if !self.unique || key.is_null() {
            return false;
        }
        self.map
            .get(key)
            .map_or(false, |positions| positions.iter().any(|&p| Some(p) != ignore))
    }

    /// Add one `(key, position)` pair
    pub fn add(&mut self, key: IndexKey, position: RowPosition) -> Result<()> {
        if self.conflicts(&key, None) {
            return Err(AtlasError::DuplicateKey {
                index: self.name.clone(),
            });
        }
        self.map.entry(key).or_default().push(position);
        self.entries += 1;
        self.adds += 1;
        Ok(())
    }

    pub fn add_row(&mut self, row: &Row, position: RowPosition) -> Result<()> {
        let key = self.key_of(row);
        self.add(key, position)
    }

    /// Remove one `(key, position)` pair; the key goes once it has no positions
    pub fn remove(&mut self, key: &IndexKey, position: RowPosition) -> bool {
        let Some(positions) = self.map.get_mut(key) else {
            return false;
        };
        let Some(idx) = positions.iter().position(|&p| p == position) else {
            return false;
        };
        positions.swap_remove(idx);
        if positions.is_empty() {
            self.map.remove(key);
        }
        self.entries -= 1;
        self.removes += 1;
        true
    }

    pub fn remove_row(&mut self, row: &Row, position: RowPosition) -> bool {
        let key = self.key_of(row);
        self.remove(&key, position)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Positions holding `key`, in insertion order
    pub fn lookup_positions(&self, key: &IndexKey) -> Vec<RowPosition> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.map.get(key).cloned().unwrap_or_default()
    }

    pub fn contains_key(&self, key: &IndexKey) -> bool {
        self.map.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IndexKey, &[RowPosition])> {
        self.map.iter().map(|(key, positions)| (key, positions.as_slice()))
    }

    // ========================================================================
    // Bulk
    // ========================================================================

    /// Replace the contents with `pairs`
    ///
    /// On a uniqueness violation the index is left empty.
    pub fn bulk_load<I>(&mut self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (IndexKey, RowPosition)>,
    {
        let pairs = pairs.into_iter();
        let mut map: AHashMap<IndexKey, Vec<RowPosition>> =
            AHashMap::with_capacity(pairs.size_hint().0);
        let mut entries = 0u64;

        for (key, position) in pairs {
            let positions = map.entry(key).or_default();
            positions.push(position);
            entries += 1;
        }

        self.rebuilds += 1;
        if self.unique {
            let duplicate = map
                .iter()
                .any(|(key, positions)| !key.is_null() && positions.len() > 1);
            if duplicate {
                self.clear();
                return Err(AtlasError::DuplicateKey {
                    index: self.name.clone(),
                });
            }
        }

        self.map = map;
        self.entries = entries;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.entries = 0;
    }

    pub fn statistics(&self) -> IndexStatistics {
        let capacity = self.map.capacity();
        IndexStatistics {
            entries: self.entries,
            distinct_keys: self.map.len(),
            bucket_capacity: capacity,
            load_factor: if capacity == 0 {
                0.0
            } else {
                self.map.len() as f64 / capacity as f64
            },
            max_positions_per_key: self.map.values().map(Vec::len).max().unwrap_or(0),
            adds: self.adds,
            removes: self.removes,
            lookups: self.lookups.load(Ordering::Relaxed),
            rebuilds: self.rebuilds,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
