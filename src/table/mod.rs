//! Table Module
//!
//! A table binds one schema to exactly one storage strategy and its indexes,
//! and is the only path through which rows change.
//!
//! ## Write Path
//! ```text
//!   insert / update / delete
//!            │
//!            ▼
//!   ┌──────────────────┐   checks: schema, row size, unique keys
//!   │   Table (write)  │
//!   └────────┬─────────┘
//!            │ stage: store mutation + index journal
//!            ▼
//!   ┌──────────────────┐
//!   │ GroupCommitter   │   one submission per statement or batch
//!   └────────┬─────────┘
//!            │ durable?
//!      ┌─────┴─────┐
//!      ▼           ▼
//!   publish     roll back store and indexes
//! ```

mod catalog;
mod coordinator;
mod store;

pub use catalog::{Catalog, CATALOG_MAGIC};
pub use coordinator::Table;
pub use store::StoreStats;

pub(crate) use store::TableStore;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};
use crate::index::{IndexDef, IndexStatistics};
use crate::row::{Row, RowPosition, Schema, Value};

/// How a table's rows are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageStrategy {
    /// Slotted pages, in-place update and delete
    PageBased,
    /// Sequential appends with tombstones
    AppendOnly,
    /// Append-only, with a cached column-major snapshot
    Columnar,
}

impl fmt::Display for StorageStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageStrategy::PageBased => write!(f, "page-based"),
            StorageStrategy::AppendOnly => write!(f, "append-only"),
            StorageStrategy::Columnar => write!(f, "columnar"),
        }
    }
}

/// Everything fixed about a table while it is open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub strategy: StorageStrategy,
    pub schema: Schema,
    pub indexes: Vec<IndexDef>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>, strategy: StorageStrategy, schema: Schema) -> Self {
        Self {
            name: name.into(),
            strategy,
            schema,
            indexes: Vec::new(),
        }
    }

    /// Attach an index on `column`
    pub fn with_index(mut self, column: impl Into<String>, unique: bool) -> Self {
        self.indexes.push(IndexDef::new(column, unique));
        self
    }

    /// Declared indexes plus the unique index implied by the primary key
    pub fn effective_indexes(&self) -> Vec<IndexDef> {
        let mut defs = self.indexes.clone();
        if let Some(pk) = self.schema.primary_key.and_then(|i| self.schema.columns.get(i)) {
            match defs.iter_mut().find(|d| d.column == pk.name) {
                Some(def) => def.unique = true,
                None => defs.insert(0, IndexDef::new(pk.name.clone(), true)),
            }
        }
        defs
    }

    pub fn validate(&self) -> Result<()> {
        let valid_name = !self.name.is_empty()
            && self.name.len() <= 128
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_name {
            return Err(AtlasError::Config(format!(
                "invalid table name '{}'",
                self.name
            )));
        }
        if self.schema.is_empty() {
            return Err(AtlasError::SchemaMismatch(format!(
                "table '{}' has no columns",
                self.name
            )));
        }
        for (i, column) in self.schema.columns.iter().enumerate() {
            if self.schema.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(AtlasError::SchemaMismatch(format!(
                    "duplicate column '{}' in '{}'",
                    column.name, self.name
                )));
            }
        }
        for def in &self.indexes {
            if self.schema.column_index(&def.column).is_none() {
                return Err(AtlasError::SchemaMismatch(format!(
                    "index on unknown column '{}' of '{}'",
                    def.column, self.name
                )));
            }
        }
        Ok(())
    }
}

/// Row filter for select, update_where and delete_where
#[derive(Clone)]
pub enum Predicate {
    All,
    /// Column equals value; answered by the index when the column has one
    Eq(String, Value),
    Position(RowPosition),
    Matches(Arc<dyn Fn(&Row) -> bool + Send + Sync>),
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq(column.into(), value.into())
    }

    pub fn matches(f: impl Fn(&Row) -> bool + Send + Sync + 'static) -> Self {
        Predicate::Matches(Arc::new(f))
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All => write!(f, "All"),
            Predicate::Eq(column, value) => write!(f, "Eq({}, {})", column, value),
            Predicate::Position(pos) => write!(f, "Position({})", pos),
            Predicate::Matches(_) => write!(f, "Matches(..)"),
        }
    }
}

/// Open/closed lifecycle of a table handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Open,
    Closed,
}

/// Counters for one table
#[derive(Debug, Clone)]
pub struct TableStats {
    pub name: String,
    pub strategy: StorageStrategy,
    pub live_rows: u64,
    pub store: StoreStats,
    pub indexes: Vec<(String, IndexStatistics)>,
    pub in_batch: bool,
}
