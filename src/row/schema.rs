//! Table schemas
//!
//! A schema is an ordered list of typed columns. Rows are validated against
//! it before they reach a store.

use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};

use super::{Row, Value};

/// Declared type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int32,
    Int64,
    Double,
    Boolean,
    DateTime,
    Text,
    Bytes,
    Decimal,
}

impl ColumnType {
    /// Whether a non-null `value` can be stored in a column of this type
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (ColumnType::Int32, Value::Int32(_))
                | (ColumnType::Int64, Value::Int64(_))
                | (ColumnType::Int64, Value::Int32(_))
                | (ColumnType::Double, Value::Double(_))
                | (ColumnType::Boolean, Value::Boolean(_))
                | (ColumnType::DateTime, Value::DateTime(_))
                | (ColumnType::Text, Value::Text(_))
                | (ColumnType::Bytes, Value::Bytes(_))
                | (ColumnType::Decimal, Value::Decimal { .. })
        )
    }
}

/// A single column definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    /// A non-nullable column
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    /// A nullable column
    pub fn nullable(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }
}

/// Ordered set of columns, with an optional primary key column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<ColumnDef>,
    pub primary_key: Option<usize>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self {
            columns,
            primary_key: None,
        }
    }

    /// Mark column `name` as primary key (implies a unique index)
    pub fn with_primary_key(mut self, name: &str) -> Result<Self> {
        let idx = self.column_index(name).ok_or_else(|| {
            AtlasError::SchemaMismatch(format!("unknown primary key column '{}'", name))
        })?;
        self.primary_key = Some(idx);
        Ok(self)
    }

    /// Ordinal of the column called `name`
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Check arity, nullability and types of `row`
    pub fn validate(&self, row: &Row) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(AtlasError::SchemaMismatch(format!(
                "expected {} values, got {}",
                self.columns.len(),
                row.len()
            )));
        }

        for (column, value) in self.columns.iter().zip(&row.values) {
            if value.is_null() {
                if !column.nullable {
                    return Err(AtlasError::SchemaMismatch(format!(
                        "column '{}' is not nullable",
                        column.name
                    )));
                }
                continue;
            }
            if !column.column_type.accepts(value) {
                return Err(AtlasError::SchemaMismatch(format!(
                    "column '{}' of type {:?} cannot hold {}",
                    column.name, column.column_type, value
                )));
            }
        }

        Ok(())
    }
}
