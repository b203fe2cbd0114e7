//! Column-major snapshots
//!
//! [`transpose`] turns live rows into one vector per column. A snapshot is
//! immutable; the store that produced it builds a new one after any further
//! mutation.

use crate::error::{AtlasError, Result};
use crate::row::{ColumnType, Row, RowPosition, Schema, Value};

/// One column's values, null-aware
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    Boolean(Vec<Option<bool>>),
    /// Text, bytes, decimals and timestamps keep their `Value`
    Other(Vec<Value>),
}

impl ColumnData {
    fn for_type(column_type: ColumnType, capacity: usize) -> Self {
        match column_type {
            ColumnType::Int32 | ColumnType::Int64 => Self::Int64(Vec::with_capacity(capacity)),
            ColumnType::Double => Self::Float64(Vec::with_capacity(capacity)),
            ColumnType::Boolean => Self::Boolean(Vec::with_capacity(capacity)),
            _ => Self::Other(Vec::with_capacity(capacity)),
        }
    }

    fn push(&mut self, value: &Value) {
        match self {
            Self::Int64(values) => values.push(value.as_i64()),
            Self::Float64(values) => values.push(value.as_f64()),
            Self::Boolean(values) => values.push(match value {
                Value::Boolean(b) => Some(*b),
                _ => None,
            }),
            Self::Other(values) => values.push(value.clone()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Int64(v) => v.len(),
            Self::Float64(v) => v.len(),
            Self::Boolean(v) => v.len(),
            Self::Other(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-null entries
    pub fn count(&self) -> usize {
        match self {
            Self::Int64(v) => v.iter().flatten().count(),
            Self::Float64(v) => v.iter().flatten().count(),
            Self::Boolean(v) => v.iter().flatten().count(),
            Self::Other(v) => v.iter().filter(|value| !value.is_null()).count(),
        }
    }

    /// Non-null numeric entries as `f64`
    fn numeric(&self) -> Option<Vec<f64>> {
        match self {
            Self::Int64(v) => Some(v.iter().flatten().map(|&x| x as f64).collect()),
            Self::Float64(v) => Some(v.iter().flatten().copied().collect()),
            Self::Other(v) => {
                let values: Vec<f64> = v.iter().filter_map(Value::as_f64).collect();
                if values.len() == v.iter().filter(|value| !value.is_null()).count() {
                    Some(values)
                } else {
                    None
                }
            }
            Self::Boolean(_) => None,
        }
    }
}

/// Immutable column-major copy of a table's live rows
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnarSnapshot {
    columns: Vec<(String, ColumnData)>,
    positions: Vec<RowPosition>,
}

/// Build a snapshot of `rows` laid out by `schema`
pub fn transpose(schema: &Schema, rows: &[(RowPosition, Row)]) -> ColumnarSnapshot {
    let mut columns: Vec<(String, ColumnData)> = schema
        .columns
        .iter()
        .map(|c| (c.name.clone(), ColumnData::for_type(c.column_type, rows.len())))
        .collect();

    for (_, row) in rows {
        for (idx, (_, data)) in columns.iter_mut().enumerate() {
            data.push(row.get(idx).unwrap_or(&Value::Null));
        }
    }

    ColumnarSnapshot {
        columns,
        positions: rows.iter().map(|(pos, _)| *pos).collect(),
    }
}

impl ColumnarSnapshot {
    pub fn row_count(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> &[RowPosition] {
        &self.positions
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, data)| data)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    fn numeric(&self, name: &str) -> Result<Vec<f64>> {
        let data = self
            .column(name)
            .ok_or_else(|| AtlasError::SchemaMismatch(format!("no column '{}'", name)))?;
        data.numeric()
            .ok_or_else(|| AtlasError::SchemaMismatch(format!("column '{}' is not numeric", name)))
    }

    /// Sum of the non-null values; 0 for an empty column
    pub fn sum(&self, name: &str) -> Result<f64> {
        Ok(self.numeric(name)?.iter().sum())
    }

    /// Mean of the non-null values
    pub fn avg(&self, name: &str) -> Result<Option<f64>> {
        let values = self.numeric(name)?;
        if values.is_empty() {
            return Ok(None);
        }
        Ok(Some(values.iter().sum::<f64>() / values.len() as f64))
    }

    pub fn min(&self, name: &str) -> Result<Option<f64>> {
        Ok(self.numeric(name)?.into_iter().reduce(f64::min))
    }

    pub fn max(&self, name: &str) -> Result<Option<f64>> {
        Ok(self.numeric(name)?.into_iter().reduce(f64::max))
    }

    /// Non-null values in the column
    pub fn count(&self, name: &str) -> Result<usize> {
        self.column(name)
            .map(ColumnData::count)
            .ok_or_else(|| AtlasError::SchemaMismatch(format!("no column '{}'", name)))
    }
}
