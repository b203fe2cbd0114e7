//! Index Module
//!
//! Equality indexes from column values to row positions.
//!
//! ## Responsibilities
//! - `IndexKey`: hashable, totally ordered form of a `Value`
//! - `HashIndex`: one column's key → positions map
//! - `IndexSet`: every index of a table, kept in step with the store and
//!   able to undo the changes of an unfinished unit
//!
//! Maintenance during ordinary writes is always incremental: a delete removes
//! exactly its own `(key, position)` entries. Only [`IndexSet::rebuild`]
//! walks the whole table.

mod hash;
mod set;

pub use hash::{HashIndex, IndexStatistics};
pub use set::{IndexJournal, IndexSet};

use serde::{Deserialize, Serialize};

use crate::row::Value;

/// Hashable key derived from a column value
///
/// Int32 and Int64 share a representation, floats are compared by their
/// normalized bit pattern, and decimals are reduced so `1.50` equals `1.5`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    DateTime(i64),
    Text(String),
    Bytes(Vec<u8>),
    Decimal { mantissa: i128, scale: u8 },
}

impl IndexKey {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => IndexKey::Null,
            Value::Boolean(b) => IndexKey::Bool(*b),
            Value::Int32(v) => IndexKey::Int(i64::from(*v)),
            Value::Int64(v) => IndexKey::Int(*v),
            Value::Double(f) => IndexKey::Float(normalize_float(*f)),
            Value::DateTime(t) => IndexKey::DateTime(*t),
            Value::Text(s) => IndexKey::Text(s.clone()),
            Value::Bytes(b) => IndexKey::Bytes(b.clone()),
            Value::Decimal { mantissa, scale } => {
                let (mut mantissa, mut scale) = (*mantissa, *scale);
                while scale > 0 && mantissa % 10 == 0 {
                    mantissa /= 10;
                    scale -= 1;
                }
                IndexKey::Decimal { mantissa, scale }
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, IndexKey::Null)
    }
}

fn normalize_float(f: f64) -> u64 {
    if f == 0.0 {
        0.0f64.to_bits()
    } else if f.is_nan() {
        f64::NAN.to_bits()
    } else {
        f.to_bits()
    }
}

impl From<&Value> for IndexKey {
    fn from(value: &Value) -> Self {
        IndexKey::from_value(value)
    }
}

/// An index attached to a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub column: String,
    pub unique: bool,
}

impl IndexDef {
    pub fn new(column: impl Into<String>, unique: bool) -> Self {
        Self {
            column: column.into(),
            unique,
        }
    }

    /// Name used in statistics and errors
    pub fn name(&self, table: &str) -> String {
        format!("{}.{}", table, self.column)
    }
}
