//! Row Module
//!
//! Typed values, rows, schemas and the on-page row encoding.
//!
//! ## Responsibilities
//! - `Value`: a single typed cell
//! - `Row`: an ordered list of values matching a `Schema`
//! - `RowPosition`: where a row lives inside its store
//! - Binary row codec used for page tuples and append segments

mod codec;
mod schema;

pub use codec::{decode_row, encode_row, TypeMarker};
pub use schema::{ColumnDef, ColumnType, Schema};

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single typed value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int32(i32),
    Int64(i64),
    Double(f64),
    Boolean(bool),
    /// Microseconds since the Unix epoch
    DateTime(i64),
    Text(String),
    Bytes(Vec<u8>),
    /// Fixed-point decimal: `mantissa * 10^-scale`
    Decimal { mantissa: i128, scale: u8 },
}

impl Value {
    /// Whether this is `Value::Null`
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view used by analytic aggregates
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::DateTime(v) => Some(*v as f64),
            Value::Decimal { mantissa, scale } => {
                Some(*mantissa as f64 / 10f64.powi(i32::from(*scale)))
            }
            _ => None,
        }
    }

    /// Integer view (Int32, Int64, DateTime)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) | Value::DateTime(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::DateTime(v) => write!(f, "@{}us", v),
            Value::Text(v) => write!(f, "'{}'", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Decimal { mantissa, scale } => write!(f, "{}e-{}", mantissa, scale),
        }
    }
}

/// An ordered list of values, one per schema column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Value at column ordinal `idx`
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self { values }
    }
}

/// Location of a row inside its table's store
///
/// Page-based tables pack `(page_id << 16) | slot`; append-only tables use the
/// row's sequence number directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowPosition(pub u64);

impl RowPosition {
    /// Position of `slot` on page `page_id`
    pub fn from_page_slot(page_id: u32, slot: u16) -> Self {
        Self((u64::from(page_id) << 16) | u64::from(slot))
    }

    /// Page id half of a page-based position
    pub fn page_id(self) -> u32 {
        (self.0 >> 16) as u32
    }

    /// Slot half of a page-based position
    pub fn slot(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RowPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
