//! Binary row codec
//!
//! Rows are stored self-describing so a tuple can be validated against the
//! schema it is decoded with.
//!
//! ## Row Format (little endian)
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ ColCount (4) │ Column 0 | Column 1 | ...                    │
//! └──────────────┴──────────────────────────────────────────────┘
//!
//! Column:
//! ┌─────────────┬──────────┬───────────┬────────────────────────┐
//! │ NameLen (4) │ Name     │ Marker(1) │ Value                  │
//! └─────────────┴──────────┴───────────┴────────────────────────┘
//! ```
//!
//! Value encodings by marker:
//! - Null: empty
//! - Int32: 4 bytes, Int64/DateTime: 8 bytes, Double: 8 bytes (IEEE 754)
//! - Boolean: 1 byte
//! - String/Bytes: Len (4) + bytes
//! - Decimal: mantissa (16) + scale (1)

use crate::error::{AtlasError, Result};

use super::{Row, Schema, Value};

/// Type markers written before every value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeMarker {
    Null = 0,
    Int32 = 1,
    Int64 = 2,
    Double = 3,
    Boolean = 4,
    DateTime = 5,
    String = 6,
    Bytes = 7,
    Decimal = 8,
}

impl TypeMarker {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(TypeMarker::Null),
            1 => Some(TypeMarker::Int32),
            2 => Some(TypeMarker::Int64),
            3 => Some(TypeMarker::Double),
            4 => Some(TypeMarker::Boolean),
            5 => Some(TypeMarker::DateTime),
            6 => Some(TypeMarker::String),
            7 => Some(TypeMarker::Bytes),
            8 => Some(TypeMarker::Decimal),
            _ => None,
        }
    }

    fn of(value: &Value) -> Self {
        match value {
            Value::Null => TypeMarker::Null,
            Value::Int32(_) => TypeMarker::Int32,
            Value::Int64(_) => TypeMarker::Int64,
            Value::Double(_) => TypeMarker::Double,
            Value::Boolean(_) => TypeMarker::Boolean,
            Value::DateTime(_) => TypeMarker::DateTime,
            Value::Text(_) => TypeMarker::String,
            Value::Bytes(_) => TypeMarker::Bytes,
            Value::Decimal { .. } => TypeMarker::Decimal,
        }
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode `row` using the column names of `schema`
pub fn encode_row(schema: &Schema, row: &Row) -> Result<Vec<u8>> {
    if schema.len() != row.len() {
        return Err(AtlasError::SchemaMismatch(format!(
            "expected {} values, got {}",
            schema.len(),
            row.len()
        )));
    }

    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&(row.len() as u32).to_le_bytes());

    for (column, value) in schema.columns.iter().zip(&row.values) {
        let name = column.name.as_bytes();
        buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
        buf.extend_from_slice(name);
        buf.push(TypeMarker::of(value) as u8);

        match value {
            Value::Null => {}
            Value::Int32(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Int64(v) | Value::DateTime(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Double(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Boolean(v) => buf.push(u8::from(*v)),
            Value::Text(s) => {
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
                buf.extend_from_slice(b);
            }
            Value::Decimal { mantissa, scale } => {
                buf.extend_from_slice(&mantissa.to_le_bytes());
                buf.push(*scale);
            }
        }
    }

    Ok(buf)
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a row, checking column names against `schema`
pub fn decode_row(schema: &Schema, data: &[u8]) -> Result<Row> {
    let mut reader = Reader { data, offset: 0 };

    let count = reader.read_u32()? as usize;
    if count != schema.len() {
        return Err(AtlasError::corruption(
            "row",
            format!("column count {} does not match schema ({})", count, schema.len()),
        ));
    }

    let mut values = Vec::with_capacity(count);
    for column in &schema.columns {
        let name = reader.read_bytes()?;
        if name != column.name.as_bytes() {
            return Err(AtlasError::corruption(
                "row",
                format!(
                    "expected column '{}', found '{}'",
                    column.name,
                    String::from_utf8_lossy(name)
                ),
            ));
        }

        let marker_offset = reader.offset;
        let marker = TypeMarker::from_u8(reader.read_u8()?).ok_or_else(|| {
            AtlasError::corruption("row", format!("unknown type marker at offset {}", marker_offset))
        })?;

        let value = match marker {
            TypeMarker::Null => Value::Null,
            TypeMarker::Int32 => Value::Int32(i32::from_le_bytes(reader.read_array()?)),
            TypeMarker::Int64 => Value::Int64(i64::from_le_bytes(reader.read_array()?)),
            TypeMarker::DateTime => Value::DateTime(i64::from_le_bytes(reader.read_array()?)),
            TypeMarker::Double => Value::Double(f64::from_le_bytes(reader.read_array()?)),
            TypeMarker::Boolean => Value::Boolean(reader.read_u8()? != 0),
            TypeMarker::String => {
                let bytes = reader.read_bytes()?;
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    AtlasError::corruption("row", format!("invalid UTF-8 in '{}': {}", column.name, e))
                })?;
                Value::Text(text.to_string())
            }
            TypeMarker::Bytes => Value::Bytes(reader.read_bytes()?.to_vec()),
            TypeMarker::Decimal => {
                let mantissa = i128::from_le_bytes(reader.read_array()?);
                let scale = reader.read_u8()?;
                Value::Decimal { mantissa, scale }
            }
        };
        values.push(value);
    }

    if reader.offset != data.len() {
        return Err(AtlasError::corruption(
            "row",
            format!("{} trailing bytes after last column", data.len() - reader.offset),
        ));
    }

    Ok(Row::new(values))
}

/// Bounds-checked cursor over an encoded row
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let remaining = self.data.len() - self.offset;
        if n > remaining {
            return Err(AtlasError::corruption(
                "row",
                format!(
                    "truncated at offset {}: need {} bytes, have {}",
                    self.offset, n, remaining
                ),
            ));
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Length-prefixed byte string
    fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }
}
