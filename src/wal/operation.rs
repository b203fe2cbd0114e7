//! Logged table operations
//!
//! The payload of every data record is one `LogOperation`, bincode encoded.
//! Operations name the exact position they touch so replay is a redo of the
//! physical change rather than a re-execution of the statement.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::row::{Row, RowPosition};

/// Operations that can be logged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogOperation {
    /// Place `row` at `position`
    Insert {
        table: String,
        position: RowPosition,
        row: Row,
    },

    /// Replace the row at `position` in place
    Update {
        table: String,
        position: RowPosition,
        row: Row,
    },

    /// Remove (or tombstone) the row at `position`
    Delete { table: String, position: RowPosition },
}

impl LogOperation {
    /// Name of the table the operation applies to
    pub fn table(&self) -> &str {
        match self {
            LogOperation::Insert { table, .. }
            | LogOperation::Update { table, .. }
            | LogOperation::Delete { table, .. } => table,
        }
    }

    pub fn position(&self) -> RowPosition {
        match self {
            LogOperation::Insert { position, .. }
            | LogOperation::Update { position, .. }
            | LogOperation::Delete { position, .. } => *position,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
