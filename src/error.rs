//! Error types for AtlasDB
//!
//! Provides a unified error type for all operations. Every variant maps to an
//! [`ErrorKind`] so callers can decide between retrying, aborting the
//! operation, or alerting an operator.

use thiserror::Error;

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Unified error type for AtlasDB operations
#[derive(Debug, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Durability Errors
    // -------------------------------------------------------------------------
    /// A WAL write or hardware sync failed; the whole batch failed with it.
    #[error("Durability failure: {0}")]
    DurabilityFailure(String),

    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    /// Checksum mismatch or malformed on-disk unit. The unit is unusable.
    #[error("Storage corruption in {unit}: {reason}")]
    StorageCorruption { unit: String, reason: String },

    /// AEAD tag mismatch while decrypting.
    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Row of {size} bytes exceeds the maximum of {max} bytes")]
    RowTooLarge { size: usize, max: usize },

    #[error("Invalid row position: {0}")]
    InvalidPosition(u64),

    // -------------------------------------------------------------------------
    // Index Errors
    // -------------------------------------------------------------------------
    #[error("Index inconsistency on '{index}': {reason}")]
    IndexInconsistency { index: String, reason: String },

    #[error("Duplicate key in unique index '{index}'")]
    DuplicateKey { index: String },

    // -------------------------------------------------------------------------
    // Table Errors
    // -------------------------------------------------------------------------
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Table is closed: {0}")]
    TableClosed(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Batch state error: {0}")]
    BatchState(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification of errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Log flush failed; the log refuses writes until health is restored
    Durability,
    /// A page, record or file failed validation
    Corruption,
    /// Decryption failed authentication
    Authentication,
    /// Index and store disagree
    IndexInconsistency,
    /// A bounded resource is full; retrying later may succeed
    Capacity,
    /// Constraint violation (duplicate key)
    Constraint,
    /// The caller passed something invalid
    InvalidInput,
    /// Operating system I/O error
    Io,
    /// Anything else
    Internal,
}

impl AtlasError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AtlasError::Io(_) => ErrorKind::Io,
            AtlasError::DurabilityFailure(_) => ErrorKind::Durability,
            AtlasError::WalCorruption(_) | AtlasError::StorageCorruption { .. } => {
                ErrorKind::Corruption
            }
            AtlasError::AuthenticationFailure(_) => ErrorKind::Authentication,
            AtlasError::IndexInconsistency { .. } => ErrorKind::IndexInconsistency,
            AtlasError::CapacityExceeded(_) => ErrorKind::Capacity,
            AtlasError::DuplicateKey { .. } => ErrorKind::Constraint,
            AtlasError::RowTooLarge { .. }
            | AtlasError::InvalidPosition(_)
            | AtlasError::TableNotFound(_)
            | AtlasError::TableExists(_)
            | AtlasError::TableClosed(_)
            | AtlasError::SchemaMismatch(_)
            | AtlasError::BatchState(_)
            | AtlasError::Config(_) => ErrorKind::InvalidInput,
            AtlasError::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Whether the same call may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Capacity)
    }

    /// Shorthand for a corruption error on a named unit
    pub(crate) fn corruption(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        AtlasError::StorageCorruption {
            unit: unit.into(),
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for AtlasError {
    fn from(e: bincode::Error) -> Self {
        AtlasError::Serialization(e.to_string())
    }
}
