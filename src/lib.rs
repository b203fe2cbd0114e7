//! # AtlasDB
//!
//! An embedded, transactional row store with:
//! - Write-Ahead Logging (WAL) with group commit for durability
//! - Crash recovery with torn-write handling and idempotent redo
//! - Page-based tables (slotted pages, CLOCK page cache, dirty-page flushing)
//! - Append-only and columnar tables (tombstones, column-major snapshots)
//! - Incrementally maintained hash indexes
//! - Optional AES-256-GCM encryption at rest
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Query Executor (caller)                   │
//! │               bound insert/update/delete/select              │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                    Table Coordinator                         │
//! │            (Single Writer / Multi Reader per table)          │
//! └──────┬──────────────────────┬─────────────────────┬─────────┘
//!        │ 1. submit            │ 2. publish          │ 3. index
//!        ▼                      ▼                     ▼
//!   ┌──────────┐      ┌───────────────────┐     ┌───────────┐
//!   │   WAL    │      │   Table Store     │     │ HashIndex │
//!   │ (group   │      │ ┌───────┬───────┐ │     │  (AHash)  │
//!   │  commit) │      │ │ Paged │Append │ │     └───────────┘
//!   └──────────┘      │ └───┬───┴───────┘ │
//!                     └─────┼─────────────┘
//!                           ▼
//!                  ┌─────────────────┐
//!                  │  Page Cache     │──► Cipher ──► page file
//!                  │ (CLOCK, dirty)  │
//!                  └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod crypto;
pub mod error;

pub mod engine;
pub mod index;
pub mod row;
pub mod storage;
pub mod table;
pub mod wal;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{Config, ConfigBuilder, WalDurability};
pub use crypto::{AesGcmCipher, Cipher};
pub use engine::{Engine, ReplayReport};
pub use error::{AtlasError, ErrorKind, Result};
pub use index::{IndexDef, IndexKey};
pub use row::{ColumnDef, ColumnType, Row, RowPosition, Schema, Value};
pub use storage::{ColumnarSnapshot, FlushReport};
pub use table::{Predicate, StorageStrategy, Table, TableDescriptor, TableState, TableStats};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasDB
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
