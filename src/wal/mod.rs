//! Write-Ahead Log (WAL) Module
//!
//! Provides durability guarantees through append-only logging.
//!
//! ## Responsibilities
//! - Append every mutation as a data frame before the store publishes it
//! - Close each submission with a commit marker
//! - Batch concurrent submissions into one write and one sync (group commit)
//! - CRC32 checksums for corruption detection
//! - Log Sequence Numbers (LSN) for ordering, monotonic across checkpoints
//! - Crash recovery: committed submissions only, torn tails truncated
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │ Header: "AWAL" (4) │ Version (2) │ StartLSN (8)  │
//! ├──────────────────────────────────────────────────┤
//! │ Frame 1                                          │
//! │ ┌─────────┬──────────┬─────────┬─────────┬──────┐│
//! │ │ LSN (8) │ Kind (1) │ Len (4) │ CRC (4) │ Data ││
//! │ └─────────┴──────────┴─────────┴─────────┴──────┘│
//! ├──────────────────────────────────────────────────┤
//! │ Frame 2 ...                                      │
//! └──────────────────────────────────────────────────┘
//! ```

mod entry;
mod group_commit;
mod operation;
mod reader;
mod recovery;
mod writer;

pub use entry::{
    decode_file_header, encode_file_header, FrameParse, LogRecord, RecordKind, FILE_HEADER_SIZE,
    HEADER_SIZE, MAX_PAYLOAD_SIZE, WAL_MAGIC, WAL_VERSION,
};
pub use group_commit::{
    CommitHandle, CommitReceipt, CommitTicket, GroupCommitConfig, GroupCommitter, TicketOutcome,
    WalStats,
};
pub use operation::LogOperation;
pub use reader::{ReadOutcome, WalIterator, WalReader};
pub use recovery::{RecoveredCommit, RecoveryResult, WalRecovery};
pub use writer::WalWriter;
