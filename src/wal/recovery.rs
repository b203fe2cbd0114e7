//! WAL Recovery
//!
//! Handles crash recovery by scanning the WAL for committed submissions.
//!
//! A submission is visible only once its commit marker is on disk:
//!
//! ```text
//!   D(5) D(6) C(7:2) | D(8) D(9) C(10:2) | D(11) D(12)  <torn>
//!   └── committed ─┘   └── committed ──┘   └─ discarded ─────┘
//! ```
//!
//! The first frame that fails validation ends the log. It, everything after
//! it, and any data frames not closed by a commit marker are truncated.

use std::fs::OpenOptions;
use std::path::Path;

use tracing::{info, warn};

use crate::error::Result;

use super::entry::{LogRecord, RecordKind};
use super::reader::{ReadOutcome, WalReader};

/// One committed submission found in the log
#[derive(Debug, Clone)]
pub struct RecoveredCommit {
    /// LSN of the commit marker
    pub commit_lsn: u64,

    /// Data records in submission order
    pub records: Vec<LogRecord>,
}

/// Result of a recovery operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of data records in committed submissions
    pub entries_recovered: u64,

    /// Number of corrupted frames found (the log stops at the first)
    pub entries_corrupted: u64,

    /// Valid data frames dropped because no commit marker followed them
    pub entries_discarded: u64,

    /// LSN recorded in the file header
    pub start_lsn: u64,

    /// Last committed LSN, or `start_lsn - 1` for an empty log
    pub last_lsn: u64,

    /// LSN the writer continues with
    pub next_lsn: u64,

    /// Whether bytes past the committed prefix were (or would be) removed
    pub was_truncated: bool,

    /// Length of the committed prefix in bytes, header included
    pub valid_len: u64,
}

/// Handles WAL recovery after crash
pub struct WalRecovery;

impl WalRecovery {
    /// Recover committed submissions from a WAL file
    ///
    /// This will:
    /// 1. Read frames until the first invalid or partial one
    /// 2. Group data frames by their commit markers
    /// 3. Truncate everything after the last commit marker
    /// 4. Return the committed submissions in LSN order
    pub fn recover(path: &Path) -> Result<(Vec<RecoveredCommit>, RecoveryResult)> {
        let (commits, result) = Self::scan(path)?;

        if result.was_truncated {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(result.valid_len)?;
            file.sync_all()?;
            warn!(
                valid_len = result.valid_len,
                corrupted = result.entries_corrupted,
                discarded = result.entries_discarded,
                "Truncated WAL tail"
            );
        }

        info!(
            commits = commits.len(),
            records = result.entries_recovered,
            next_lsn = result.next_lsn,
            "WAL recovery complete"
        );

        Ok((commits, result))
    }

    /// Verify integrity of a WAL file without modifying it
    pub fn verify(path: &Path) -> Result<RecoveryResult> {
        Self::scan(path).map(|(_, result)| result)
    }

    fn scan(path: &Path) -> Result<(Vec<RecoveredCommit>, RecoveryResult)> {
        let mut reader = WalReader::open(path)?;
        let start_lsn = reader.start_lsn();
        let file_len = reader.file_len();

        let mut result = RecoveryResult {
            start_lsn,
            last_lsn: start_lsn.saturating_sub(1),
            next_lsn: start_lsn,
            valid_len: reader.position(),
            ..Default::default()
        };

        let mut commits = Vec::new();
        let mut pending: Vec<LogRecord> = Vec::new();
        let mut expected_lsn = start_lsn;

        loop {
            let record = match reader.next_frame() {
                ReadOutcome::Frame(record) => record,
                ReadOutcome::End => break,
                ReadOutcome::Torn { offset } => {
                    warn!(offset, "Torn write at WAL tail");
                    break;
                }
                ReadOutcome::Corrupt { offset, reason } => {
                    warn!(offset, %reason, "Corrupt WAL frame");
                    result.entries_corrupted += 1;
                    break;
                }
            };

            // A gap or repeat means the frame belongs to an older log generation
            if record.lsn != expected_lsn {
                warn!(
                    expected = expected_lsn,
                    found = record.lsn,
                    "LSN discontinuity in WAL"
                );
                result.entries_corrupted += 1;
                break;
            }
            expected_lsn += 1;

            match record.kind {
                RecordKind::Data => pending.push(record),
                RecordKind::Commit => {
                    let count = record.commit_count();
                    if count != Some(pending.len() as u32) {
                        warn!(
                            lsn = record.lsn,
                            declared = ?count,
                            found = pending.len(),
                            "Commit marker does not match its data records"
                        );
                        result.entries_corrupted += 1;
                        break;
                    }

                    result.entries_recovered += pending.len() as u64;
                    result.last_lsn = record.lsn;
                    result.next_lsn = record.lsn + 1;
                    result.valid_len = reader.position();
                    commits.push(RecoveredCommit {
                        commit_lsn: record.lsn,
                        records: std::mem::take(&mut pending),
                    });
                }
            }
        }

        result.entries_discarded = pending.len() as u64;
        result.was_truncated = result.valid_len < file_len;

        Ok((commits, result))
    }
}
