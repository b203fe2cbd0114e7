//! Append-only row store
//!
//! Rows are never changed in place. A delete appends a tombstone for the
//! row's position and an update is a tombstone followed by a fresh append,
//! so positions only grow. Reads skip tombstoned positions.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Header: "ATAP" (4) │ Version (2) │ Encrypted │
//! ├──────────────────────────────────────────────┤
//! │ ┌─────────┬─────────┬──────────────────────┐ │
//! │ │ Len (4) │ CRC (4) │ AppendEntry (bincode)│ │
//! │ └─────────┴─────────┴──────────────────────┘ │
//! │ ... (repeated)                               │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Entries produced inside a unit are staged in memory and only reach the
//! file once the unit commits, i.e. after its WAL submission is durable.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto::Cipher;
use crate::error::{AtlasError, Result};
use crate::row::{Row, RowPosition, Schema};
use crate::wal::LogOperation;

use super::columnar::{transpose, ColumnarSnapshot};
use super::FlushReport;

/// Magic bytes identifying an append file
pub const APPEND_MAGIC: &[u8; 4] = b"ATAP";

/// Current append file format version
pub const APPEND_VERSION: u16 = 1;

const FILE_HEADER_SIZE: usize = 4 + 2 + 1;
const FRAME_HEADER_SIZE: usize = 8;

/// One framed record of an append file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppendEntry {
    Row { position: RowPosition, row: Row },
    Tombstone { position: RowPosition },
}

/// Counters for an append store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppendStoreStats {
    pub live_rows: u64,
    pub tombstones: u64,
    /// Positions ever appended (live + tombstoned)
    pub total_rows: u64,
    /// Fraction of positions a scan actually returns
    pub scan_density: f64,
    pub frames_written: u64,
    pub syncs: u64,
}

#[derive(Debug)]
struct AppendUnit {
    len: usize,
    live_rows: u64,
    /// Rows tombstoned inside the unit, in order
    tombstoned: Vec<(usize, Row)>,
}

/// A unit taken out of the store while its submission is in flight
///
/// Detached units must be undone newest first.
#[derive(Debug)]
pub struct AppendUndo {
    unit: AppendUnit,
    staged: Vec<AppendEntry>,
}

/// Sequential, tombstone-based row store
pub struct AppendStore {
    table: String,
    schema: Schema,
    path: PathBuf,
    file: File,
    file_len: u64,
    cipher: Option<Arc<dyn Cipher>>,

    rows: Vec<Option<Row>>,
    live_rows: u64,

    /// Entries of the open unit
    staged: Vec<AppendEntry>,
    /// Committed entries that have not reached the file yet
    unwritten: Vec<AppendEntry>,
    unit: Option<AppendUnit>,

    /// Keep the last snapshot until the next mutation
    cache_snapshot: bool,
    snapshot: Mutex<Option<Arc<ColumnarSnapshot>>>,

    mutation_seq: u64,
    frames_written: u64,
    syncs: u64,
}

impl AppendStore {
    /// Create an empty store at `path`
    pub fn create(
        path: &Path,
        table: &str,
        schema: Schema,
        cache_snapshot: bool,
        cipher: Option<Arc<dyn Cipher>>,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut header = Vec::with_capacity(FILE_HEADER_SIZE);
        header.extend_from_slice(APPEND_MAGIC);
        header.extend_from_slice(&APPEND_VERSION.to_le_bytes());
        header.push(u8::from(cipher.is_some()));
        file.write_all(&header)?;
        file.sync_all()?;

        info!(table, "Created append store");
        Ok(Self::empty(path, table, schema, file, cache_snapshot, cipher))
    }

    /// Open an existing store, replaying its frames
    ///
    /// A torn final frame is cut off; a bad frame anywhere else is corruption.
    pub fn open(
        path: &Path,
        table: &str,
        schema: Schema,
        cache_snapshot: bool,
        cipher: Option<Arc<dyn Cipher>>,
    ) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        if data.len() < FILE_HEADER_SIZE || &data[0..4] != APPEND_MAGIC {
            return Err(AtlasError::corruption(
                path.display().to_string(),
                "invalid append file header",
            ));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != APPEND_VERSION {
            return Err(AtlasError::corruption(
                path.display().to_string(),
                format!("unsupported version {}", version),
            ));
        }
        let encrypted = data[6] != 0;
        if encrypted != cipher.is_some() {
            return Err(AtlasError::Config(format!(
                "append file for '{}' is {}encrypted but {} key was supplied",
                table,
                if encrypted { "" } else { "not " },
                if cipher.is_some() { "a" } else { "no" }
            )));
        }

        let mut store = Self::empty(path, table, schema, file, cache_snapshot, cipher);
        let mut offset = FILE_HEADER_SIZE;
        let mut frames = 0u64;

        while offset < data.len() {
            let remaining = data.len() - offset;
            if remaining < FRAME_HEADER_SIZE {
                break;
            }
            let len = u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as usize;
            let crc = u32::from_le_bytes([
                data[offset + 4],
                data[offset + 5],
                data[offset + 6],
                data[offset + 7],
            ]);
            let end = offset + FRAME_HEADER_SIZE + len;
            if end > data.len() {
                break;
            }
            let payload = &data[offset + FRAME_HEADER_SIZE..end];
            if crc32fast::hash(payload) != crc {
                if end == data.len() {
                    break;
                }
                return Err(AtlasError::corruption(
                    path.display().to_string(),
                    format!("frame checksum mismatch at offset {}", offset),
                ));
            }

            let entry = store.decode_entry(payload)?;
            store.load_entry(entry)?;
            frames += 1;
            offset = end;
        }

        if offset < data.len() {
            warn!(
                table,
                offset,
                discarded = data.len() - offset,
                "Truncating torn append frame"
            );
            store.file.set_len(offset as u64)?;
            store.file.sync_all()?;
        }
        store.file_len = offset as u64;

        info!(table, frames, rows = store.live_rows, "Opened append store");
        Ok(store)
    }

    fn empty(
        path: &Path,
        table: &str,
        schema: Schema,
        file: File,
        cache_snapshot: bool,
        cipher: Option<Arc<dyn Cipher>>,
    ) -> Self {
        Self {
            table: table.to_string(),
            schema,
            path: path.to_path_buf(),
            file,
            file_len: FILE_HEADER_SIZE as u64,
            cipher,
            rows: Vec::new(),
            live_rows: 0,
            staged: Vec::new(),
            unwritten: Vec::new(),
            unit: None,
            cache_snapshot,
            snapshot: Mutex::new(None),
            mutation_seq: 0,
            frames_written: 0,
            syncs: 0,
        }
    }

    fn decode_entry(&self, payload: &[u8]) -> Result<AppendEntry> {
        match &self.cipher {
            Some(cipher) => Ok(bincode::deserialize(&cipher.decrypt(payload)?)?),
            None => Ok(bincode::deserialize(payload)?),
        }
    }

    fn load_entry(&mut self, entry: AppendEntry) -> Result<()> {
        match entry {
            AppendEntry::Row { position, row } => {
                let idx = position.as_u64() as usize;
                if idx == self.rows.len() {
                    self.rows.push(Some(row));
                    self.live_rows += 1;
                } else if idx < self.rows.len() {
                    if self.rows[idx].replace(row).is_none() {
                        self.live_rows += 1;
                    }
                } else {
                    return Err(AtlasError::corruption(
                        self.path.display().to_string(),
                        format!("row {} appended after only {} rows", idx, self.rows.len()),
                    ));
                }
            }
            AppendEntry::Tombstone { position } => {
                let idx = position.as_u64() as usize;
                match self.rows.get_mut(idx) {
                    Some(slot) => {
                        if slot.take().is_some() {
                            self.live_rows -= 1;
                        }
                    }
                    None => {
                        return Err(AtlasError::corruption(
                            self.path.display().to_string(),
                            format!("tombstone for unknown row {}", idx),
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Rows
    // =========================================================================

    fn stage(&mut self, entry: AppendEntry) {
        if self.unit.is_some() {
            self.staged.push(entry);
        } else {
            self.unwritten.push(entry);
        }
        self.mutation_seq += 1;
        self.snapshot.lock().take();
    }

    /// Append `row`, returning its position
    pub fn append(&mut self, row: Row) -> RowPosition {
        let position = RowPosition(self.rows.len() as u64);
        self.rows.push(Some(row.clone()));
        self.live_rows += 1;
        self.stage(AppendEntry::Row { position, row });
        position
    }

    /// Tombstone the row at `position`, returning it
    pub fn delete(&mut self, position: RowPosition) -> Result<Row> {
        let idx = position.as_u64() as usize;
        let row = self
            .rows
            .get_mut(idx)
            .and_then(Option::take)
            .ok_or(AtlasError::InvalidPosition(position.as_u64()))?;
        self.live_rows -= 1;
        if let Some(unit) = &mut self.unit {
            unit.tombstoned.push((idx, row.clone()));
        }
        self.stage(AppendEntry::Tombstone { position });
        Ok(row)
    }

    /// Tombstone the old row and append the new one
    pub fn update(&mut self, position: RowPosition, row: Row) -> Result<RowPosition> {
        self.delete(position)?;
        Ok(self.append(row))
    }

    pub fn get(&self, position: RowPosition) -> Option<&Row> {
        self.rows
            .get(position.as_u64() as usize)
            .and_then(Option::as_ref)
    }

    /// Live rows in position order
    pub fn iter(&self) -> impl Iterator<Item = (RowPosition, &Row)> + '_ {
        self.rows
            .iter()
            .enumerate()
            .filter_map(|(idx, row)| row.as_ref().map(|row| (RowPosition(idx as u64), row)))
    }

    pub fn scan(&self) -> Vec<(RowPosition, Row)> {
        self.iter().map(|(pos, row)| (pos, row.clone())).collect()
    }

    /// Column-major copy of the live rows
    ///
    /// With snapshot caching on, the copy is reused until the next mutation.
    pub fn snapshot(&self) -> Arc<ColumnarSnapshot> {
        let mut cached = self.snapshot.lock();
        if let Some(snapshot) = cached.as_ref() {
            return Arc::clone(snapshot);
        }
        let snapshot = Arc::new(transpose(&self.schema, &self.scan()));
        if self.cache_snapshot {
            *cached = Some(Arc::clone(&snapshot));
        }
        snapshot
    }

    // =========================================================================
    // Units
    // =========================================================================

    pub fn begin_unit(&mut self) -> Result<()> {
        if self.unit.is_some() {
            return Err(AtlasError::BatchState(format!(
                "unit already open on '{}'",
                self.table
            )));
        }
        self.unit = Some(AppendUnit {
            len: self.rows.len(),
            live_rows: self.live_rows,
            tombstoned: Vec::new(),
        });
        Ok(())
    }

    pub fn in_unit(&self) -> bool {
        self.unit.is_some()
    }

    /// Publish the unit's entries and try to write them
    ///
    /// The unit is already durable in the WAL, so a failed write only leaves
    /// the entries queued for the next flush.
    pub fn commit_unit(&mut self) -> usize {
        match self.detach_unit() {
            Some(undo) => self.finish_unit(undo),
            None => 0,
        }
    }

    /// Drop every change made since `begin_unit`
    pub fn rollback_unit(&mut self) {
        if let Some(undo) = self.detach_unit() {
            self.undo_unit(undo);
        }
    }

    /// Take the open unit and its staged entries out of the store
    pub fn detach_unit(&mut self) -> Option<AppendUndo> {
        let unit = self.unit.take()?;
        Some(AppendUndo {
            unit,
            staged: std::mem::take(&mut self.staged),
        })
    }

    /// Publish a detached unit once its submission is durable
    pub fn finish_unit(&mut self, mut undo: AppendUndo) -> usize {
        let count = undo.staged.len();
        self.unwritten.append(&mut undo.staged);
        if let Err(e) = self.write_unwritten() {
            warn!(table = %self.table, error = %e, "Deferring append write");
        }
        count
    }

    /// Put back what a detached unit changed
    pub fn undo_unit(&mut self, undo: AppendUndo) {
        let unit = undo.unit;
        for (idx, row) in unit.tombstoned.into_iter().rev() {
            if let Some(slot) = self.rows.get_mut(idx) {
                *slot = Some(row);
            }
        }
        self.rows.truncate(unit.len);
        self.live_rows = unit.live_rows;
        self.mutation_seq += 1;
        self.snapshot.lock().take();
        debug!(table = %self.table, "Rolled back append store unit");
    }

    pub fn mutation_seq(&self) -> u64 {
        self.mutation_seq
    }

    // =========================================================================
    // Flush & recovery
    // =========================================================================

    fn write_unwritten(&mut self) -> Result<usize> {
        if self.unwritten.is_empty() {
            return Ok(0);
        }

        let mut buf = Vec::new();
        for entry in &self.unwritten {
            let plain = bincode::serialize(entry)?;
            let payload = match &self.cipher {
                Some(cipher) => cipher.encrypt(&plain)?,
                None => plain,
            };
            buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
            buf.extend_from_slice(&payload);
        }

        let written = self
            .file
            .seek(SeekFrom::Start(self.file_len))
            .and_then(|_| self.file.write_all(&buf));
        if let Err(e) = written {
            // Cut off whatever part of the batch landed
            let _ = self.file.set_len(self.file_len);
            return Err(e.into());
        }

        let count = self.unwritten.len();
        self.file_len += buf.len() as u64;
        self.frames_written += count as u64;
        self.unwritten.clear();
        Ok(count)
    }

    /// Write queued entries and sync
    pub fn flush(&mut self) -> Result<FlushReport> {
        let pages_written = self.write_unwritten()?;
        self.file.sync_data()?;
        self.syncs += 1;
        debug!(table = %self.table, frames = pages_written, "Flushed append store");
        Ok(FlushReport {
            pages_written,
            syncs: 1,
        })
    }

    /// Re-apply a logged operation unless the store already reflects it
    pub fn redo(&mut self, op: &LogOperation, lsn: u64) -> Result<bool> {
        let position = op.position();
        let idx = position.as_u64() as usize;
        let len = self.rows.len();

        match op {
            LogOperation::Insert { row, .. } => {
                if idx < len {
                    return Ok(false);
                }
                if idx > len {
                    return Err(AtlasError::WalCorruption(format!(
                        "record {} appends row {} to '{}' which has {} rows",
                        lsn, idx, self.table, len
                    )));
                }
                self.append(row.clone());
                Ok(true)
            }
            LogOperation::Update { row, .. } => {
                if idx >= len {
                    return Err(AtlasError::WalCorruption(format!(
                        "record {} updates unknown row {} of '{}'",
                        lsn, idx, self.table
                    )));
                }
                if self.rows[idx].replace(row.clone()).is_none() {
                    self.live_rows += 1;
                }
                self.stage(AppendEntry::Row {
                    position,
                    row: row.clone(),
                });
                Ok(true)
            }
            LogOperation::Delete { .. } => {
                if idx >= len {
                    return Err(AtlasError::WalCorruption(format!(
                        "record {} deletes unknown row {} of '{}'",
                        lsn, idx, self.table
                    )));
                }
                if self.rows[idx].is_none() {
                    return Ok(false);
                }
                self.delete(position)?;
                Ok(true)
            }
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn live_rows(&self) -> u64 {
        self.live_rows
    }

    pub fn stats(&self) -> AppendStoreStats {
        let total_rows = self.rows.len() as u64;
        AppendStoreStats {
            live_rows: self.live_rows,
            tombstones: total_rows - self.live_rows,
            total_rows,
            scan_density: if total_rows == 0 {
                1.0
            } else {
                self.live_rows as f64 / total_rows as f64
            },
            frames_written: self.frames_written,
            syncs: self.syncs,
        }
    }
}

impl std::fmt::Debug for AppendStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendStore")
            .field("table", &self.table)
            .field("rows", &self.rows.len())
            .field("live_rows", &self.live_rows)
            .finish()
    }
}
