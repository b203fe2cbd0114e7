//! WAL Writer
//!
//! Handles appending frames to the WAL file. The writer is owned by the group
//! commit worker; nothing else touches the file while the engine is open.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::crypto::Cipher;
use crate::error::{AtlasError, Result};

use super::entry::{decode_file_header, encode_file_header, LogRecord, RecordKind, FILE_HEADER_SIZE};

/// Writes frames to the WAL file
pub struct WalWriter {
    path: PathBuf,
    file: File,

    /// Next LSN to hand out
    next_lsn: u64,

    /// End of the last successful write
    write_offset: u64,

    /// End of the last acknowledged batch; failed batches roll back to here
    durable_offset: u64,

    /// End of the last successful sync
    synced_offset: u64,

    /// LSN that will be assigned after the durable prefix
    durable_next_lsn: u64,

    /// Optional encryption of data payloads
    cipher: Option<Arc<dyn Cipher>>,
}

impl WalWriter {
    /// Create a fresh, empty WAL whose first record will get `start_lsn`
    ///
    /// Any existing file at `path` is replaced.
    pub fn create(path: &Path, start_lsn: u64, cipher: Option<Arc<dyn Cipher>>) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        file.write_all(&encode_file_header(start_lsn))?;
        file.sync_all()?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            next_lsn: start_lsn,
            write_offset: FILE_HEADER_SIZE as u64,
            durable_offset: FILE_HEADER_SIZE as u64,
            synced_offset: FILE_HEADER_SIZE as u64,
            durable_next_lsn: start_lsn,
            cipher,
        })
    }

    /// Open an existing, already recovered WAL and continue at `next_lsn`
    ///
    /// Creates the file if it does not exist.
    pub fn open(path: &Path, next_lsn: u64, cipher: Option<Arc<dyn Cipher>>) -> Result<Self> {
        if !path.exists() {
            return Self::create(path, next_lsn, cipher);
        }

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < FILE_HEADER_SIZE as u64 {
            drop(file);
            return Self::create(path, next_lsn, cipher);
        }

        let mut header = [0u8; FILE_HEADER_SIZE];
        std::io::Read::read_exact(&mut file, &mut header)?;
        let start_lsn = decode_file_header(&header)?;
        if next_lsn < start_lsn {
            return Err(AtlasError::WalCorruption(format!(
                "next lsn {} precedes log start {}",
                next_lsn, start_lsn
            )));
        }

        file.seek(SeekFrom::Start(len))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            next_lsn,
            write_offset: len,
            durable_offset: len,
            synced_offset: len,
            durable_next_lsn: next_lsn,
            cipher,
        })
    }

    /// Assign the next LSN to a frame and append its encoding to `buf`
    ///
    /// Nothing touches the file; call [`WalWriter::write`] with the buffer.
    pub fn encode_frame(&mut self, kind: RecordKind, payload: &[u8], buf: &mut Vec<u8>) -> Result<u64> {
        let lsn = self.next_lsn;
        let payload = match (&self.cipher, kind) {
            (Some(cipher), RecordKind::Data) => cipher.encrypt(payload)?,
            _ => payload.to_vec(),
        };

        LogRecord { lsn, kind, payload }.encode_into(buf);
        self.next_lsn += 1;
        Ok(lsn)
    }

    /// Write `buf` as one contiguous write at the end of the log
    ///
    /// A retry after a failed write rewrites from the same offset.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.write_offset))?;
        self.file.write_all(buf)?;
        self.write_offset += buf.len() as u64;
        Ok(())
    }

    /// Force written frames to stable storage
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.synced_offset = self.write_offset;
        self.durable_offset = self.write_offset;
        self.durable_next_lsn = self.next_lsn;
        Ok(())
    }

    /// Treat everything written so far as acknowledged without syncing
    ///
    /// Used under relaxed durability, where a batch counts once written.
    pub fn acknowledge_written(&mut self) {
        self.durable_offset = self.write_offset;
        self.durable_next_lsn = self.next_lsn;
    }

    /// Cut the file back to the last acknowledged batch, keeping assigned LSNs
    ///
    /// Used before retrying a failed write so the same frames land at the
    /// same offset.
    pub fn truncate_to_durable(&mut self) -> Result<()> {
        self.write_offset = self.durable_offset;
        self.synced_offset = self.synced_offset.min(self.durable_offset);
        self.file.set_len(self.durable_offset)?;
        self.file.seek(SeekFrom::Start(self.durable_offset))?;
        Ok(())
    }

    /// Forget frames encoded or written after the last durable point
    ///
    /// Cuts the file back to the durable offset and rewinds the LSN counter.
    pub fn rollback_to_durable(&mut self) -> Result<()> {
        self.next_lsn = self.durable_next_lsn;
        self.truncate_to_durable()
    }

    /// Undo LSNs handed out by `encode_frame` for a batch that never hit the file
    pub fn discard_unwritten(&mut self, next_lsn: u64) {
        self.next_lsn = next_lsn;
    }

    /// Truncate the log to an empty file starting at the current LSN
    ///
    /// The new header is written over the old one before the file is cut, so
    /// a crash in between leaves stale frames whose LSNs precede the header
    /// and are discarded on recovery.
    pub fn reset(&mut self) -> Result<u64> {
        let start_lsn = self.next_lsn;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&encode_file_header(start_lsn))?;
        self.file.set_len(FILE_HEADER_SIZE as u64)?;
        self.file.sync_all()?;
        self.file.seek(SeekFrom::Start(FILE_HEADER_SIZE as u64))?;

        self.write_offset = FILE_HEADER_SIZE as u64;
        self.durable_offset = self.write_offset;
        self.synced_offset = self.write_offset;
        self.durable_next_lsn = start_lsn;
        Ok(start_lsn)
    }

    /// Whether written frames are waiting for a sync
    pub fn has_unsynced(&self) -> bool {
        self.write_offset != self.synced_offset
    }

    /// Get the next LSN to be assigned
    pub fn next_lsn(&self) -> u64 {
        self.next_lsn
    }

    /// Current end of the log file
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    pub fn durable_offset(&self) -> u64 {
        self.durable_offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
