//! WAL Reader
//!
//! Handles reading frames from the WAL file. The reader never modifies the
//! file; deciding what to keep is left to [`super::WalRecovery`].

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::Result;

use super::entry::{decode_file_header, FrameParse, LogRecord, FILE_HEADER_SIZE};

/// Outcome of reading one frame
#[derive(Debug)]
pub enum ReadOutcome {
    /// A frame that passed its checksum
    Frame(LogRecord),
    /// Clean end of the log
    End,
    /// The log ends in a partial frame at `offset`
    Torn { offset: u64 },
    /// The frame at `offset` is present but invalid
    Corrupt { offset: u64, reason: String },
}

/// Reads frames from the WAL file
pub struct WalReader {
    data: Vec<u8>,
    position: usize,
    start_lsn: u64,
}

impl WalReader {
    /// Open a WAL file for reading and validate its header
    pub fn open(path: &Path) -> Result<Self> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        Self::from_bytes(data)
    }

    /// Read frames from an in-memory copy of a WAL file
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let start_lsn = decode_file_header(&data)?;
        Ok(Self {
            data,
            position: FILE_HEADER_SIZE,
            start_lsn,
        })
    }

    /// LSN recorded in the file header
    pub fn start_lsn(&self) -> u64 {
        self.start_lsn
    }

    /// Byte offset of the next frame
    pub fn position(&self) -> u64 {
        self.position as u64
    }

    pub fn file_len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Read the next frame from the WAL
    ///
    /// After a `Torn` or `Corrupt` outcome the reader stays where it is.
    pub fn next_frame(&mut self) -> ReadOutcome {
        let rest = &self.data[self.position..];
        if rest.is_empty() {
            return ReadOutcome::End;
        }

        match LogRecord::parse(rest) {
            FrameParse::Complete(record, consumed) => {
                self.position += consumed;
                ReadOutcome::Frame(record)
            }
            FrameParse::Incomplete => ReadOutcome::Torn {
                offset: self.position as u64,
            },
            FrameParse::Corrupt(reason) => ReadOutcome::Corrupt {
                offset: self.position as u64,
                reason,
            },
        }
    }

    /// Iterate over all valid frames, stopping at the first bad one
    pub fn frames(self) -> WalIterator {
        WalIterator {
            reader: self,
            done: false,
        }
    }
}

/// Iterator over WAL frames
pub struct WalIterator {
    reader: WalReader,
    done: bool,
}

impl Iterator for WalIterator {
    type Item = LogRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_frame() {
            ReadOutcome::Frame(record) => Some(record),
            _ => {
                self.done = true;
                None
            }
        }
    }
}
