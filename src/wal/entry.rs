//! WAL frame definitions
//!
//! Defines the on-disk structure of individual log records and of the WAL
//! file header.

use crate::error::{AtlasError, Result};

/// Magic bytes identifying an AtlasDB WAL file
pub const WAL_MAGIC: &[u8; 4] = b"AWAL";

/// Current WAL format version
pub const WAL_VERSION: u16 = 1;

/// File header size: Magic (4) + Version (2) + StartLSN (8) = 14 bytes
pub const FILE_HEADER_SIZE: usize = 14;

/// Frame header size: LSN (8) + Kind (1) + Len (4) + CRC (4) = 17 bytes
pub const HEADER_SIZE: usize = 17;

/// Upper bound on a single payload; larger lengths are treated as garbage
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Kind of a log record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// An operation payload
    Data = 1,
    /// Closes one submission; payload is the number of data records in it
    Commit = 2,
}

impl RecordKind {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(RecordKind::Data),
            2 => Some(RecordKind::Commit),
            _ => None,
        }
    }
}

/// A single record in the WAL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Log Sequence Number - monotonically increasing
    pub lsn: u64,

    pub kind: RecordKind,

    /// Opaque payload (possibly encrypted for data records)
    pub payload: Vec<u8>,
}

/// Result of parsing one frame from a byte buffer
#[derive(Debug)]
pub enum FrameParse {
    /// A valid frame and the number of bytes it occupies
    Complete(LogRecord, usize),
    /// The buffer ends inside the frame (torn write)
    Incomplete,
    /// The frame is present but fails validation
    Corrupt(String),
}

impl LogRecord {
    pub fn data(lsn: u64, payload: Vec<u8>) -> Self {
        Self {
            lsn,
            kind: RecordKind::Data,
            payload,
        }
    }

    /// Commit marker closing a submission of `record_count` data records
    pub fn commit(lsn: u64, record_count: u32) -> Self {
        Self {
            lsn,
            kind: RecordKind::Commit,
            payload: record_count.to_le_bytes().to_vec(),
        }
    }

    /// Number of data records a commit marker closes
    pub fn commit_count(&self) -> Option<u32> {
        if self.kind != RecordKind::Commit || self.payload.len() != 4 {
            return None;
        }
        let bytes: [u8; 4] = self.payload[..].try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// CRC over LSN, kind, length and payload
    pub fn compute_crc(&self) -> u32 {
        crc_of(self.lsn, self.kind as u8, &self.payload)
    }

    /// Append the encoded frame to `buf`
    ///
    /// Format: [LSN: u64][Kind: u8][Len: u32][CRC: u32][Payload]
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.compute_crc().to_le_bytes());
        buf.extend_from_slice(&self.payload);
    }

    /// Encode as a standalone frame
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode a frame that must be complete and valid
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        match Self::parse(bytes) {
            FrameParse::Complete(record, _) => Ok(record),
            FrameParse::Incomplete => Err(AtlasError::WalCorruption(format!(
                "incomplete frame ({} bytes)",
                bytes.len()
            ))),
            FrameParse::Corrupt(reason) => Err(AtlasError::WalCorruption(reason)),
        }
    }

    /// Parse the frame at the start of `bytes`
    pub fn parse(bytes: &[u8]) -> FrameParse {
        if bytes.len() < HEADER_SIZE {
            return FrameParse::Incomplete;
        }

        let lsn = u64::from_le_bytes(read_array(&bytes[0..8]));
        let kind_byte = bytes[8];
        let len = u32::from_le_bytes(read_array(&bytes[9..13])) as usize;
        let stored_crc = u32::from_le_bytes(read_array(&bytes[13..17]));

        let kind = match RecordKind::from_u8(kind_byte) {
            Some(kind) => kind,
            None => return FrameParse::Corrupt(format!("unknown record kind {} at lsn {}", kind_byte, lsn)),
        };

        if len > MAX_PAYLOAD_SIZE {
            return FrameParse::Corrupt(format!("implausible payload length {} at lsn {}", len, lsn));
        }

        if bytes.len() < HEADER_SIZE + len {
            return FrameParse::Incomplete;
        }

        let payload = &bytes[HEADER_SIZE..HEADER_SIZE + len];
        let computed = crc_of(lsn, kind_byte, payload);
        if computed != stored_crc {
            return FrameParse::Corrupt(format!(
                "CRC mismatch at lsn {}: stored {:08x}, computed {:08x}",
                lsn, stored_crc, computed
            ));
        }

        FrameParse::Complete(
            LogRecord {
                lsn,
                kind,
                payload: payload.to_vec(),
            },
            HEADER_SIZE + len,
        )
    }
}

/// Encode the WAL file header
pub fn encode_file_header(start_lsn: u64) -> [u8; FILE_HEADER_SIZE] {
    let mut header = [0u8; FILE_HEADER_SIZE];
    header[0..4].copy_from_slice(WAL_MAGIC);
    header[4..6].copy_from_slice(&WAL_VERSION.to_le_bytes());
    header[6..14].copy_from_slice(&start_lsn.to_le_bytes());
    header
}

/// Decode the WAL file header, returning the start LSN
pub fn decode_file_header(bytes: &[u8]) -> Result<u64> {
    if bytes.len() < FILE_HEADER_SIZE {
        return Err(AtlasError::WalCorruption(format!(
            "file header truncated: {} bytes",
            bytes.len()
        )));
    }
    if &bytes[0..4] != WAL_MAGIC {
        return Err(AtlasError::WalCorruption(format!(
            "invalid WAL magic: {:?}",
            &bytes[0..4]
        )));
    }
    let version = u16::from_le_bytes(read_array(&bytes[4..6]));
    if version != WAL_VERSION {
        return Err(AtlasError::WalCorruption(format!(
            "unsupported WAL version: {}",
            version
        )));
    }
    Ok(u64::from_le_bytes(read_array(&bytes[6..14])))
}

fn crc_of(lsn: u64, kind: u8, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&lsn.to_le_bytes());
    hasher.update(&[kind]);
    hasher.update(&(payload.len() as u32).to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
