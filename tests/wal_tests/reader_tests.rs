//! Tests for WalReader
//!
//! These tests verify:
//! - Reading frames in order from a well-formed log
//! - Torn tails and corrupt frames are reported, not skipped
//! - The frame iterator stops at the first bad frame
//! - Header validation on open

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use atlasdb::wal::{
    encode_file_header, LogRecord, ReadOutcome, WalReader, FILE_HEADER_SIZE, HEADER_SIZE,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_path = temp_dir.path().join("test.wal");
    (temp_dir, wal_path)
}

/// Write a header and `records` verbatim
fn write_raw(path: &PathBuf, start_lsn: u64, records: &[LogRecord]) {
    let mut data = encode_file_header(start_lsn).to_vec();
    for record in records {
        record.encode_into(&mut data);
    }
    fs::write(path, data).unwrap();
}

// =============================================================================
// Read Tests
// =============================================================================

#[test]
fn test_read_empty_log() {
    let (_temp, wal_path) = setup_temp_wal();
    write_raw(&wal_path, 1, &[]);

    let mut reader = WalReader::open(&wal_path).unwrap();
    assert_eq!(reader.start_lsn(), 1);
    assert_eq!(reader.position(), FILE_HEADER_SIZE as u64);
    assert!(matches!(reader.next_frame(), ReadOutcome::End));
}

#[test]
fn test_read_in_order() {
    let (_temp, wal_path) = setup_temp_wal();
    write_raw(
        &wal_path,
        1,
        &[
            LogRecord::data(1, b"one".to_vec()),
            LogRecord::data(2, b"two".to_vec()),
            LogRecord::commit(3, 2),
        ],
    );

    let records: Vec<LogRecord> = WalReader::open(&wal_path).unwrap().frames().collect();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].payload, b"one");
    assert_eq!(records[1].payload, b"two");
    assert_eq!(records[2].commit_count(), Some(2));
}

#[test]
fn test_torn_tail() {
    let (_temp, wal_path) = setup_temp_wal();
    write_raw(&wal_path, 1, &[LogRecord::data(1, b"whole".to_vec())]);
    let torn = LogRecord::data(2, b"partial frame".to_vec()).serialize();
    let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
    file.write_all(&torn[..HEADER_SIZE + 3]).unwrap();

    let mut reader = WalReader::open(&wal_path).unwrap();
    assert!(matches!(reader.next_frame(), ReadOutcome::Frame(_)));
    let expected = (FILE_HEADER_SIZE + HEADER_SIZE + 5) as u64;
    match reader.next_frame() {
        ReadOutcome::Torn { offset } => assert_eq!(offset, expected),
        other => panic!("expected torn tail, got {:?}", other),
    }
    // The reader stays put
    assert_eq!(reader.position(), expected);
}

#[test]
fn test_corrupt_frame() {
    let (_temp, wal_path) = setup_temp_wal();
    write_raw(
        &wal_path,
        1,
        &[
            LogRecord::data(1, b"good".to_vec()),
            LogRecord::data(2, b"flipped".to_vec()),
            LogRecord::commit(3, 2),
        ],
    );
    let mut data = fs::read(&wal_path).unwrap();
    let offset = FILE_HEADER_SIZE + HEADER_SIZE + 4 + HEADER_SIZE;
    data[offset] ^= 0xFF;
    fs::write(&wal_path, data).unwrap();

    let mut reader = WalReader::open(&wal_path).unwrap();
    assert!(matches!(reader.next_frame(), ReadOutcome::Frame(_)));
    assert!(matches!(reader.next_frame(), ReadOutcome::Corrupt { .. }));

    let frames: Vec<LogRecord> = WalReader::open(&wal_path).unwrap().frames().collect();
    assert_eq!(frames.len(), 1);
}

#[test]
fn test_from_bytes() {
    let mut data = encode_file_header(4).to_vec();
    LogRecord::data(4, b"mem".to_vec()).encode_into(&mut data);

    let reader = WalReader::from_bytes(data).unwrap();
    assert_eq!(reader.start_lsn(), 4);
    assert_eq!(reader.frames().count(), 1);
}

// =============================================================================
// Header Tests
// =============================================================================

#[test]
fn test_open_rejects_foreign_file() {
    let (_temp, wal_path) = setup_temp_wal();
    fs::write(&wal_path, b"definitely not a write-ahead log").unwrap();
    assert!(WalReader::open(&wal_path).is_err());
}

#[test]
fn test_open_rejects_empty_file() {
    let (_temp, wal_path) = setup_temp_wal();
    fs::write(&wal_path, b"").unwrap();
    assert!(WalReader::open(&wal_path).is_err());
}
