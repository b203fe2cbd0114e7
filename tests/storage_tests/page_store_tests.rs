//! Tests for PageStore
//!
//! These tests verify:
//! - Row insert, get, update (in place and moved), delete and scan
//! - Dirty pages reach disk only on flush or eviction
//! - A small cache evicts with CLOCK and writes dirty victims back
//! - Units roll back page changes and report the pages they touched
//! - Batch units larger than the cache spill instead of failing
//! - Detached units can be finished or undone later
//! - Damaged, zeroed or missing pages are recorded at open and fail reads
//! - Checksums and encryption reject damaged or foreign pages
//! - Redo is idempotent by page LSN

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use atlasdb::storage::{Page, PageStore, SpillFile};
use atlasdb::wal::LogOperation;
use atlasdb::{AesGcmCipher, AtlasError, Cipher, ErrorKind, RowPosition};
use bytes::Bytes;
use tempfile::TempDir;

use crate::{people_schema, person};

// =============================================================================
// Helper Functions
// =============================================================================

const PAGE_SIZE: usize = 4096;

fn setup_temp_store(cache_pages: usize) -> (TempDir, PathBuf, PageStore) {
    crate::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("people.pages");
    let store = PageStore::create(&path, "people", people_schema(), PAGE_SIZE, cache_pages, None).unwrap();
    (temp_dir, path, store)
}

fn reopen(path: &PathBuf, cipher: Option<Arc<dyn Cipher>>) -> atlasdb::Result<PageStore> {
    PageStore::open(path, people_schema(), 64, cipher)
}

fn cipher(byte: u8) -> Arc<dyn Cipher> {
    Arc::new(AesGcmCipher::new(&[byte; 32]).unwrap())
}

/// Insert enough rows to fill several pages
fn fill(store: &mut PageStore, count: i64) -> Vec<RowPosition> {
    (0..count)
        .map(|i| store.insert(&person(i, &format!("person-{:05}", i), Some(i as f64))).unwrap())
        .collect()
}

/// Name of a fixed width, so updates between fillers stay in place
fn wide_name(i: i64, filler: char) -> String {
    format!("person-{:05}-{}", i, filler.to_string().repeat(100))
}

fn fill_wide(store: &mut PageStore, count: i64) -> Vec<RowPosition> {
    (0..count)
        .map(|i| store.insert(&person(i, &wide_name(i, 'a'), None)).unwrap())
        .collect()
}

/// Overwrite data page `page_id` with zeros
fn zero_page(path: &PathBuf, page_id: u64) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(page_id * PAGE_SIZE as u64)).unwrap();
    file.write_all(&vec![0u8; PAGE_SIZE]).unwrap();
    file.sync_all().unwrap();
}

// =============================================================================
// Row Operation Tests
// =============================================================================

#[test]
fn test_insert_and_get() {
    let (_temp, _path, mut store) = setup_temp_store(16);

    let pos = store.insert(&person(1, "ada", Some(9.5))).unwrap();
    assert_eq!(pos.page_id(), 1);
    assert_eq!(pos.slot(), 0);
    assert_eq!(store.get(pos).unwrap(), Some(person(1, "ada", Some(9.5))));
    assert_eq!(store.live_rows(), 1);
}

#[test]
fn test_rows_span_pages() {
    let (_temp, _path, mut store) = setup_temp_store(64);
    let positions = fill(&mut store, 1000);

    assert!(store.page_count() > 1);
    let scanned = store.scan().unwrap();
    assert_eq!(scanned.len(), 1000);
    for (i, pos) in positions.iter().enumerate() {
        let row = store.get(*pos).unwrap().unwrap();
        assert_eq!(row, person(i as i64, &format!("person-{:05}", i), Some(i as f64)));
    }
}

#[test]
fn test_update_in_place_keeps_position() {
    let (_temp, _path, mut store) = setup_temp_store(16);
    let pos = store.insert(&person(1, "ada", Some(1.0))).unwrap();

    let after = store.update(pos, &person(1, "bob", Some(2.0))).unwrap();
    assert_eq!(after, pos);
    assert_eq!(store.get(pos).unwrap(), Some(person(1, "bob", Some(2.0))));
    assert_eq!(store.live_rows(), 1);
}

#[test]
fn test_growing_update_moves_row() {
    let (_temp, _path, mut store) = setup_temp_store(16);
    let positions = fill(&mut store, 300);
    let first = positions[0];
    assert_eq!(first.page_id(), 1);

    // Far bigger than the free space left in a full page
    let long_name = "x".repeat(3000);
    let moved = store.update(first, &person(0, &long_name, None)).unwrap();

    assert_ne!(moved, first);
    assert_eq!(store.get(first).unwrap(), None);
    assert_eq!(store.get(moved).unwrap(), Some(person(0, &long_name, None)));
    assert_eq!(store.live_rows(), 300);
}

#[test]
fn test_delete() {
    let (_temp, _path, mut store) = setup_temp_store(16);
    let a = store.insert(&person(1, "a", None)).unwrap();
    let b = store.insert(&person(2, "b", None)).unwrap();

    assert_eq!(store.delete(a).unwrap(), person(1, "a", None));
    assert_eq!(store.get(a).unwrap(), None);
    assert_eq!(store.get(b).unwrap(), Some(person(2, "b", None)));
    assert_eq!(store.live_rows(), 1);

    assert!(matches!(store.delete(a), Err(AtlasError::InvalidPosition(_))));
}

#[test]
fn test_row_too_large() {
    let (_temp, _path, mut store) = setup_temp_store(16);
    let err = store.insert(&person(1, &"y".repeat(PAGE_SIZE), None)).unwrap_err();
    assert!(matches!(err, AtlasError::RowTooLarge { .. }));
    assert_eq!(store.page_count(), 0);
}

#[test]
fn test_invalid_positions() {
    let (_temp, _path, mut store) = setup_temp_store(16);
    store.insert(&person(1, "a", None)).unwrap();

    assert_eq!(store.get(RowPosition::from_page_slot(0, 0)).unwrap(), None);
    assert_eq!(store.get(RowPosition::from_page_slot(99, 0)).unwrap(), None);
    assert_eq!(store.get(RowPosition::from_page_slot(1, 40)).unwrap(), None);
    assert!(store.read(99).is_err());
    assert!(matches!(
        store.update(RowPosition::from_page_slot(99, 0), &person(1, "a", None)),
        Err(AtlasError::InvalidPosition(_))
    ));
}

#[test]
fn test_page_write_then_read() {
    let (_temp, _path, mut store) = setup_temp_store(16);
    let pos = store.insert(&person(1, "a", None)).unwrap();

    let before = store.read(pos.page_id()).unwrap();
    let mut modified = before.to_vec();
    modified[PAGE_SIZE - 1] ^= 0xFF;
    store.write(pos.page_id(), Bytes::from(modified.clone())).unwrap();

    assert_eq!(store.read(pos.page_id()).unwrap(), Bytes::from(modified));
    assert!(store.dirty_pages().contains(&pos.page_id()));
    assert!(store.write(pos.page_id(), Bytes::from(vec![0u8; 10])).is_err());
}

// =============================================================================
// Flush / Cache Tests
// =============================================================================

#[test]
fn test_dirty_until_flush() {
    let (_temp, path, mut store) = setup_temp_store(64);
    fill(&mut store, 500);
    let dirty = store.dirty_pages().len();
    assert_eq!(dirty as u32, store.page_count());

    let report = store.flush().unwrap();
    assert_eq!(report.pages_written, dirty);
    assert_eq!(report.syncs, 1);
    assert!(store.dirty_pages().is_empty());

    // Nothing left to write
    assert_eq!(store.flush().unwrap().pages_written, 0);
    drop(store);

    let reopened = reopen(&path, None).unwrap();
    assert_eq!(reopened.live_rows(), 500);
    assert_eq!(reopened.scan().unwrap().len(), 500);
}

#[test]
fn test_small_cache_evicts_and_writes_back() {
    let (_temp, path, mut store) = setup_temp_store(2);
    let positions = fill(&mut store, 1000);
    assert!(store.page_count() > 2);

    let stats = store.stats();
    assert!(stats.cached_pages <= 2);
    assert!(stats.cache.evictions > 0);
    assert!(stats.cache.writebacks > 0);

    // Evicted pages come back from disk intact
    for (i, pos) in positions.iter().enumerate().step_by(97) {
        let row = store.get(*pos).unwrap().unwrap();
        assert_eq!(row.values[0], atlasdb::Value::Int64(i as i64));
    }

    store.flush().unwrap();
    drop(store);
    assert_eq!(reopen(&path, None).unwrap().live_rows(), 1000);
}

#[test]
fn test_unflushed_rows_lost_without_log() {
    let (_temp, path, mut store) = setup_temp_store(64);
    store.insert(&person(1, "durable", None)).unwrap();
    store.flush().unwrap();
    store.insert(&person(2, "volatile", None)).unwrap();
    drop(store);

    let reopened = reopen(&path, None).unwrap();
    assert_eq!(reopened.live_rows(), 1);
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn test_rollback_unit() {
    let (_temp, _path, mut store) = setup_temp_store(16);
    let keep = store.insert(&person(1, "keep", None)).unwrap();

    store.begin_unit().unwrap();
    assert!(matches!(store.begin_unit(), Err(AtlasError::BatchState(_))));
    store.update(keep, &person(1, "changed", None)).unwrap();
    fill(&mut store, 400);
    store.delete(keep).unwrap();
    store.rollback_unit();

    assert!(!store.in_unit());
    assert_eq!(store.live_rows(), 1);
    assert_eq!(store.page_count(), 1);
    assert_eq!(store.get(keep).unwrap(), Some(person(1, "keep", None)));
}

#[test]
fn test_commit_unit_reports_touched_pages() {
    let (_temp, _path, mut store) = setup_temp_store(64);
    let positions = fill(&mut store, 600);
    store.flush().unwrap();

    let first_page = positions[0].page_id();
    let last_page = positions[599].page_id();
    assert_ne!(first_page, last_page);

    store.begin_unit().unwrap();
    store.update(positions[0], &person(0, "person-AAAAA", None)).unwrap();
    store.update(positions[599], &person(599, "person-ZZZZZ", None)).unwrap();
    let touched = store.commit_unit(Some(42)).unwrap();
    assert_eq!(touched, vec![first_page, last_page]);

    let report = store.flush_pages(&touched).unwrap();
    assert_eq!(report.pages_written, 2);
    assert!(store.dirty_pages().is_empty());

    let page = store.read(first_page).unwrap();
    assert_eq!(atlasdb::storage::Page::view(&page[..]).lsn(), 42);
}

#[test]
fn test_unit_larger_than_cache() {
    let (_temp, _path, mut store) = setup_temp_store(2);

    store.begin_unit().unwrap();
    let mut result = Ok(RowPosition(0));
    for i in 0..2000 {
        result = store.insert(&person(i, &format!("person-{:05}", i), None));
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(result, Err(AtlasError::CapacityExceeded(_))));
    store.rollback_unit();
    assert_eq!(store.live_rows(), 0);
}

#[test]
fn test_batch_unit_larger_than_cache() {
    let (_temp, path, mut store) = setup_temp_store(16);
    let positions = fill_wide(&mut store, 2000);
    store.flush().unwrap();
    let pages = store.page_count();
    assert!(pages > 32, "only {} pages", pages);

    store.begin_batch_unit().unwrap();
    for (i, pos) in positions.iter().enumerate() {
        let i = i as i64;
        let moved = store.update(*pos, &person(i, &wide_name(i, 'b'), None)).unwrap();
        assert_eq!(moved, *pos);
    }
    let touched = store.commit_unit(Some(77)).unwrap();
    assert_eq!(touched.len() as u32, pages);
    assert!(store.stats().spill_writes > 0);

    // Each distinct page reaches the page file once
    let report = store.flush_pages(&touched).unwrap();
    assert_eq!(report.pages_written, touched.len());
    assert_eq!(report.syncs, 1);
    assert!(!SpillFile::path_for(&path).exists());

    for (i, pos) in positions.iter().enumerate().step_by(37) {
        let i = i as i64;
        assert_eq!(store.get(*pos).unwrap(), Some(person(i, &wide_name(i, 'b'), None)));
    }
    drop(store);

    let reopened = reopen(&path, None).unwrap();
    assert_eq!(reopened.live_rows(), 2000);
    let page = reopened.read(1).unwrap();
    assert_eq!(Page::view(&page[..]).lsn(), 77);
    for (i, pos) in positions.iter().enumerate() {
        let i = i as i64;
        assert_eq!(reopened.get(*pos).unwrap(), Some(person(i, &wide_name(i, 'b'), None)));
    }
}

#[test]
fn test_batch_unit_rollback_discards_spill() {
    let (_temp, path, mut store) = setup_temp_store(16);
    let positions = fill_wide(&mut store, 2000);
    store.flush().unwrap();
    let pages = store.page_count();

    store.begin_batch_unit().unwrap();
    for (i, pos) in positions.iter().enumerate() {
        let i = i as i64;
        store.update(*pos, &person(i, &wide_name(i, 'c'), None)).unwrap();
    }
    fill_wide(&mut store, 100);
    assert!(store.stats().spill_writes > 0);
    store.rollback_unit();

    assert!(!SpillFile::path_for(&path).exists());
    assert_eq!(store.page_count(), pages);
    assert_eq!(store.live_rows(), 2000);
    for (i, pos) in positions.iter().enumerate().step_by(41) {
        let i = i as i64;
        assert_eq!(store.get(*pos).unwrap(), Some(person(i, &wide_name(i, 'a'), None)));
    }

    // The page file never saw the aborted images
    store.flush().unwrap();
    drop(store);
    let reopened = reopen(&path, None).unwrap();
    let rows = reopened.scan().unwrap();
    assert_eq!(rows.len(), 2000);
    assert!(rows.iter().all(|(_, row)| {
        matches!(&row.values[1], atlasdb::Value::Text(name) if name.ends_with('a'))
    }));
}

#[test]
fn test_detached_units_undo_newest_first() {
    let (_temp, _path, mut store) = setup_temp_store(16);
    let a = store.insert(&person(1, "a", None)).unwrap();
    let b = store.insert(&person(2, "b", None)).unwrap();

    store.begin_unit().unwrap();
    store.update(a, &person(1, "a2", None)).unwrap();
    let first = store.detach_unit().unwrap();
    assert!(!store.in_unit());

    store.begin_unit().unwrap();
    store.delete(b).unwrap();
    store.insert(&person(3, "c", None)).unwrap();
    let second = store.detach_unit().unwrap();
    assert_eq!(store.live_rows(), 2);

    store.undo_unit(second);
    store.undo_unit(first);
    assert_eq!(store.get(a).unwrap(), Some(person(1, "a", None)));
    assert_eq!(store.get(b).unwrap(), Some(person(2, "b", None)));
    assert_eq!(store.live_rows(), 2);
}

#[test]
fn test_detached_unit_finished_later() {
    let (_temp, _path, mut store) = setup_temp_store(16);
    store.begin_unit().unwrap();
    let pos = store.insert(&person(1, "a", None)).unwrap();
    let undo = store.detach_unit().unwrap();

    let touched = store.finish_unit(undo, Some(9)).unwrap();
    assert_eq!(touched, vec![pos.page_id()]);
    let page = store.read(pos.page_id()).unwrap();
    assert_eq!(Page::view(&page[..]).lsn(), 9);
    assert_eq!(store.get(pos).unwrap(), Some(person(1, "a", None)));
}

#[test]
fn test_cached_read_is_a_hit() {
    let (_temp, _path, mut store) = setup_temp_store(16);
    let pos = store.insert(&person(1, "a", None)).unwrap();
    let before = store.stats().cache;

    store.read(pos.page_id()).unwrap();
    store.read(pos.page_id()).unwrap();

    let after = store.stats().cache;
    assert_eq!(after.hits - before.hits, 2);
    assert_eq!(after.misses, before.misses);
}

// =============================================================================
// Corruption / Encryption Tests
// =============================================================================

#[test]
fn test_flipped_byte_is_storage_corruption() {
    let (_temp, path, mut store) = setup_temp_store(16);
    fill(&mut store, 20);
    store.flush().unwrap();
    drop(store);

    let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    let offset = PAGE_SIZE as u64 + (PAGE_SIZE as u64 - 10);
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).unwrap();
    std::io::Read::read_exact(&mut file, &mut byte).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[byte[0] ^ 0x01]).unwrap();
    file.sync_all().unwrap();

    let store = reopen(&path, None).unwrap();
    assert_eq!(store.damaged_pages(), vec![1]);
    assert_eq!(store.stats().damaged_pages, 1);
    let err = store.read(1).unwrap_err();
    assert!(matches!(err, AtlasError::StorageCorruption { .. }), "got {:?}", err);
    assert_eq!(err.kind(), ErrorKind::Corruption);
}

#[test]
fn test_damaged_page_leaves_other_pages_usable() {
    let (_temp, path, mut store) = setup_temp_store(16);
    let positions = fill(&mut store, 1000);
    store.flush().unwrap();
    let pages = store.page_count();
    drop(store);
    zero_page(&path, 2);

    let mut store = reopen(&path, None).unwrap();
    assert_eq!(store.damaged_pages(), vec![2]);

    let on_page_two = positions.iter().find(|p| p.page_id() == 2).unwrap();
    let on_page_one = positions.iter().find(|p| p.page_id() == 1).unwrap();
    assert!(matches!(
        store.get(*on_page_two),
        Err(AtlasError::StorageCorruption { .. })
    ));
    assert!(store.get(*on_page_one).unwrap().is_some());
    assert!(matches!(store.scan(), Err(AtlasError::StorageCorruption { .. })));

    let intact = store.scan_intact().unwrap();
    assert!(intact.iter().all(|(pos, _)| pos.page_id() != 2));
    assert_eq!(intact.len() as u64, store.live_rows());

    // New rows never land on the damaged page
    let pos = store.insert(&person(5000, "new", None)).unwrap();
    assert_ne!(pos.page_id(), 2);
    assert!(store.page_count() >= pages);
}

#[test]
fn test_zeroed_page_is_storage_corruption() {
    let (_temp, path, mut store) = setup_temp_store(16);
    fill(&mut store, 400);
    store.flush().unwrap();
    drop(store);
    zero_page(&path, 1);

    // Page 1 was written and synced, so zeros are damage, not an empty page
    let store = reopen(&path, None).unwrap();
    assert_eq!(store.damaged_pages(), vec![1]);
    let err = store.read(1).unwrap_err();
    assert!(matches!(err, AtlasError::StorageCorruption { .. }), "got {:?}", err);
}

#[test]
fn test_truncated_page_is_storage_corruption() {
    let (_temp, path, mut store) = setup_temp_store(16);
    fill(&mut store, 400);
    store.flush().unwrap();
    let last = store.page_count();
    drop(store);

    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(u64::from(last) * PAGE_SIZE as u64).unwrap();
    drop(file);

    let store = reopen(&path, None).unwrap();
    assert_eq!(store.page_count(), last);
    assert_eq!(store.damaged_pages(), vec![last]);
    assert!(matches!(
        store.read(last),
        Err(AtlasError::StorageCorruption { .. })
    ));
}

#[test]
fn test_foreign_file_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("junk.pages");
    fs::write(&path, vec![0x5Au8; PAGE_SIZE * 2]).unwrap();
    assert!(reopen(&path, None).is_err());
}

#[test]
fn test_encrypted_pages() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("secret.pages");
    let mut store =
        PageStore::create(&path, "secret", people_schema(), PAGE_SIZE, 16, Some(cipher(1))).unwrap();
    store.insert(&person(1, "plaintext-marker", None)).unwrap();
    store.flush().unwrap();
    drop(store);

    let raw = fs::read(&path).unwrap();
    assert!(!raw.windows(16).any(|w| w == b"plaintext-marker"));

    let reopened = reopen(&path, Some(cipher(1))).unwrap();
    assert_eq!(reopened.live_rows(), 1);

    let err = reopen(&path, Some(cipher(2))).unwrap_err();
    assert!(matches!(err, AtlasError::AuthenticationFailure(_)));

    assert!(reopen(&path, None).is_err());
}

// =============================================================================
// Redo Tests
// =============================================================================

#[test]
fn test_redo_skips_applied_lsns() {
    let (_temp, path, mut store) = setup_temp_store(16);
    store.begin_unit().unwrap();
    let pos = store.insert(&person(1, "a", None)).unwrap();
    store.commit_unit(Some(10)).unwrap();
    store.flush().unwrap();
    drop(store);

    let mut store = reopen(&path, None).unwrap();
    let insert = LogOperation::Insert {
        table: "people".to_string(),
        position: pos,
        row: person(1, "a", None),
    };
    assert!(!store.redo(&insert, 10).unwrap());

    let update = LogOperation::Update {
        table: "people".to_string(),
        position: pos,
        row: person(1, "b", None),
    };
    assert!(store.redo(&update, 11).unwrap());
    assert!(!store.redo(&update, 11).unwrap());
    assert_eq!(store.get(pos).unwrap(), Some(person(1, "b", None)));
}

#[test]
fn test_redo_allocates_missing_pages() {
    let (_temp, _path, mut store) = setup_temp_store(16);
    let pos = RowPosition::from_page_slot(3, 2);
    let insert = LogOperation::Insert {
        table: "people".to_string(),
        position: pos,
        row: person(7, "late", None),
    };

    assert!(store.redo(&insert, 5).unwrap());
    assert_eq!(store.page_count(), 3);
    assert_eq!(store.get(pos).unwrap(), Some(person(7, "late", None)));
    assert_eq!(store.live_rows(), 1);

    let delete = LogOperation::Delete {
        table: "people".to_string(),
        position: pos,
    };
    assert!(store.redo(&delete, 6).unwrap());
    assert_eq!(store.live_rows(), 0);
}
