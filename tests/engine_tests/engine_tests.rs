//! Tests for Engine
//!
//! These tests verify:
//! - Tables are created, listed, closed, reopened and dropped through the catalog
//! - Dropping a table does not wait for another table's batch
//! - The catalog survives reopen
//! - Committed statements that never reached the store are replayed after a crash
//! - Encrypted databases need their key
//! - Checkpoints flush tables and restart the WAL

use std::fs;

use atlasdb::{AtlasError, Config, Engine, StorageStrategy, TableState, Value};

use crate::{account, accounts, setup_temp_engine, test_config};

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_create_and_list_tables() {
    let (_temp, engine) = setup_temp_engine();
    engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();

    let mut events = accounts(StorageStrategy::AppendOnly);
    events.name = "events".to_string();
    engine.create_table(events).unwrap();

    assert_eq!(engine.table_names(), vec!["accounts", "events"]);
    assert!(engine.table("accounts").unwrap().is_open());
}

#[test]
fn test_duplicate_table_rejected() {
    let (_temp, engine) = setup_temp_engine();
    engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();

    let err = engine
        .create_table(accounts(StorageStrategy::Columnar))
        .unwrap_err();
    assert!(matches!(err, AtlasError::TableExists(ref name) if name == "accounts"));
}

#[test]
fn test_invalid_descriptor_rejected() {
    let (_temp, engine) = setup_temp_engine();
    let mut bad = accounts(StorageStrategy::PageBased);
    bad.name = "no spaces".to_string();
    assert!(matches!(engine.create_table(bad), Err(AtlasError::Config(_))));

    let unknown = accounts(StorageStrategy::PageBased).with_index("missing", false);
    assert!(matches!(
        engine.create_table(unknown),
        Err(AtlasError::SchemaMismatch(_))
    ));
    assert!(engine.table_names().is_empty());
}

#[test]
fn test_missing_table() {
    let (_temp, engine) = setup_temp_engine();
    assert!(matches!(
        engine.table("ghost"),
        Err(AtlasError::TableNotFound(_))
    ));
    assert!(matches!(
        engine.drop_table("ghost"),
        Err(AtlasError::TableNotFound(_))
    ));
}

#[test]
fn test_close_and_reopen_table() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    let pos = table.insert(account(1, "ada", 10.0)).unwrap();

    engine.close_table("accounts").unwrap();
    assert_eq!(table.state(), TableState::Closed);
    assert!(matches!(table.insert(account(2, "bob", 1.0)), Err(AtlasError::TableClosed(_))));
    assert!(matches!(table.get(pos), Err(AtlasError::TableClosed(_))));
    assert!(matches!(engine.table("accounts"), Err(AtlasError::TableClosed(_))));

    let reopened = engine.open_table("accounts").unwrap();
    assert_eq!(reopened.get(pos).unwrap(), Some(account(1, "ada", 10.0)));
    assert_eq!(
        reopened.lookup_positions("id", &Value::Int64(1)).unwrap(),
        Some(vec![pos])
    );
}

#[test]
fn test_drop_table_removes_file() {
    let (temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    table.insert(account(1, "ada", 1.0)).unwrap();

    let file = temp.path().join("tables").join("accounts.pages");
    assert!(file.exists());

    engine.drop_table("accounts").unwrap();
    assert!(!file.exists());
    assert!(engine.table_names().is_empty());
    assert!(matches!(table.get(atlasdb::RowPosition(0)), Err(AtlasError::TableClosed(_))));

    // The name can be reused
    engine.create_table(accounts(StorageStrategy::AppendOnly)).unwrap();
}

#[test]
fn test_drop_table_while_another_batch_open() {
    let (temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    let mut events = accounts(StorageStrategy::AppendOnly);
    events.name = "events".to_string();
    let events_table = engine.create_table(events.clone()).unwrap();
    events_table.insert(account(1, "ada", 1.0)).unwrap();
    drop(events_table);

    table.begin_batch().unwrap();
    table.insert(account(1, "ada", 0.0)).unwrap();

    let file = temp.path().join("tables").join("events.append");
    assert!(file.exists());
    engine.drop_table("events").unwrap();
    assert!(!file.exists());
    assert_eq!(engine.table_names(), vec!["accounts"]);

    // Reusing the name waits for the checkpoint the drop could not take
    assert!(matches!(
        engine.create_table(events.clone()),
        Err(AtlasError::BatchState(_))
    ));

    table.insert(account(2, "bob", 0.0)).unwrap();
    table.end_batch().unwrap();
    assert_eq!(table.len(), 2);

    let recreated = engine.create_table(events).unwrap();
    assert!(recreated.is_empty());
    drop(recreated);
    drop(table);
    engine.crash();

    let engine = Engine::open(test_config(temp.path())).unwrap();
    assert!(engine.table("events").unwrap().is_empty());
    assert_eq!(engine.table("accounts").unwrap().len(), 2);
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_catalog_survives_reopen() {
    let (temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::Columnar)).unwrap();
    for i in 0..5 {
        table.insert(account(i, "ada", i as f64)).unwrap();
    }
    drop(table);
    engine.close().unwrap();

    let engine = Engine::open(test_config(temp.path())).unwrap();
    assert_eq!(engine.table_names(), vec!["accounts"]);
    let table = engine.table("accounts").unwrap();
    assert_eq!(table.descriptor().strategy, StorageStrategy::Columnar);
    assert_eq!(table.len(), 5);
    assert_eq!(table.snapshot().unwrap().sum("balance").unwrap(), 10.0);
    assert_eq!(engine.replay_report().operations, 0);
}

#[test]
fn test_crash_recovery_replays_wal() {
    let (temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    let mut positions = Vec::new();
    for i in 0..20 {
        positions.push(table.insert(account(i, "ada", i as f64)).unwrap());
    }
    table.update(positions[3], account(3, "ada", 300.0)).unwrap();
    table.delete(positions[7]).unwrap();
    drop(table);
    engine.crash();

    let engine = Engine::open(test_config(temp.path())).unwrap();
    let report = engine.replay_report();
    assert_eq!(report.operations, 22);
    assert_eq!(report.applied, 22);
    assert_eq!(report.skipped, 0);

    let table = engine.table("accounts").unwrap();
    assert_eq!(table.len(), 19);
    assert_eq!(table.get(positions[3]).unwrap(), Some(account(3, "ada", 300.0)));
    assert_eq!(table.get(positions[7]).unwrap(), None);
    table.verify_indexes().unwrap();
}

#[test]
fn test_crash_recovery_append_only() {
    let (temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::AppendOnly)).unwrap();
    for i in 0..10 {
        table.insert(account(i, "bob", 1.0)).unwrap();
    }
    drop(table);
    engine.crash();

    let engine = Engine::open(test_config(temp.path())).unwrap();
    let table = engine.table("accounts").unwrap();
    assert_eq!(table.len(), 10);
    assert_eq!(table.lookup("owner", &Value::from("bob")).unwrap().len(), 10);
}

#[test]
fn test_replay_is_idempotent() {
    let (temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    for i in 0..10 {
        table.insert(account(i, "ada", 0.0)).unwrap();
    }
    table.flush().unwrap();
    drop(table);
    engine.crash();

    // Everything was already on the pages; the log only confirms it
    let engine = Engine::open(test_config(temp.path())).unwrap();
    assert_eq!(engine.replay_report().operations, 10);
    assert_eq!(engine.replay_report().applied, 0);
    assert_eq!(engine.table("accounts").unwrap().len(), 10);
}

#[test]
fn test_clean_close_leaves_nothing_to_replay() {
    let (temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    table.insert(account(1, "ada", 0.0)).unwrap();
    drop(table);
    engine.close().unwrap();

    let engine = Engine::open(test_config(temp.path())).unwrap();
    assert_eq!(engine.replay_report().operations, 0);
    assert_eq!(engine.table("accounts").unwrap().len(), 1);
}

// =============================================================================
// Encryption Tests
// =============================================================================

fn encrypted_config(dir: &std::path::Path, key: [u8; 32]) -> Config {
    Config::builder()
        .data_dir(dir)
        .page_cache_capacity(64)
        .encryption_key(key)
        .build()
}

#[test]
fn test_encrypted_database() {
    crate::init_tracing();
    let temp = tempfile::TempDir::new().unwrap();
    let engine = Engine::open(encrypted_config(temp.path(), [9u8; 32])).unwrap();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    table.insert(account(1, "secret-owner", 5.0)).unwrap();
    drop(table);
    engine.crash();

    for entry in ["wal.log", "tables/accounts.pages"] {
        let raw = fs::read(temp.path().join(entry)).unwrap();
        assert!(
            !raw.windows(12).any(|w| w == b"secret-owner"),
            "{} holds plaintext",
            entry
        );
    }

    let engine = Engine::open(encrypted_config(temp.path(), [9u8; 32])).unwrap();
    assert_eq!(engine.table("accounts").unwrap().len(), 1);
    engine.close().unwrap();

    let err = Engine::open(encrypted_config(temp.path(), [8u8; 32])).unwrap_err();
    assert!(matches!(err, AtlasError::AuthenticationFailure(_)), "got {:?}", err);
}

// =============================================================================
// Checkpoint Tests
// =============================================================================

#[test]
fn test_checkpoint_flushes_and_truncates() {
    let (temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    for i in 0..10 {
        table.insert(account(i, "ada", 0.0)).unwrap();
    }
    let wal_len = fs::metadata(temp.path().join("wal.log")).unwrap().len();

    let start_lsn = engine.checkpoint().unwrap();
    assert!(start_lsn > 1);
    assert!(fs::metadata(temp.path().join("wal.log")).unwrap().len() < wal_len);
    assert!(matches!(
        &table.stats().store,
        atlasdb::table::StoreStats::Paged(stats) if stats.dirty_pages == 0
    ));

    drop(table);
    engine.crash();
    let engine = Engine::open(test_config(temp.path())).unwrap();
    assert_eq!(engine.replay_report().operations, 0);
    assert_eq!(engine.table("accounts").unwrap().len(), 10);
}

#[test]
fn test_checkpoint_refused_during_batch() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    table.begin_batch().unwrap();
    table.insert(account(1, "ada", 0.0)).unwrap();

    assert!(matches!(engine.checkpoint(), Err(AtlasError::BatchState(_))));
    table.end_batch().unwrap();
    engine.checkpoint().unwrap();
}
