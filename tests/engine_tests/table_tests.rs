//! Tests for Table
//!
//! These tests verify:
//! - Statements check schema, size and uniqueness before changing anything
//! - Predicates are answered through indexes when one exists
//! - Batches commit as one WAL submission and abort cleanly
//! - A failure inside a batch after mutation aborts the whole batch
//! - Index-disabled tables keep only the unique indexes
//! - Statements waiting on a failed WAL group are all undone

use atlasdb::{
    AtlasError, Config, Engine, ErrorKind, Predicate, RowPosition, StorageStrategy, Value,
};

use crate::{account, accounts, setup_temp_engine};

// =============================================================================
// Statement Tests
// =============================================================================

#[test]
fn test_insert_checks_schema() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();

    let wrong_type = atlasdb::Row::new(vec![
        Value::Text("one".into()),
        Value::Text("ada".into()),
        Value::Null,
    ]);
    let err = table.insert(wrong_type).unwrap_err();
    assert!(matches!(err, AtlasError::SchemaMismatch(_)));

    let short = atlasdb::Row::new(vec![Value::Int64(1)]);
    assert!(table.insert(short).is_err());
    assert!(table.is_empty());
}

#[test]
fn test_duplicate_key_leaves_no_trace() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    table.insert(account(1, "ada", 1.0)).unwrap();
    let lsn_before = engine.wal().durable_lsn();

    let err = table.insert(account(1, "eve", 2.0)).unwrap_err();
    assert!(matches!(err, AtlasError::DuplicateKey { ref index } if index == "accounts.id"));
    assert_eq!(err.kind(), ErrorKind::Constraint);

    assert_eq!(table.len(), 1);
    assert_eq!(engine.wal().durable_lsn(), lsn_before);
    assert!(table.lookup("owner", &Value::from("eve")).unwrap().is_empty());
    table.verify_indexes().unwrap();
}

#[test]
fn test_update_and_delete() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    let a = table.insert(account(1, "ada", 1.0)).unwrap();
    let b = table.insert(account(2, "bob", 2.0)).unwrap();

    assert_eq!(table.update(a, account(1, "ada", 5.0)).unwrap(), a);
    assert!(matches!(
        table.update(a, account(2, "ada", 5.0)),
        Err(AtlasError::DuplicateKey { .. })
    ));
    assert_eq!(table.get(a).unwrap(), Some(account(1, "ada", 5.0)));

    assert_eq!(table.delete(b).unwrap(), account(2, "bob", 2.0));
    assert!(matches!(table.delete(b), Err(AtlasError::InvalidPosition(_))));
    assert!(matches!(
        table.update(b, account(2, "bob", 0.0)),
        Err(AtlasError::InvalidPosition(_))
    ));
    table.verify_indexes().unwrap();
}

#[test]
fn test_growing_update_moves_row() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    let filler = "x".repeat(900);
    let positions: Vec<RowPosition> = (0..4)
        .map(|i| table.insert(account(i, &filler, 0.0)).unwrap())
        .collect();

    let moved = table
        .update(positions[0], account(0, &"y".repeat(3000), 0.0))
        .unwrap();
    assert_ne!(moved, positions[0]);
    assert_eq!(table.get(positions[0]).unwrap(), None);
    assert_eq!(
        table.lookup_positions("id", &Value::Int64(0)).unwrap(),
        Some(vec![moved])
    );
    table.verify_indexes().unwrap();
}

#[test]
fn test_row_too_large() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    let err = table.insert(account(1, &"z".repeat(8192), 0.0)).unwrap_err();
    assert!(matches!(err, AtlasError::RowTooLarge { .. }));
}

// =============================================================================
// Predicate Tests
// =============================================================================

#[test]
fn test_select_predicates() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::AppendOnly)).unwrap();
    for i in 0..10 {
        let owner = if i % 2 == 0 { "even" } else { "odd" };
        table.insert(account(i, owner, i as f64)).unwrap();
    }

    assert_eq!(table.select(&Predicate::All).unwrap().len(), 10);
    assert_eq!(table.select(&Predicate::eq("owner", "odd")).unwrap().len(), 5);
    // Unindexed column falls back to a scan
    assert_eq!(table.select(&Predicate::eq("balance", 4.0)).unwrap().len(), 1);
    assert_eq!(
        table.select(&Predicate::Position(RowPosition(3))).unwrap(),
        vec![(RowPosition(3), account(3, "odd", 3.0))]
    );
    let rich = Predicate::matches(|row| row.get(2).and_then(Value::as_f64) > Some(6.0));
    assert_eq!(table.select(&rich).unwrap().len(), 3);

    assert_eq!(table.lookup_positions("balance", &Value::Double(1.0)).unwrap(), None);
    assert!(matches!(
        table.select(&Predicate::eq("nope", 1i64)),
        Err(AtlasError::SchemaMismatch(_))
    ));
}

#[test]
fn test_update_where_and_delete_where() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    for i in 0..6 {
        let owner = if i < 3 { "ada" } else { "bob" };
        table.insert(account(i, owner, 1.0)).unwrap();
    }

    let changed = table
        .update_where(&Predicate::eq("owner", "ada"), |row| {
            let mut row = row.clone();
            row.values[2] = Value::Double(9.0);
            row
        })
        .unwrap();
    assert_eq!(changed, 3);
    assert!(table
        .lookup("owner", &Value::from("ada"))
        .unwrap()
        .iter()
        .all(|(_, row)| row.values[2] == Value::Double(9.0)));

    assert_eq!(table.delete_where(&Predicate::eq("owner", "bob")).unwrap(), 3);
    assert_eq!(table.len(), 3);
    table.verify_indexes().unwrap();
}

// =============================================================================
// Batch Tests
// =============================================================================

#[test]
fn test_batch_is_one_submission() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    let before = engine.wal().stats();

    table.begin_batch().unwrap();
    assert!(table.in_batch());
    for i in 0..50 {
        table.insert(account(i, "ada", 0.0)).unwrap();
    }
    // Rows are visible to this process before the batch ends
    assert_eq!(table.len(), 50);
    let report = table.end_batch().unwrap();

    let after = engine.wal().stats();
    assert_eq!(after.submissions - before.submissions, 1);
    assert_eq!(after.records - before.records, 50);
    assert!(report.pages_written >= 1);
    assert!(!table.in_batch());
}

#[test]
fn test_batch_state_errors() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();

    assert!(matches!(table.end_batch(), Err(AtlasError::BatchState(_))));
    assert!(matches!(table.abort_batch(), Err(AtlasError::BatchState(_))));
    table.begin_batch().unwrap();
    assert!(matches!(table.begin_batch(), Err(AtlasError::BatchState(_))));
    assert!(matches!(table.reindex(), Err(AtlasError::BatchState(_))));
    assert!(matches!(table.flush(), Err(AtlasError::BatchState(_))));

    // An empty batch commits nothing
    let before = engine.wal().stats();
    assert_eq!(table.end_batch().unwrap().pages_written, 0);
    assert_eq!(engine.wal().stats().submissions, before.submissions);
}

#[test]
fn test_abort_batch_discards_everything() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    let kept = table.insert(account(1, "ada", 1.0)).unwrap();

    table.begin_batch().unwrap();
    table.insert(account(2, "bob", 2.0)).unwrap();
    table.update(kept, account(1, "ada", 100.0)).unwrap();
    table.delete(kept).unwrap();
    table.abort_batch().unwrap();

    assert_eq!(table.len(), 1);
    assert_eq!(table.get(kept).unwrap(), Some(account(1, "ada", 1.0)));
    assert!(table.lookup("owner", &Value::from("bob")).unwrap().is_empty());
    table.verify_indexes().unwrap();
}

#[test]
fn test_rejected_statement_keeps_batch() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();

    table.begin_batch().unwrap();
    table.insert(account(1, "ada", 1.0)).unwrap();
    // Fails its uniqueness check before touching anything
    assert!(table.insert(account(1, "eve", 1.0)).is_err());
    assert!(table.in_batch());
    table.insert(account(2, "bob", 1.0)).unwrap();
    table.end_batch().unwrap();

    assert_eq!(table.len(), 2);
}

#[test]
fn test_mid_statement_failure_aborts_batch() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    for i in 0..3 {
        table.insert(account(i, "ada", 0.0)).unwrap();
    }

    table.begin_batch().unwrap();
    table.insert(account(10, "new", 0.0)).unwrap();
    // The second rewrite collides with the first one, which was already applied
    let err = table
        .update_where(&Predicate::All, |row| {
            let mut row = row.clone();
            row.values[0] = Value::Int64(5);
            row
        })
        .unwrap_err();
    assert!(matches!(err, AtlasError::DuplicateKey { .. }));

    assert!(!table.in_batch());
    assert_eq!(table.len(), 3);
    assert!(table.lookup_positions("id", &Value::Int64(10)).unwrap().unwrap().is_empty());
    table.verify_indexes().unwrap();
}

// =============================================================================
// Index Maintenance Tests
// =============================================================================

#[test]
fn test_reindex_matches_incremental_state() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    table.begin_batch().unwrap();
    for i in 0..200 {
        table.insert(account(i, &format!("owner{}", i % 7), 0.0)).unwrap();
    }
    table.end_batch().unwrap();
    table.delete_where(&Predicate::eq("owner", "owner3")).unwrap();

    let before: Vec<_> = table
        .stats()
        .indexes
        .into_iter()
        .map(|(name, s)| (name, s.entries, s.distinct_keys))
        .collect();
    table.reindex().unwrap();
    let after: Vec<_> = table
        .stats()
        .indexes
        .into_iter()
        .map(|(name, s)| (name, s.entries, s.distinct_keys))
        .collect();

    assert_eq!(before, after);
    table.verify_indexes().unwrap();
}

#[test]
fn test_hash_indexes_disabled() {
    crate::init_tracing();
    let temp = tempfile::TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp.path())
        .hash_index_enabled(false)
        .build();
    let engine = Engine::open(config).unwrap();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    table.insert(account(1, "ada", 0.0)).unwrap();

    let names: Vec<String> = table.stats().indexes.into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["accounts.id"]);
    assert_eq!(table.lookup_positions("owner", &Value::from("ada")).unwrap(), None);
    assert_eq!(table.lookup("owner", &Value::from("ada")).unwrap().len(), 1);
    assert!(table.insert(account(1, "dup", 0.0)).is_err());
}

#[test]
fn test_columnar_snapshot_tracks_changes() {
    let (_temp, engine) = setup_temp_engine();
    let table = engine.create_table(accounts(StorageStrategy::Columnar)).unwrap();
    for i in 1..=4 {
        table.insert(account(i, "ada", i as f64)).unwrap();
    }

    let snapshot = table.snapshot().unwrap();
    assert_eq!(snapshot.max("balance").unwrap(), Some(4.0));
    assert_eq!(snapshot.count("balance").unwrap(), 4);

    table.delete(RowPosition(3)).unwrap();
    let snapshot = table.snapshot().unwrap();
    assert_eq!(snapshot.max("balance").unwrap(), Some(3.0));
    assert!(snapshot.sum("owner").is_err());
}

// =============================================================================
// Pending Statement Tests
// =============================================================================

#[test]
fn test_failed_group_undoes_every_waiting_statement() {
    crate::init_tracing();
    let temp = tempfile::TempDir::new().unwrap();
    let engine = Engine::open(
        Config::builder()
            .data_dir(temp.path())
            .wal_max_batch_delay(std::time::Duration::from_millis(20))
            .flush_retry_limit(1)
            .build(),
    )
    .unwrap();
    let table = engine.create_table(accounts(StorageStrategy::PageBased)).unwrap();
    let kept = table.insert(account(0, "ada", 1.0)).unwrap();

    // One attempt plus one retry
    engine.wal().inject_io_failures(2);
    let handles: Vec<_> = (1..=4)
        .map(|id| {
            let table = std::sync::Arc::clone(&table);
            std::thread::spawn(move || table.insert(account(id, "bob", 0.0)))
        })
        .collect();
    for handle in handles {
        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Durability);
    }

    assert_eq!(table.len(), 1);
    assert_eq!(table.get(kept).unwrap(), Some(account(0, "ada", 1.0)));
    assert!(table.lookup("owner", &Value::Text("bob".into())).unwrap().is_empty());
    table.verify_indexes().unwrap();

    engine.wal().restore_health().unwrap();
    table.insert(account(1, "bob", 0.0)).unwrap();
    assert_eq!(table.len(), 2);
}
