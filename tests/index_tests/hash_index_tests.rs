//! Tests for HashIndex
//!
//! These tests verify:
//! - Keys normalize across integer widths, float zeros and decimal scales
//! - Lookups return every position holding a key
//! - Removal is exact and never touches other positions
//! - Uniqueness is enforced except for NULL
//! - Statistics track entries, keys, lookups and rebuilds

use atlasdb::index::HashIndex;
use atlasdb::{AtlasError, IndexKey, Row, RowPosition, Value};

// =============================================================================
// Helper Functions
// =============================================================================

fn pos(n: u64) -> RowPosition {
    RowPosition(n)
}

fn key(v: i64) -> IndexKey {
    IndexKey::from_value(&Value::Int64(v))
}

// =============================================================================
// Key Tests
// =============================================================================

#[test]
fn test_key_normalization() {
    assert_eq!(IndexKey::from_value(&Value::Int32(5)), key(5));
    assert_eq!(
        IndexKey::from_value(&Value::Double(0.0)),
        IndexKey::from_value(&Value::Double(-0.0))
    );
    assert_eq!(
        IndexKey::from_value(&Value::Decimal { mantissa: 1500, scale: 3 }),
        IndexKey::from_value(&Value::Decimal { mantissa: 15, scale: 1 })
    );
    assert_ne!(
        IndexKey::from_value(&Value::Text("1".into())),
        key(1)
    );
    assert!(IndexKey::from_value(&Value::Null).is_null());
}

// =============================================================================
// Add / Lookup / Remove Tests
// =============================================================================

#[test]
fn test_lookup_returns_all_positions() {
    let mut index = HashIndex::new("orders.city", 1, false);
    index.add(key(7), pos(1)).unwrap();
    index.add(key(7), pos(4)).unwrap();
    index.add(key(8), pos(2)).unwrap();

    assert_eq!(index.lookup_positions(&key(7)), vec![pos(1), pos(4)]);
    assert_eq!(index.lookup_positions(&key(8)), vec![pos(2)]);
    assert!(index.lookup_positions(&key(9)).is_empty());
    assert_eq!(index.len(), 3);
}

#[test]
fn test_remove_only_named_position() {
    let mut index = HashIndex::new("t.c", 0, false);
    for n in 0..5 {
        index.add(key(1), pos(n)).unwrap();
    }

    assert!(index.remove(&key(1), pos(2)));
    assert!(!index.remove(&key(1), pos(2)));
    assert!(!index.remove(&key(99), pos(0)));

    let mut left = index.lookup_positions(&key(1));
    left.sort_unstable();
    assert_eq!(left, vec![pos(0), pos(1), pos(3), pos(4)]);
}

#[test]
fn test_last_position_drops_key() {
    let mut index = HashIndex::new("t.c", 0, false);
    index.add(key(1), pos(0)).unwrap();
    index.remove(&key(1), pos(0));

    assert!(!index.contains_key(&key(1)));
    assert!(index.is_empty());
    assert_eq!(index.statistics().distinct_keys, 0);
}

#[test]
fn test_row_helpers_use_column() {
    let mut index = HashIndex::new("t.name", 1, true);
    let row = Row::new(vec![Value::Int64(1), Value::Text("ada".into())]);

    index.add_row(&row, pos(3)).unwrap();
    assert_eq!(
        index.lookup_positions(&IndexKey::from_value(&Value::Text("ada".into()))),
        vec![pos(3)]
    );
    assert!(index.remove_row(&row, pos(3)));
    assert!(index.is_empty());
}

// =============================================================================
// Uniqueness Tests
// =============================================================================

#[test]
fn test_unique_index() {
    let mut index = HashIndex::new("users.email", 0, true);
    index.add(key(1), pos(0)).unwrap();

    let err = index.add(key(1), pos(1)).unwrap_err();
    assert!(matches!(err, AtlasError::DuplicateKey { ref index } if index == "users.email"));
    assert_eq!(index.len(), 1);

    index.add(IndexKey::Null, pos(2)).unwrap();
    index.add(IndexKey::Null, pos(3)).unwrap();
    assert!(index.conflicts(&key(1), None));
    assert!(!index.conflicts(&key(1), Some(pos(0))));
}

#[test]
fn test_bulk_load_rejects_duplicates() {
    let mut index = HashIndex::new("t.id", 0, true);
    index.add(key(5), pos(5)).unwrap();

    let result = index.bulk_load(vec![(key(1), pos(0)), (key(1), pos(1))]);
    assert!(matches!(result, Err(AtlasError::DuplicateKey { .. })));
    assert!(index.is_empty());
}

// =============================================================================
// Statistics Tests
// =============================================================================

#[test]
fn test_statistics() {
    let mut index = HashIndex::new("t.c", 0, false);
    index
        .bulk_load((0..100).map(|n| (key(n % 10), pos(n as u64))))
        .unwrap();
    index.lookup_positions(&key(3));
    index.lookup_positions(&key(4));
    index.remove(&key(3), pos(3));

    let stats = index.statistics();
    assert_eq!(stats.entries, 99);
    assert_eq!(stats.distinct_keys, 10);
    assert_eq!(stats.max_positions_per_key, 10);
    assert_eq!(stats.lookups, 2);
    assert_eq!(stats.removes, 1);
    assert_eq!(stats.rebuilds, 1);
    assert!(stats.load_factor > 0.0 && stats.load_factor <= 1.0);
}
