//! Tests for the B+tree Index
//!
//! These tests verify:
//! - Point put/get/delete
//! - Metadata store isolation
//! - Batch writes and resuming after a failure
//! - Cursor navigation (first/last/seek/next/prev)
//! - Persistence across reopen and behavior after close

use tempfile::TempDir;
use vlogkv::index::{
    BpTreeIndex, Index, IndexCursor, IndexEntry, IndexMeta, IndexOptions, MAX_KEY_SIZE,
    MIN_BATCH_SIZE,
};
use vlogkv::KvError;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_index(name: &str) -> (TempDir, BpTreeIndex) {
    let temp_dir = TempDir::new().unwrap();
    let index = BpTreeIndex::open(IndexOptions::new(name, temp_dir.path())).unwrap();
    (temp_dir, index)
}

fn key(i: usize) -> Vec<u8> {
    format!("key{:06}", i).into_bytes()
}

fn batch(count: usize) -> Vec<IndexEntry> {
    (0..count)
        .map(|i| IndexEntry::new(key(i), format!("v{}", i)))
        .collect()
}

fn collect_forward(cursor: &mut Box<dyn IndexCursor>) -> Vec<Vec<u8>> {
    let mut keys = Vec::new();
    let mut item = cursor.first().unwrap();
    while let Some((k, _)) = item {
        keys.push(k);
        item = cursor.next().unwrap();
    }
    keys
}

// =============================================================================
// Point Operation Tests
// =============================================================================

#[test]
fn test_put_get_delete() {
    let (_dir, index) = setup_index("users");

    index.put(b"alice", b"1").unwrap();
    assert_eq!(index.get(b"alice").unwrap(), Some(b"1".to_vec()));

    index.put(b"alice", b"2").unwrap();
    assert_eq!(index.get(b"alice").unwrap(), Some(b"2".to_vec()));

    index.delete(b"alice").unwrap();
    assert_eq!(index.get(b"alice").unwrap(), None);

    // Deleting an absent key is not an error
    index.delete(b"nobody").unwrap();
}

#[test]
fn test_stored_meta_distinguishes_empty_value() {
    let (_dir, index) = setup_index("users");
    let meta = IndexMeta::inline(Vec::new(), None);

    index.put(b"empty", &meta.encode().unwrap()).unwrap();

    let raw = index.get(b"empty").unwrap().unwrap();
    assert_eq!(IndexMeta::decode(&raw).unwrap().value, Some(Vec::new()));
    assert_eq!(index.get(b"absent").unwrap(), None);
}

#[test]
fn test_key_validation() {
    let (_dir, index) = setup_index("users");

    assert!(matches!(index.put(b"", b"v"), Err(KvError::KeyRequired)));
    assert!(matches!(
        index.put(&vec![b'k'; MAX_KEY_SIZE + 1], b"v"),
        Err(KvError::KeyTooLarge(_))
    ));
    index.put(&vec![b'k'; MAX_KEY_SIZE], b"v").unwrap();
}

#[test]
fn test_meta_store_is_separate() {
    let (_dir, index) = setup_index("users");

    index.put_meta(b"flushed_fid", &7u32.to_le_bytes()).unwrap();

    assert_eq!(
        index.get_meta(b"flushed_fid").unwrap(),
        Some(7u32.to_le_bytes().to_vec())
    );
    assert_eq!(index.get(b"flushed_fid").unwrap(), None);
}

#[test]
fn test_files_named_after_namespace() {
    let (dir, _index) = setup_index("orders.v2");

    assert!(dir.path().join("orders.v2.meta").exists());
    assert!(dir.path().join("orders.v2.index").exists());
}

// =============================================================================
// Batch Tests
// =============================================================================

#[test]
fn test_put_batch_empty() {
    let (_dir, index) = setup_index("users");
    assert_eq!(index.put_batch(&[]).unwrap(), None);
}

#[test]
fn test_put_batch_returns_last_offset() {
    let (_dir, index) = setup_index("users");
    let entries = batch(MIN_BATCH_SIZE + 500);

    assert_eq!(index.put_batch(&entries).unwrap(), Some(entries.len() - 1));
    assert_eq!(index.get(&key(0)).unwrap(), Some(b"v0".to_vec()));
    assert_eq!(
        index.get(&key(MIN_BATCH_SIZE + 499)).unwrap(),
        Some(format!("v{}", MIN_BATCH_SIZE + 499).into_bytes())
    );
}

#[test]
fn test_put_batch_resume_after_failure() {
    let temp_dir = TempDir::new().unwrap();
    let index =
        BpTreeIndex::open(IndexOptions::new("users", temp_dir.path()).batch_size(10_000)).unwrap();

    let mut entries = batch(25_000);
    // An empty key cannot be stored
    entries[15_000].key = Vec::new();

    let offset = match index.put_batch(&entries) {
        Err(KvError::PartialBatch { offset, source }) => {
            assert!(matches!(*source, KvError::KeyRequired));
            offset
        }
        other => panic!("expected a partial batch, got {:?}", other),
    };
    assert_eq!(offset, Some(14_999));

    // Everything up to the offset is committed, nothing after it
    assert_eq!(index.get(&key(14_999)).unwrap(), Some(b"v14999".to_vec()));
    assert_eq!(index.get(&key(10_000)).unwrap(), Some(b"v10000".to_vec()));
    assert_eq!(index.get(&key(15_001)).unwrap(), None);

    // Fix the bad entry and resume from offset + 1
    entries[15_000].key = key(15_000);
    let resumed = index.put_batch(&entries[15_000..]).unwrap();
    assert_eq!(resumed, Some(9_999));

    assert_eq!(index.get(&key(15_000)).unwrap(), Some(b"v15000".to_vec()));
    assert_eq!(index.get(&key(24_999)).unwrap(), Some(b"v24999".to_vec()));
}

#[test]
fn test_put_batch_failure_on_first_entry() {
    let (_dir, index) = setup_index("users");
    let mut entries = batch(3);
    entries[0].key = Vec::new();

    match index.put_batch(&entries) {
        Err(KvError::PartialBatch { offset, .. }) => assert_eq!(offset, None),
        other => panic!("expected a partial batch, got {:?}", other),
    }
    assert_eq!(index.get(&key(1)).unwrap(), None);
}

// =============================================================================
// Cursor Tests
// =============================================================================

#[test]
fn test_cursor_navigation() {
    let (_dir, index) = setup_index("users");
    for k in ["b", "d", "f", "h"] {
        index.put(k.as_bytes(), k.to_uppercase().as_bytes()).unwrap();
    }

    let mut cursor = index.iter().unwrap();

    assert_eq!(cursor.first().unwrap(), Some((b"b".to_vec(), b"B".to_vec())));
    assert_eq!(cursor.next().unwrap().unwrap().0, b"d");
    assert_eq!(cursor.last().unwrap().unwrap().0, b"h");
    assert_eq!(cursor.prev().unwrap().unwrap().0, b"f");

    // Seek lands on the first key >= target
    assert_eq!(cursor.seek(b"e").unwrap().unwrap().0, b"f");
    assert_eq!(cursor.seek(b"d").unwrap().unwrap().0, b"d");
    assert_eq!(cursor.seek(b"z").unwrap(), None);

    assert_eq!(cursor.last().unwrap().unwrap().0, b"h");
    assert_eq!(cursor.next().unwrap(), None);
    assert_eq!(cursor.first().unwrap().unwrap().0, b"b");
    assert_eq!(cursor.prev().unwrap(), None);

    cursor.close().unwrap();
}

#[test]
fn test_unpositioned_cursor_starts_at_ends() {
    let (_dir, index) = setup_index("users");
    index.put(b"a", b"1").unwrap();
    index.put(b"z", b"2").unwrap();

    assert_eq!(index.iter().unwrap().next().unwrap().unwrap().0, b"a");
    assert_eq!(index.iter().unwrap().prev().unwrap().unwrap().0, b"z");
}

#[test]
fn test_cursor_reads_a_snapshot() {
    let (_dir, index) = setup_index("users");
    index.put_batch(&batch(5)).unwrap();

    let mut cursor = index.iter().unwrap();
    index.put(b"zzz", b"late").unwrap();
    index.delete(&key(0)).unwrap();

    let keys = collect_forward(&mut cursor);
    assert_eq!(keys, (0..5).map(key).collect::<Vec<_>>());
}

#[test]
fn test_cursor_on_empty_index() {
    let (_dir, index) = setup_index("users");
    let mut cursor = index.iter().unwrap();

    assert_eq!(cursor.first().unwrap(), None);
    assert_eq!(cursor.last().unwrap(), None);
    assert_eq!(cursor.next().unwrap(), None);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_reopen_keeps_data() {
    let temp_dir = TempDir::new().unwrap();
    {
        let index = BpTreeIndex::open(IndexOptions::new("users", temp_dir.path())).unwrap();
        index.put_batch(&batch(100)).unwrap();
        index.put_meta(b"m", b"1").unwrap();
        index.close().unwrap();
    }

    let index = BpTreeIndex::open(IndexOptions::new("users", temp_dir.path())).unwrap();
    assert_eq!(index.get(&key(42)).unwrap(), Some(b"v42".to_vec()));
    assert_eq!(index.get_meta(b"m").unwrap(), Some(b"1".to_vec()));
    assert_eq!(collect_forward(&mut index.iter().unwrap()).len(), 100);
}

#[test]
fn test_operations_after_close() {
    let (_dir, index) = setup_index("users");
    index.close().unwrap();

    assert!(index.is_closed());
    assert!(matches!(index.get(b"k"), Err(KvError::IndexClosed)));
    assert!(matches!(index.put(b"k", b"v"), Err(KvError::IndexClosed)));
    assert!(index.iter().is_err());
    // Closing again is fine
    index.close().unwrap();
}

#[test]
fn test_empty_name_rejected() {
    let temp_dir = TempDir::new().unwrap();
    assert!(matches!(
        BpTreeIndex::open(IndexOptions::new("", temp_dir.path())),
        Err(KvError::NameRequired)
    ));
}
