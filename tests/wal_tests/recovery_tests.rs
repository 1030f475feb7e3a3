//! Tests for WAL Recovery
//!
//! These tests verify:
//! - Recovery from a clean segment (no corruption)
//! - Recovery from an empty segment
//! - Recovery with partial writes (torn tail), through both read paths
//! - Recovery with corrupted entries (CRC mismatch)
//! - Verify mode (stats only, no truncation)
//! - Appending after recovery continues the LSN sequence
//! - A partial frame left by a failed append is cut before the next one

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use tempfile::TempDir;
use vlogkv::config::IoMode;
use vlogkv::wal::{self, Operation, RecoveryResult, WalEntry, WalReader, WalRecovery, WalWriter};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_path = wal::segment_path(temp_dir.path(), 0);
    (temp_dir, wal_path)
}

fn put(i: usize) -> Operation {
    Operation::Put {
        key: format!("key{}", i).into_bytes(),
        value: format!("value{}", i).into_bytes(),
        expires_at: None,
    }
}

/// Write entries using WalWriter (produces a well-formed segment)
fn write_entries_via_writer(path: &PathBuf, count: usize) {
    let mut writer = WalWriter::open(path, 0).unwrap();
    for i in 0..count {
        writer.append(put(i), true).unwrap();
    }
}

/// Write raw serialized entries directly to a file (for crafting corruption)
fn write_raw_entries(path: &PathBuf, entries: &[WalEntry]) {
    let mut file = File::create(path).unwrap();
    for entry in entries {
        file.write_all(&entry.serialize().unwrap()).unwrap();
    }
    file.sync_all().unwrap();
}

fn append_bytes(path: &PathBuf, bytes: &[u8]) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

// =============================================================================
// Clean Recovery Tests
// =============================================================================

#[test]
fn test_recover_empty_file() {
    let (_temp_dir, wal_path) = setup_temp_wal();
    File::create(&wal_path).unwrap();

    let (entries, result) = WalRecovery::recover(&wal_path, IoMode::FileIo).unwrap();

    assert!(entries.is_empty());
    assert_eq!(result, RecoveryResult::default());
}

#[test]
fn test_recover_multiple_entries() {
    let (_temp_dir, wal_path) = setup_temp_wal();
    write_entries_via_writer(&wal_path, 10);

    let (entries, result) = WalRecovery::recover(&wal_path, IoMode::FileIo).unwrap();

    assert_eq!(entries.len(), 10);
    assert_eq!(result.entries_recovered, 10);
    assert_eq!(result.entries_corrupted, 0);
    assert_eq!(result.last_lsn, 10);
    assert!(!result.was_truncated);

    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.lsn, i as u64 + 1);
        assert_eq!(entry.operation, put(i));
    }
}

#[test]
fn test_recover_preserves_operations() {
    let (_temp_dir, wal_path) = setup_temp_wal();
    let ops = vec![
        Operation::Put {
            key: b"a".to_vec(),
            value: b"1".to_vec(),
            expires_at: Some(4_000_000_000),
        },
        Operation::Delete { key: b"a".to_vec() },
        Operation::Put {
            key: b"b".to_vec(),
            value: Vec::new(),
            expires_at: None,
        },
    ];

    let mut writer = WalWriter::open(&wal_path, 0).unwrap();
    for op in &ops {
        writer.append(op.clone(), false).unwrap();
    }
    drop(writer);

    let (entries, _) = WalRecovery::recover(&wal_path, IoMode::FileIo).unwrap();
    let recovered: Vec<Operation> = entries.into_iter().map(|e| e.operation).collect();
    assert_eq!(recovered, ops);
}

#[test]
fn test_recover_through_mmap() {
    let (_temp_dir, wal_path) = setup_temp_wal();
    write_entries_via_writer(&wal_path, 25);

    let (entries, result) = WalRecovery::recover(&wal_path, IoMode::MMap).unwrap();

    assert_eq!(entries.len(), 25);
    assert_eq!(result.last_lsn, 25);
}

// =============================================================================
// Partial Write Tests
// =============================================================================

#[test]
fn test_recover_partial_header_at_tail() {
    let (_temp_dir, wal_path) = setup_temp_wal();
    write_entries_via_writer(&wal_path, 3);
    let clean_len = fs::metadata(&wal_path).unwrap().len();

    // A torn header: fewer bytes than a full frame header
    append_bytes(&wal_path, &[0xAB; 7]);

    let (entries, result) = WalRecovery::recover(&wal_path, IoMode::FileIo).unwrap();

    assert_eq!(entries.len(), 3);
    assert!(result.was_truncated);
    assert_eq!(result.entries_corrupted, 0);
    assert_eq!(fs::metadata(&wal_path).unwrap().len(), clean_len);
}

#[test]
fn test_recover_partial_data_at_tail() {
    let (_temp_dir, wal_path) = setup_temp_wal();
    write_entries_via_writer(&wal_path, 2);
    let clean_len = fs::metadata(&wal_path).unwrap().len();

    let torn = WalEntry::new(3, put(2)).serialize().unwrap();
    append_bytes(&wal_path, &torn[..torn.len() - 3]);

    for io_mode in [IoMode::MMap, IoMode::FileIo] {
        let (entries, result) = WalRecovery::recover(&wal_path, io_mode).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(result.last_lsn, 2);
        assert_eq!(fs::metadata(&wal_path).unwrap().len(), clean_len);
    }
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_recover_corrupted_entry() {
    let (_temp_dir, wal_path) = setup_temp_wal();
    let entries: Vec<WalEntry> = (0..4).map(|i| WalEntry::new(i as u64 + 1, put(i))).collect();
    write_raw_entries(&wal_path, &entries);

    // Flip a payload byte of the third entry
    let first_two: usize = entries[..2]
        .iter()
        .map(|e| e.serialize().unwrap().len())
        .sum();
    let mut bytes = fs::read(&wal_path).unwrap();
    bytes[first_two + wal::HEADER_SIZE + 1] ^= 0xFF;
    fs::write(&wal_path, &bytes).unwrap();

    let (recovered, result) = WalRecovery::recover(&wal_path, IoMode::FileIo).unwrap();

    assert_eq!(recovered.len(), 2);
    assert_eq!(result.entries_corrupted, 1);
    assert_eq!(result.last_lsn, 2);
    assert!(result.was_truncated);
    assert_eq!(fs::metadata(&wal_path).unwrap().len(), first_two as u64);
}

#[test]
fn test_recover_corruption_at_first_entry() {
    let (_temp_dir, wal_path) = setup_temp_wal();
    write_entries_via_writer(&wal_path, 2);

    let mut bytes = fs::read(&wal_path).unwrap();
    bytes[wal::HEADER_SIZE] ^= 0xFF;
    fs::write(&wal_path, &bytes).unwrap();

    let (recovered, result) = WalRecovery::recover(&wal_path, IoMode::FileIo).unwrap();

    assert!(recovered.is_empty());
    assert_eq!(result.last_lsn, 0);
    assert_eq!(fs::metadata(&wal_path).unwrap().len(), 0);
}

// =============================================================================
// Verify Mode Tests
// =============================================================================

#[test]
fn test_verify_with_partial_write_does_not_truncate() {
    let (_temp_dir, wal_path) = setup_temp_wal();
    write_entries_via_writer(&wal_path, 5);
    append_bytes(&wal_path, &[1, 2, 3]);
    let damaged_len = fs::metadata(&wal_path).unwrap().len();

    let result = WalRecovery::verify(&wal_path).unwrap();

    assert_eq!(result.entries_recovered, 5);
    assert!(result.was_truncated);
    assert_eq!(fs::metadata(&wal_path).unwrap().len(), damaged_len);
}

#[test]
fn test_recover_and_verify_agree() {
    let (_temp_dir, wal_path) = setup_temp_wal();
    write_entries_via_writer(&wal_path, 8);

    let verified = WalRecovery::verify(&wal_path).unwrap();
    let (_, recovered) = WalRecovery::recover(&wal_path, IoMode::FileIo).unwrap();

    assert_eq!(verified, recovered);
}

// =============================================================================
// Resume Tests
// =============================================================================

#[test]
fn test_append_after_recovery_continues_lsn() {
    let (_temp_dir, wal_path) = setup_temp_wal();
    write_entries_via_writer(&wal_path, 3);
    append_bytes(&wal_path, &[0xFF; 5]);

    let (_, result) = WalRecovery::recover(&wal_path, IoMode::FileIo).unwrap();
    let mut writer = WalWriter::open(&wal_path, result.last_lsn).unwrap();
    assert_eq!(writer.append(put(3), true).unwrap(), 4);
    drop(writer);

    let lsns: Vec<u64> = WalReader::open(&wal_path, IoMode::FileIo)
        .unwrap()
        .entries()
        .map(|entry| entry.unwrap().lsn)
        .collect();
    assert_eq!(lsns, vec![1, 2, 3, 4]);
}

#[test]
fn test_append_cuts_partial_frame_left_by_failed_write() {
    let (_temp_dir, wal_path) = setup_temp_wal();
    let mut writer = WalWriter::open(&wal_path, 0).unwrap();
    writer.append(put(0), false).unwrap();
    writer.append(put(1), false).unwrap();

    // Part of a frame whose append reported an error
    let failed = WalEntry::new(3, put(99)).serialize().unwrap();
    append_bytes(&wal_path, &failed[..failed.len() / 2]);

    assert_eq!(writer.append(put(2), true).unwrap(), 3);
    drop(writer);

    let (entries, result) = WalRecovery::recover(&wal_path, IoMode::FileIo).unwrap();
    assert_eq!(entries.len(), 3);
    assert!(!result.was_truncated);
    assert_eq!(result.entries_corrupted, 0);
    assert_eq!(entries[2].operation, put(2));
}

#[test]
fn test_list_segments_sorted() {
    let temp_dir = TempDir::new().unwrap();
    for fid in [7, 2, 10] {
        File::create(wal::segment_path(temp_dir.path(), fid)).unwrap();
    }
    File::create(temp_dir.path().join("000000003.vlog")).unwrap();

    assert_eq!(wal::list_segments(temp_dir.path()).unwrap(), vec![2, 7, 10]);
}
