//! Tests for the Value Log
//!
//! These tests verify:
//! - Write then read through file I/O and mmap
//! - Segment roll-over at the block size
//! - Resuming appends after reopen
//! - Reads of missing segments or damaged records fail cleanly
//! - Bytes left by a partial append never shift later offsets

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::thread;

use tempfile::TempDir;
use vlogkv::config::IoMode;
use vlogkv::vlog::{FileValueLog, ValueLog, ValueLogEntry, RECORD_HEADER_SIZE};
use vlogkv::KvError;

// =============================================================================
// Helper Functions
// =============================================================================

fn entry(i: usize, value_len: usize) -> ValueLogEntry {
    ValueLogEntry {
        key: format!("key{:04}", i).into_bytes(),
        value: vec![(i % 251) as u8; value_len],
        expires_at: None,
    }
}

fn segment_files(dir: &TempDir) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".vlog"))
        .collect();
    names.sort();
    names
}

// =============================================================================
// Read / Write Tests
// =============================================================================

#[test]
fn test_write_then_read_both_io_modes() {
    for io_mode in [IoMode::FileIo, IoMode::MMap] {
        let temp_dir = TempDir::new().unwrap();
        let vlog = FileValueLog::open(temp_dir.path(), 1024 * 1024, io_mode).unwrap();

        let mut positions = Vec::new();
        for i in 0..50 {
            positions.push(vlog.write(&entry(i, 300)).unwrap());
        }

        for (i, pos) in positions.iter().enumerate() {
            let read = vlog.read(pos.fid, pos.size, pos.offset).unwrap();
            assert_eq!(read, entry(i, 300), "{:?}", io_mode);
        }
    }
}

#[test]
fn test_mmap_read_sees_later_writes() {
    let temp_dir = TempDir::new().unwrap();
    let vlog = FileValueLog::open(temp_dir.path(), 1024 * 1024, IoMode::MMap).unwrap();

    let first = vlog.write(&entry(0, 64)).unwrap();
    vlog.read(first.fid, first.size, first.offset).unwrap();

    // The first read mapped a shorter file
    let second = vlog.write(&entry(1, 64)).unwrap();
    assert_eq!(
        vlog.read(second.fid, second.size, second.offset).unwrap(),
        entry(1, 64)
    );
}

#[test]
fn test_expiry_round_trips() {
    let temp_dir = TempDir::new().unwrap();
    let vlog = FileValueLog::open(temp_dir.path(), 4096, IoMode::FileIo).unwrap();
    let mut e = entry(1, 10);
    e.expires_at = Some(1_900_000_000);

    let pos = vlog.write(&e).unwrap();

    assert_eq!(vlog.read(pos.fid, pos.size, pos.offset).unwrap(), e);
    assert_eq!(pos.size as usize, RECORD_HEADER_SIZE + e.key.len() + 10);
}

// =============================================================================
// Segment Tests
// =============================================================================

#[test]
fn test_segment_rolls_at_block_size() {
    let temp_dir = TempDir::new().unwrap();
    let record_len = entry(0, 100).encode().len() as u64;
    // Room for exactly three records per segment
    let vlog = FileValueLog::open(temp_dir.path(), record_len * 3, IoMode::FileIo).unwrap();

    let positions: Vec<_> = (0..7).map(|i| vlog.write(&entry(i, 100)).unwrap()).collect();

    let fids: Vec<u32> = positions.iter().map(|p| p.fid).collect();
    assert_eq!(fids, vec![0, 0, 0, 1, 1, 1, 2]);
    assert_eq!(positions[3].offset, 0);
    assert_eq!(vlog.active_fid(), 2);
    assert_eq!(
        segment_files(&temp_dir),
        vec!["000000000.vlog", "000000001.vlog", "000000002.vlog"]
    );

    for (i, pos) in positions.iter().enumerate() {
        assert_eq!(vlog.read(pos.fid, pos.size, pos.offset).unwrap(), entry(i, 100));
    }
}

#[test]
fn test_oversized_record_gets_its_own_segment() {
    let temp_dir = TempDir::new().unwrap();
    let vlog = FileValueLog::open(temp_dir.path(), 128, IoMode::FileIo).unwrap();

    let small = vlog.write(&entry(0, 8)).unwrap();
    let big = vlog.write(&entry(1, 1000)).unwrap();

    assert_eq!(small.fid, 0);
    assert_eq!((big.fid, big.offset), (1, 0));
    assert_eq!(vlog.read(big.fid, big.size, big.offset).unwrap(), entry(1, 1000));
}

#[test]
fn test_reopen_resumes_newest_segment() {
    let temp_dir = TempDir::new().unwrap();
    let record_len = entry(0, 50).encode().len() as u64;
    let before = {
        let vlog = FileValueLog::open(temp_dir.path(), record_len * 2, IoMode::FileIo).unwrap();
        let positions: Vec<_> = (0..3).map(|i| vlog.write(&entry(i, 50)).unwrap()).collect();
        vlog.close().unwrap();
        positions
    };

    let vlog = FileValueLog::open(temp_dir.path(), record_len * 2, IoMode::MMap).unwrap();
    let next = vlog.write(&entry(3, 50)).unwrap();

    assert_eq!((next.fid, next.offset), (1, record_len));
    for (i, pos) in before.iter().enumerate() {
        assert_eq!(vlog.read(pos.fid, pos.size, pos.offset).unwrap(), entry(i, 50));
    }
}

// =============================================================================
// Failure Tests
// =============================================================================

#[test]
fn test_read_missing_segment() {
    let temp_dir = TempDir::new().unwrap();
    let vlog = FileValueLog::open(temp_dir.path(), 4096, IoMode::FileIo).unwrap();

    assert!(matches!(vlog.read(42, 30, 0), Err(KvError::ValueLog(_))));
}

#[test]
fn test_read_past_end_with_mmap() {
    let temp_dir = TempDir::new().unwrap();
    let vlog = FileValueLog::open(temp_dir.path(), 4096, IoMode::MMap).unwrap();
    let pos = vlog.write(&entry(0, 10)).unwrap();

    assert!(vlog.read(pos.fid, pos.size, pos.offset + 1000).is_err());
}

#[test]
fn test_read_with_wrong_size_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let vlog = FileValueLog::open(temp_dir.path(), 4096, IoMode::FileIo).unwrap();
    vlog.write(&entry(0, 10)).unwrap();
    let pos = vlog.write(&entry(1, 10)).unwrap();

    // Straddles two records
    assert!(vlog.read(pos.fid, pos.size, pos.offset - 4).is_err());
}

#[test]
fn test_partial_append_is_cut_before_next_write() {
    for io_mode in [IoMode::FileIo, IoMode::MMap] {
        let temp_dir = TempDir::new().unwrap();
        let vlog = FileValueLog::open(temp_dir.path(), 1024 * 1024, io_mode).unwrap();
        let first = vlog.write(&entry(1, 300)).unwrap();

        // Leftover of a write_all that failed part way
        let mut file = OpenOptions::new()
            .append(true)
            .open(temp_dir.path().join("000000000.vlog"))
            .unwrap();
        file.write_all(&[0xEE; 17]).unwrap();
        drop(file);

        let second = vlog.write(&entry(2, 300)).unwrap();

        assert_eq!(second.offset, first.offset + first.size as u64);
        assert_eq!(vlog.read(first.fid, first.size, first.offset).unwrap(), entry(1, 300));
        assert_eq!(vlog.read(second.fid, second.size, second.offset).unwrap(), entry(2, 300));
        assert_eq!(
            fs::metadata(temp_dir.path().join("000000000.vlog")).unwrap().len(),
            second.offset + second.size as u64
        );
    }
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_writers() {
    let temp_dir = TempDir::new().unwrap();
    let vlog = Arc::new(FileValueLog::open(temp_dir.path(), 8 * 1024, IoMode::MMap).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let vlog = Arc::clone(&vlog);
            thread::spawn(move || {
                (0..50)
                    .map(|i| {
                        let e = entry(t * 1000 + i, 64);
                        (e.clone(), vlog.write(&e).unwrap())
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for handle in handles {
        for (expected, pos) in handle.join().unwrap() {
            assert_eq!(vlog.read(pos.fid, pos.size, pos.offset).unwrap(), expected);
        }
    }
}
