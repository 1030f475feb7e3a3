//! Write-Ahead Log (WAL) Module
//!
//! Every memtable owns one WAL segment. A segment is named after the
//! memtable's file id and is deleted once the memtable has been flushed.
//!
//! ## Responsibilities
//! - Append log entries before the memtable is mutated
//! - CRC32 checksums for corruption detection
//! - Log Sequence Numbers (LSN) for ordering within a segment
//! - Crash recovery and replay
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Entry 1                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Entry 2 ...                             │
//! └─────────────────────────────────────────┘
//! ```

mod entry;
mod reader;
mod recovery;
mod writer;

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub use entry::{Operation, WalEntry, HEADER_SIZE};
pub use reader::{WalIterator, WalReader};
pub use recovery::{RecoveryResult, WalRecovery};
pub use writer::WalWriter;

/// Suffix of WAL segment files
pub const WAL_SUFFIX: &str = "wal";

/// File id of the first memtable in a fresh column family
pub const INITIAL_FID: u32 = 0;

/// Path of the WAL segment for `fid`: "{dir}/000000042.wal"
pub fn segment_path(dir: &Path, fid: u32) -> PathBuf {
    dir.join(format!("{:09}.{}", fid, WAL_SUFFIX))
}

/// "000000042.wal" → Some(42)
pub fn parse_segment_fid(path: &Path) -> Option<u32> {
    if path.extension()? != WAL_SUFFIX {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// All WAL segment ids in `dir`, ascending
pub fn list_segments(dir: &Path) -> Result<Vec<u32>> {
    let mut fids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            if let Some(fid) = parse_segment_fid(&path) {
                fids.push(fid);
            }
        }
    }
    fids.sort_unstable();
    Ok(fids)
}
