//! WAL Recovery
//!
//! Replays a WAL segment after a restart or crash.

use std::fs::OpenOptions;
use std::path::Path;

use tracing::warn;

use crate::config::IoMode;
use crate::error::{KvError, Result};

use super::{WalEntry, WalReader};

/// Handles WAL recovery after crash
pub struct WalRecovery;

/// Result of a recovery operation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of entries successfully recovered
    pub entries_recovered: u64,

    /// Number of corrupted frames hit (replay stops at the first one)
    pub entries_corrupted: u64,

    /// Last valid LSN
    pub last_lsn: u64,

    /// Whether the segment was truncated (partial or corrupt tail removed)
    pub was_truncated: bool,
}

impl WalRecovery {
    /// Recover entries from a WAL segment
    ///
    /// This will:
    /// 1. Read all valid entries in order
    /// 2. Stop at the first torn or corrupted frame
    /// 3. Truncate the segment to the valid prefix
    pub fn recover(path: &Path, io_mode: IoMode) -> Result<(Vec<WalEntry>, RecoveryResult)> {
        let (entries, valid_len, mut result) = Self::scan(path, io_mode)?;

        if result.was_truncated {
            warn!(
                path = %path.display(),
                valid_len,
                "truncating damaged WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        result.entries_recovered = entries.len() as u64;
        Ok((entries, result))
    }

    /// Verify integrity of a WAL segment without modifying it
    pub fn verify(path: &Path) -> Result<RecoveryResult> {
        let (entries, _, mut result) = Self::scan(path, IoMode::FileIo)?;
        result.entries_recovered = entries.len() as u64;
        Ok(result)
    }

    fn scan(path: &Path, io_mode: IoMode) -> Result<(Vec<WalEntry>, u64, RecoveryResult)> {
        let mut reader = WalReader::open(path, io_mode)?;
        let mut result = RecoveryResult::default();
        let mut entries = Vec::new();

        loop {
            match reader.next_entry() {
                Ok(Some(entry)) => {
                    result.last_lsn = entry.lsn;
                    entries.push(entry);
                }
                Ok(None) => break,
                Err(KvError::WalCorruption(_)) | Err(KvError::Serialization(_)) => {
                    result.entries_corrupted += 1;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let valid_len = reader.position();
        result.was_truncated = valid_len < reader.len();
        Ok((entries, valid_len, result))
    }
}
