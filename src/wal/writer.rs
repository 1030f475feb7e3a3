//! WAL Writer
//!
//! Appends framed entries to one WAL segment.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::warn;

use crate::error::Result;

use super::{Operation, WalEntry};

/// Writes entries to a WAL segment file
///
/// Frames go straight to the file, one `write_all` each, so a failed
/// append never leaves bytes queued behind a later one.
pub struct WalWriter {
    file: File,
    /// LSN assigned to the most recent append
    current_lsn: u64,
    /// End of the last complete frame
    len: u64,
}

impl WalWriter {
    /// Open or create a WAL segment, appending after `last_lsn`
    pub fn open(path: &Path, last_lsn: u64) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            file,
            current_lsn: last_lsn,
            len,
        })
    }

    /// Append an operation. The record reaches the OS before this returns;
    /// with `sync` it is also fsynced.
    ///
    /// On error nothing of the frame is left in the segment, so replay
    /// never applies a write the caller saw fail.
    pub fn append(&mut self, operation: Operation, sync: bool) -> Result<u64> {
        let lsn = self.current_lsn + 1;
        let bytes = WalEntry::new(lsn, operation).serialize()?;

        if self.file.metadata()?.len() != self.len {
            warn!(len = self.len, "truncating partial WAL frame");
            self.file.set_len(self.len)?;
        }

        let written = self
            .file
            .write_all(&bytes)
            .and_then(|_| if sync { self.file.sync_data() } else { Ok(()) });
        if let Err(e) = written {
            // A leftover is cut by the next append if this fails too.
            if let Err(trunc) = self.file.set_len(self.len) {
                warn!(error = %trunc, "could not truncate failed WAL append");
            }
            return Err(e.into());
        }

        self.current_lsn = lsn;
        self.len += bytes.len() as u64;
        Ok(lsn)
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
