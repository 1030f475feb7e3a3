//! MemTable implementation
//!
//! Skiplist-backed memtable that writes through its own WAL segment.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{is_expired, WriteOptions};
use crate::error::{KvError, Result};
use crate::wal::{self, Operation, WalRecovery, WalWriter};

use super::rep::{new_rep, TableRep};
use super::{entry_size, Lookup, MemEntry, Memtable, MemtableOptions};

/// In-memory table for recent writes with a WAL segment behind it
///
/// ## Concurrency:
/// - `rep`: lock-free skiplist, readers never block
/// - `wal`: Mutex serializing appends; it also guards the seal flag so no
///   write can land after `seal()` returns
pub struct WalMemtable {
    fid: u32,
    size_limit: usize,
    wal_path: PathBuf,
    rep: Box<dyn TableRep>,
    wal: Mutex<Option<WalWriter>>,
    size: AtomicUsize,
    sealed: AtomicBool,
}

impl WalMemtable {
    /// Open a memtable, replaying its WAL segment if one exists
    pub fn open(opts: &MemtableOptions) -> Result<Self> {
        let wal_path = wal::segment_path(&opts.wal_dir, opts.fid);
        let rep = new_rep(opts.kind);
        let mut size = 0;
        let mut last_lsn = 0;

        if wal_path.exists() {
            let (entries, result) = WalRecovery::recover(&wal_path, opts.io_mode)?;
            for entry in entries {
                size += apply(rep.as_ref(), entry.operation);
            }
            last_lsn = result.last_lsn;

            if result.entries_recovered > 0 || result.entries_corrupted > 0 {
                info!(
                    fid = opts.fid,
                    recovered = result.entries_recovered,
                    corrupted = result.entries_corrupted,
                    last_lsn = result.last_lsn,
                    "replayed WAL segment"
                );
            }
        }

        let writer = WalWriter::open(&wal_path, last_lsn)?;

        Ok(Self {
            fid: opts.fid,
            size_limit: opts.size_limit,
            wal_path,
            rep,
            wal: Mutex::new(Some(writer)),
            size: AtomicUsize::new(size),
            sealed: AtomicBool::new(false),
        })
    }

    fn write(&self, operation: Operation, opts: &WriteOptions) -> Result<()> {
        let mut wal = self.wal.lock();
        if self.sealed.load(Ordering::Acquire) {
            return Err(KvError::MemtableSealed(self.fid));
        }

        if !opts.disable_wal {
            let writer = wal.as_mut().ok_or(KvError::MemtableSealed(self.fid))?;
            writer.append(operation.clone(), opts.sync)?;
        }

        let charged = apply(self.rep.as_ref(), operation);
        self.size.fetch_add(charged, Ordering::AcqRel);
        Ok(())
    }
}

/// Apply a logged operation to the in-memory structure, returning the bytes charged
fn apply(rep: &dyn TableRep, operation: Operation) -> usize {
    match operation {
        Operation::Put {
            key,
            value,
            expires_at,
        } => {
            let charged = entry_size(key.len(), value.len());
            rep.insert(
                key,
                MemEntry {
                    value: Some(Bytes::from(value)),
                    expires_at,
                },
            );
            charged
        }
        Operation::Delete { key } => {
            let charged = entry_size(key.len(), 0);
            rep.insert(
                key,
                MemEntry {
                    value: None,
                    expires_at: None,
                },
            );
            charged
        }
    }
}

impl Memtable for WalMemtable {
    fn fid(&self) -> u32 {
        self.fid
    }

    fn put(&self, key: &[u8], value: &[u8], opts: &WriteOptions) -> Result<()> {
        self.write(
            Operation::Put {
                key: key.to_vec(),
                value: value.to_vec(),
                expires_at: opts.expires_at,
            },
            opts,
        )
    }

    fn delete(&self, key: &[u8], opts: &WriteOptions) -> Result<()> {
        self.write(Operation::Delete { key: key.to_vec() }, opts)
    }

    fn get(&self, key: &[u8]) -> Lookup {
        match self.rep.get(key) {
            None => Lookup::Absent,
            Some(entry) if is_expired(entry.expires_at) => Lookup::Tombstone,
            Some(MemEntry { value: None, .. }) => Lookup::Tombstone,
            Some(MemEntry {
                value: Some(value), ..
            }) => Lookup::Value(value),
        }
    }

    fn has_room_for(&self, size: usize) -> bool {
        let current = self.size();
        current == 0 || current + size <= self.size_limit
    }

    fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    fn entry_count(&self) -> usize {
        self.rep.len()
    }

    fn seal(&self) {
        let _wal = self.wal.lock();
        self.sealed.store(true, Ordering::Release);
    }

    fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    fn entries(&self) -> Vec<(Vec<u8>, MemEntry)> {
        self.rep.sorted_entries()
    }

    fn sync(&self) -> Result<()> {
        match self.wal.lock().as_mut() {
            Some(writer) => writer.sync(),
            None => Ok(()),
        }
    }

    fn remove_wal(&self) -> Result<()> {
        let mut wal = self.wal.lock();
        self.sealed.store(true, Ordering::Release);
        // Close the handle before unlinking.
        drop(wal.take());

        match fs::remove_file(&self.wal_path) {
            Ok(()) => {
                debug!(fid = self.fid, "removed WAL segment");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
