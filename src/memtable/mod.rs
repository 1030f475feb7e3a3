//! MemTable Module
//!
//! In-memory write buffer for recent writes, backed by one WAL segment.
//!
//! ## Responsibilities
//! - Fast reads and writes in memory
//! - Log every mutation to the WAL segment first (unless disabled per write)
//! - Track size so the column family knows when to rotate
//! - Sorted snapshot of entries for flushing
//!
//! ## Lifecycle
//! ```text
//! open(fid) → active (put/delete) → sealed (immutable, queued)
//!           → flushed into index + value log → remove_wal()
//! ```

mod rep;
mod table;

use std::path::PathBuf;

use bytes::Bytes;

use crate::config::{IoMode, MemtableKind, WriteOptions};
use crate::error::Result;
use crate::wal::HEADER_SIZE;

pub use table::WalMemtable;

/// Per-entry bookkeeping charged against the size limit on top of key and
/// value bytes (WAL frame header plus expiry).
pub const ENTRY_OVERHEAD: usize = HEADER_SIZE + 8;

/// Bytes an entry is charged against the memtable size limit
pub fn entry_size(key_len: usize, value_len: usize) -> usize {
    key_len + value_len + ENTRY_OVERHEAD
}

/// Entry stored in a memtable
#[derive(Debug, Clone, PartialEq)]
pub struct MemEntry {
    /// Live value, or None for a tombstone
    pub value: Option<Bytes>,

    /// Absolute expiry (unix seconds)
    pub expires_at: Option<u64>,
}

impl MemEntry {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Outcome of a point lookup in one layer of the read path
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// This layer knows nothing about the key; keep searching older layers
    Absent,

    /// The key was deleted (or expired) here; older layers must not be consulted
    Tombstone,

    /// The key's value
    Value(Bytes),
}

/// Parameters for opening one memtable
#[derive(Debug, Clone)]
pub struct MemtableOptions {
    /// Directory holding the WAL segment
    pub wal_dir: PathBuf,

    /// File id of the memtable's WAL segment
    pub fid: u32,

    /// Size limit in bytes
    pub size_limit: usize,

    pub kind: MemtableKind,

    /// How the WAL segment is read during replay
    pub io_mode: IoMode,
}

/// A memtable as the column family sees it.
///
/// Implementations manage their own concurrency: `get` may run alongside
/// `put`/`delete` from many threads.
pub trait Memtable: Send + Sync {
    /// File id; higher is newer
    fn fid(&self) -> u32;

    fn put(&self, key: &[u8], value: &[u8], opts: &WriteOptions) -> Result<()>;

    fn delete(&self, key: &[u8], opts: &WriteOptions) -> Result<()>;

    fn get(&self, key: &[u8]) -> Lookup;

    /// Whether an entry of `size` bytes fits. An empty memtable accepts
    /// anything so oversized entries still make progress.
    fn has_room_for(&self, size: usize) -> bool;

    /// Bytes charged so far
    fn size(&self) -> usize;

    /// Distinct keys held
    fn entry_count(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Refuse further writes. Writes racing with the seal fail with
    /// `KvError::MemtableSealed`.
    fn seal(&self);

    fn is_sealed(&self) -> bool;

    /// All entries in ascending key order
    fn entries(&self) -> Vec<(Vec<u8>, MemEntry)>;

    /// fsync the WAL segment
    fn sync(&self) -> Result<()>;

    /// Delete the WAL segment; only after the entries are durable elsewhere
    fn remove_wal(&self) -> Result<()>;
}

/// Open (or replay) the memtable for `opts.fid`
pub fn open(opts: &MemtableOptions) -> Result<WalMemtable> {
    WalMemtable::open(opts)
}
