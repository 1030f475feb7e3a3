//! Index Module
//!
//! Durable, transactional ordered map from key to an encoded [`IndexMeta`].
//!
//! ## Responsibilities
//! - Point put/get/delete, each in its own transaction
//! - Resumable batch insert (one transaction per batch)
//! - Cursor iteration over a read snapshot
//! - A small metadata store next to the primary store
//!
//! ## Files (per namespace)
//! ```text
//! {index_dir}/
//!   ├── {name}.meta    (metadata store, table "{name}")
//!   └── {name}.index   (key → IndexMeta, table "{name}")
//! ```

mod bptree;
mod registry;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};

pub use bptree::BpTreeIndex;
pub use registry::IndexRegistry;

/// Default entries per batch transaction
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Smallest batch size accepted; smaller requests are raised to this
pub const MIN_BATCH_SIZE: usize = 10_000;

/// Longest key the index accepts
pub const MAX_KEY_SIZE: usize = 32 * 1024;

/// Persisted record resolving a key to an inline value or a value log pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Inline value; `Some(vec![])` is a stored empty value.
    /// `None` means the value lives in the value log.
    pub value: Option<Vec<u8>>,
    pub fid: u32,
    pub offset: u64,
    pub size: u32,
    pub expires_at: Option<u64>,
}

impl IndexMeta {
    pub fn inline(value: Vec<u8>, expires_at: Option<u64>) -> Self {
        Self {
            value: Some(value),
            fid: 0,
            offset: 0,
            size: 0,
            expires_at,
        }
    }

    pub fn pointer(fid: u32, offset: u64, size: u32, expires_at: Option<u64>) -> Self {
        Self {
            value: None,
            fid,
            offset,
            size,
            expires_at,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// One key-value pair of a batch write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl IndexEntry {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Options for one namespace's index
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Namespace name; also the table name inside both files
    pub name: String,

    /// Directory holding the index files
    pub dir: PathBuf,

    /// Entries per batch transaction (raised to MIN_BATCH_SIZE)
    pub batch_size: usize,
}

impl IndexOptions {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Validate and normalize in place
    pub(crate) fn check(&mut self) -> Result<()> {
        if self.name.is_empty() {
            return Err(KvError::NameRequired);
        }
        if self.dir.as_os_str().is_empty() {
            return Err(KvError::Config("index directory is empty".into()));
        }
        if self.batch_size < MIN_BATCH_SIZE {
            self.batch_size = MIN_BATCH_SIZE;
        }
        Ok(())
    }
}

/// Durable ordered map used by the column family.
///
/// Write transactions are serialized per instance; reads run concurrently
/// against committed snapshots.
pub trait Index: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Write `entries` in batch transactions and return the position of the
    /// last committed entry (`None` for empty input).
    ///
    /// On failure the error is `KvError::PartialBatch { offset, .. }`:
    /// entries `[0, offset]` are committed, everything after is not, so the
    /// caller resumes from `offset + 1`.
    fn put_batch(&self, entries: &[IndexEntry]) -> Result<Option<usize>>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// A cursor holding one read transaction until it is closed or dropped
    fn iter(&self) -> Result<Box<dyn IndexCursor>>;

    fn put_meta(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn get_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn close(&self) -> Result<()>;
}

/// Key-value pair returned by cursor moves
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Bidirectional cursor over the full key space of an index snapshot
pub trait IndexCursor {
    fn first(&mut self) -> Result<Option<KvPair>>;

    fn last(&mut self) -> Result<Option<KvPair>>;

    /// Position at the first key >= `key`
    fn seek(&mut self, key: &[u8]) -> Result<Option<KvPair>>;

    /// Step forward; an unpositioned cursor starts at the first key
    fn next(&mut self) -> Result<Option<KvPair>>;

    /// Step backward; an unpositioned cursor starts at the last key
    fn prev(&mut self) -> Result<Option<KvPair>>;

    /// Release the read transaction
    fn close(self: Box<Self>) -> Result<()>;
}

pub(crate) fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(KvError::KeyRequired);
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(KvError::KeyTooLarge(key.len()));
    }
    Ok(())
}
