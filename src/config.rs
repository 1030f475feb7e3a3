//! Configuration for vlogkv
//!
//! Column family options with sensible defaults, plus per-write options.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{KvError, Result};

/// Options for one column family
#[derive(Debug, Clone)]
pub struct ColumnFamilyOptions {
    // -------------------------------------------------------------------------
    // Namespace / Layout
    // -------------------------------------------------------------------------
    /// Column family name; must be non-empty
    pub name: String,

    /// Root directory, shareable by several column families.
    /// Internal structure (defaults):
    ///   {dir_path}/
    ///     ├── {name}/
    ///     │   ├── 000000000.wal    (WAL segments, one per memtable)
    ///     │   └── vlog/            (value log segments)
    ///     └── index/               ({name}.meta, {name}.index)
    pub dir_path: PathBuf,

    /// Directory for WAL segments (None = dir_path/name)
    pub wal_dir: Option<PathBuf>,

    /// Directory for value log segments (None = dir_path/name/vlog)
    pub value_log_dir: Option<PathBuf>,

    /// Directory for index files (None = dir_path/index)
    pub index_dir: Option<PathBuf>,

    // -------------------------------------------------------------------------
    // MemTable Configuration
    // -------------------------------------------------------------------------
    /// Max size of one memtable in bytes before rotation
    pub memtable_size: usize,

    /// Number of memtable slots (1 active + up to n-1 immutable)
    pub memtable_nums: usize,

    /// Backing structure of the memtables
    pub memtable_kind: MemtableKind,

    /// How long a writer waits for memtable space before giving up
    pub mem_space_wait_timeout: Duration,

    // -------------------------------------------------------------------------
    // I/O Configuration
    // -------------------------------------------------------------------------
    /// Read WAL segments through mmap during replay
    pub wal_mmap: bool,

    /// Serve value log reads through mmap
    pub value_log_mmap: bool,

    /// Max size of one value log segment
    pub value_log_block_size: u64,

    /// Values longer than this go to the value log; shorter ones stay inline
    pub value_threshold: usize,

    // -------------------------------------------------------------------------
    // Flush Configuration
    // -------------------------------------------------------------------------
    /// Entries per index transaction during flush
    pub index_batch_size: usize,

    /// Initial delay before retrying a failed flush
    pub flush_retry_backoff: Duration,
}

/// Memtable backing structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemtableKind {
    /// A single ordered skiplist
    SkipList,

    /// Keys hashed into buckets, each bucket an ordered skiplist
    HashSkipList,
}

/// How segment files are read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Positioned reads through a regular file handle
    FileIo,

    /// Reads through a memory map of the file
    MMap,
}

impl IoMode {
    pub fn from_mmap_flag(mmap: bool) -> Self {
        if mmap {
            IoMode::MMap
        } else {
            IoMode::FileIo
        }
    }
}

impl Default for ColumnFamilyOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            dir_path: PathBuf::from("./vlogkv_data"),
            wal_dir: None,
            value_log_dir: None,
            index_dir: None,
            memtable_size: 64 * 1024 * 1024, // 64 MB
            memtable_nums: 5,
            memtable_kind: MemtableKind::SkipList,
            mem_space_wait_timeout: Duration::from_secs(1),
            wal_mmap: false,
            value_log_mmap: false,
            value_log_block_size: 256 * 1024 * 1024, // 256 MB
            value_threshold: 128,
            index_batch_size: 100_000,
            flush_retry_backoff: Duration::from_millis(50),
        }
    }
}

impl ColumnFamilyOptions {
    /// Create a new options builder for the named column family
    pub fn builder(name: impl Into<String>) -> ColumnFamilyOptionsBuilder {
        let mut builder = ColumnFamilyOptionsBuilder::default();
        builder.options.name = name.into();
        builder
    }

    /// Resolved WAL directory
    pub fn wal_dir(&self) -> PathBuf {
        self.wal_dir
            .clone()
            .unwrap_or_else(|| self.dir_path.join(&self.name))
    }

    /// Resolved value log directory
    pub fn value_log_dir(&self) -> PathBuf {
        self.value_log_dir
            .clone()
            .unwrap_or_else(|| self.dir_path.join(&self.name).join("vlog"))
    }

    /// Resolved index directory
    pub fn index_dir(&self) -> PathBuf {
        self.index_dir
            .clone()
            .unwrap_or_else(|| self.dir_path.join("index"))
    }

    /// Reject option combinations the column family cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(KvError::NameRequired);
        }
        // The name doubles as a directory under the root.
        if self.name == "." || self.name == ".." || self.name.contains(['/', '\\']) {
            return Err(KvError::Config(format!(
                "column family name {:?} is not a valid directory name",
                self.name
            )));
        }
        if self.memtable_nums < 2 {
            return Err(KvError::Config(format!(
                "memtable_nums must be at least 2, got {}",
                self.memtable_nums
            )));
        }
        if self.memtable_size == 0 {
            return Err(KvError::Config("memtable_size must be positive".into()));
        }
        if self.value_log_block_size == 0 {
            return Err(KvError::Config(
                "value_log_block_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for ColumnFamilyOptions
#[derive(Default)]
pub struct ColumnFamilyOptionsBuilder {
    options: ColumnFamilyOptions,
}

impl ColumnFamilyOptionsBuilder {
    /// Set the column family root directory
    pub fn dir_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.dir_path = path.into();
        self
    }

    /// Set a separate WAL directory
    pub fn wal_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.wal_dir = Some(path.into());
        self
    }

    /// Set a separate value log directory
    pub fn value_log_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.value_log_dir = Some(path.into());
        self
    }

    /// Set a separate index directory
    pub fn index_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.index_dir = Some(path.into());
        self
    }

    /// Set the memtable size limit (in bytes)
    pub fn memtable_size(mut self, size: usize) -> Self {
        self.options.memtable_size = size;
        self
    }

    /// Set the number of memtable slots
    pub fn memtable_nums(mut self, nums: usize) -> Self {
        self.options.memtable_nums = nums;
        self
    }

    /// Set the memtable backing structure
    pub fn memtable_kind(mut self, kind: MemtableKind) -> Self {
        self.options.memtable_kind = kind;
        self
    }

    /// Set the bounded wait for memtable space
    pub fn mem_space_wait_timeout(mut self, timeout: Duration) -> Self {
        self.options.mem_space_wait_timeout = timeout;
        self
    }

    pub fn wal_mmap(mut self, enabled: bool) -> Self {
        self.options.wal_mmap = enabled;
        self
    }

    pub fn value_log_mmap(mut self, enabled: bool) -> Self {
        self.options.value_log_mmap = enabled;
        self
    }

    /// Set the value log segment size (in bytes)
    pub fn value_log_block_size(mut self, size: u64) -> Self {
        self.options.value_log_block_size = size;
        self
    }

    /// Set the inline value threshold (in bytes)
    pub fn value_threshold(mut self, size: usize) -> Self {
        self.options.value_threshold = size;
        self
    }

    pub fn index_batch_size(mut self, size: usize) -> Self {
        self.options.index_batch_size = size;
        self
    }

    pub fn flush_retry_backoff(mut self, backoff: Duration) -> Self {
        self.options.flush_retry_backoff = backoff;
        self
    }

    pub fn build(self) -> ColumnFamilyOptions {
        self.options
    }
}

/// Per-write durability knobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// fsync the WAL before acknowledging the write
    pub sync: bool,

    /// Skip the WAL entirely (lost on crash)
    pub disable_wal: bool,

    /// Absolute expiry (unix seconds); None = never expires
    pub expires_at: Option<u64>,
}

impl WriteOptions {
    pub fn sync() -> Self {
        Self {
            sync: true,
            ..Self::default()
        }
    }

    pub fn no_wal() -> Self {
        Self {
            disable_wal: true,
            ..Self::default()
        }
    }

    pub fn expires_at(unix_secs: u64) -> Self {
        Self {
            expires_at: Some(unix_secs),
            ..Self::default()
        }
    }
}

/// Current unix time in seconds
pub(crate) fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// True if an entry with this expiry is no longer visible
pub(crate) fn is_expired(expires_at: Option<u64>) -> bool {
    matches!(expires_at, Some(at) if at <= now_unix_secs())
}
