//! Error types for vlogkv
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using KvError
pub type Result<T> = std::result::Result<T, KvError>;

/// Unified error type for vlogkv operations
#[derive(Debug, Error)]
pub enum KvError {
    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("column family name is empty")]
    NameRequired,

    #[error("column family already exists: {0}")]
    AlreadyExists(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Resource Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("open cancelled")]
    Cancelled,

    // -------------------------------------------------------------------------
    // Write Path Errors
    // -------------------------------------------------------------------------
    #[error("timed out waiting for memtable space")]
    BackpressureTimeout,

    /// The memtable was sealed for flushing; the write must go to the next one.
    #[error("memtable {0} is sealed")]
    MemtableSealed(u32),

    #[error("column family is closed")]
    Closed,

    #[error("flush worker stopped: {0}")]
    FlushStopped(String),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    // -------------------------------------------------------------------------
    // Index Errors
    // -------------------------------------------------------------------------
    #[error("Index error: {0}")]
    Index(String),

    #[error("index is closed")]
    IndexClosed,

    #[error("key required")]
    KeyRequired,

    #[error("key too large: {0} bytes")]
    KeyTooLarge(usize),

    /// A batch write stopped part way. Entries `[0, offset]` are committed.
    #[error("batch write failed after offset {offset:?}: {source}")]
    PartialBatch {
        offset: Option<usize>,
        #[source]
        source: Box<KvError>,
    },

    // -------------------------------------------------------------------------
    // Value Log Errors
    // -------------------------------------------------------------------------
    #[error("Value log error: {0}")]
    ValueLog(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for KvError {
    fn from(e: bincode::Error) -> Self {
        KvError::Serialization(e.to_string())
    }
}

// redb reports a distinct error type per call; they all land in `Index`.
macro_rules! index_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for KvError {
                fn from(e: $ty) -> Self {
                    KvError::Index(e.to_string())
                }
            }
        )*
    };
}

index_error_from!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
