//! # vlogkv
//!
//! Storage core of an embedded key-value database organised into column
//! families, with:
//! - Write-Ahead Logging (WAL) per memtable for durability
//! - Crash recovery with partial write handling
//! - Background flush into a transactional B+tree index
//! - Key-value separation: large values live in an append-only value log
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Column Family                           │
//! │              put / get / delete / close                      │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │   Active    │  seal →  │ Immutables  │──── flush queue
//!   │  MemTable   │          │  (oldest    │         │
//!   │  + WAL      │          │   first)    │         ▼
//!   └─────────────┘          └─────────────┘   ┌───────────┐
//!                                              │   Flush   │
//!                                              │  Worker   │
//!                                              └─────┬─────┘
//!                                   ┌────────────────┴──────┐
//!                                   ▼                       ▼
//!                           ┌─────────────┐         ┌─────────────┐
//!                           │    Index    │         │  Value Log  │
//!                           │  (B+tree)   │         │  (append)   │
//!                           └─────────────┘         └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod cancel;

pub mod wal;
pub mod memtable;
pub mod vlog;
pub mod index;
pub mod column_family;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use cancel::CancelToken;
pub use column_family::{ColumnFamily, ColumnFamilyStat};
pub use config::{ColumnFamilyOptions, IoMode, MemtableKind, WriteOptions};
pub use error::{KvError, Result};
pub use index::{BpTreeIndex, Index, IndexCursor, IndexEntry, IndexMeta, IndexOptions, IndexRegistry};
pub use vlog::{FileValueLog, ValueLog};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of vlogkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
