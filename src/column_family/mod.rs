//! Column Family Module
//!
//! A column family binds one memtable stack, one index and one value log
//! behind put/get/delete, and owns memtable rotation and the flush worker.
//!
//! ## Write Path
//! ```text
//! put/delete
//!   └─ wait for room (bounded by mem_space_wait_timeout)
//!        ├─ active has room        → append to active (WAL + memory)
//!        ├─ free immutable slot    → rotate: seal active, queue it, open fid+1
//!        └─ all slots taken        → wait for the flush worker to free one
//! ```
//!
//! ## Read Path
//! ```text
//! active → immutables (newest first) → index → value log
//! ```
//! The first layer that knows the key decides: a tombstone or an expired
//! entry ends the search with no value.

mod flush;

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::{Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::config::{is_expired, ColumnFamilyOptions, IoMode, WriteOptions};
use crate::error::{KvError, Result};
use crate::index::{check_key, Index, IndexMeta, IndexOptions, IndexRegistry};
use crate::memtable::{self, entry_size, Lookup, Memtable, MemtableOptions};
use crate::vlog::{FileValueLog, ValueLog};
use crate::wal::{self, INITIAL_FID};

use flush::FlushWorker;

/// Metadata key holding the fid of the newest flushed memtable (u32 LE)
pub(crate) const FLUSHED_FID_KEY: &[u8] = b"flushed_fid";

/// Point-in-time view of a column family's memtable stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFamilyStat {
    pub active_fid: u32,
    pub immutable_count: usize,
    /// Bytes charged to the active memtable
    pub active_size: usize,
    /// Sealed memtables queued but not yet picked up by the flush worker
    pub flush_queue_len: usize,
}

struct MemtableList {
    active: Arc<dyn Memtable>,
    /// Sealed memtables awaiting flush, oldest at the front
    immutables: VecDeque<Arc<dyn Memtable>>,
}

/// State shared between the column family and its flush worker
pub(crate) struct Shared {
    opts: ColumnFamilyOptions,
    tables: Mutex<MemtableList>,
    /// Signalled whenever an immutable slot is freed (or on close)
    space: Condvar,
    index: Arc<dyn Index>,
    vlog: Arc<dyn ValueLog>,
    flush_tx: Sender<Arc<dyn Memtable>>,
    next_fid: AtomicU32,
    closed: AtomicBool,
}

impl Shared {
    fn memtable_options(&self, fid: u32) -> MemtableOptions {
        memtable_options(&self.opts, fid)
    }

    /// Block until the active memtable can take `size` more bytes and
    /// return it, rotating when a slot is free.
    fn wait_mem_space(&self, size: usize, deadline: Instant) -> Result<Arc<dyn Memtable>> {
        let mut tables = self.tables.lock();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(KvError::Closed);
            }
            if tables.active.has_room_for(size) {
                return Ok(Arc::clone(&tables.active));
            }
            if tables.immutables.len() < self.opts.memtable_nums - 1 {
                self.rotate(&mut tables)?;
                return Ok(Arc::clone(&tables.active));
            }
            if self.space.wait_until(&mut tables, deadline).timed_out() {
                debug!(
                    name = %self.opts.name,
                    immutables = tables.immutables.len(),
                    "gave up waiting for memtable space"
                );
                return Err(KvError::BackpressureTimeout);
            }
        }
    }

    /// Seal the active memtable, queue it for flush and open the next one
    fn rotate(&self, tables: &mut MemtableList) -> Result<()> {
        let fid = self.next_fid.fetch_add(1, Ordering::SeqCst);
        let fresh: Arc<dyn Memtable> = Arc::new(memtable::open(&self.memtable_options(fid))?);

        let sealed = std::mem::replace(&mut tables.active, fresh);
        sealed.seal();
        tables.immutables.push_back(Arc::clone(&sealed));

        info!(
            name = %self.opts.name,
            sealed_fid = sealed.fid(),
            sealed_size = sealed.size(),
            active_fid = fid,
            "rotated memtable"
        );

        // Slots are reserved under the lock above, so the queue cannot be full.
        self.flush_tx.try_send(sealed).map_err(|e| match e {
            TrySendError::Full(_) => KvError::FlushStopped("flush queue is full".into()),
            TrySendError::Disconnected(_) => KvError::FlushStopped("flush worker exited".into()),
        })
    }

    /// Drop a flushed memtable from the immutable list and wake writers
    fn reclaim(&self, flushed: &Arc<dyn Memtable>) {
        let mut tables = self.tables.lock();
        let fid = flushed.fid();
        match tables.immutables.front() {
            Some(oldest) if oldest.fid() == fid => {
                tables.immutables.pop_front();
            }
            _ => {
                warn!(
                    name = %self.opts.name,
                    fid,
                    "flushed memtable is not the oldest immutable"
                );
                tables.immutables.retain(|mem| mem.fid() != fid);
            }
        }
        drop(tables);
        self.space.notify_all();
    }
}

fn memtable_options(opts: &ColumnFamilyOptions, fid: u32) -> MemtableOptions {
    MemtableOptions {
        wal_dir: opts.wal_dir(),
        fid,
        size_limit: opts.memtable_size,
        kind: opts.memtable_kind,
        io_mode: IoMode::from_mmap_flag(opts.wal_mmap),
    }
}

/// A namespace of keys with its own memtables, index and value log
///
/// ## Concurrency:
/// - put/get/delete may be called from many threads
/// - the memtable list is guarded by one mutex; memtable contents by the
///   memtables themselves
/// - one flush thread per column family is the only remover of immutables
pub struct ColumnFamily {
    shared: Arc<Shared>,
    registry: Arc<IndexRegistry>,
    worker: Mutex<Option<FlushWorker>>,
    /// Index came from the registry (released there) rather than injected
    registered_index: bool,
}

impl ColumnFamily {
    /// Open (or create) the column family described by `opts`
    pub fn open(opts: ColumnFamilyOptions, registry: Arc<IndexRegistry>) -> Result<Self> {
        Self::open_with_cancel(opts, registry, &CancelToken::new())
    }

    /// Open, giving up with `KvError::Cancelled` once `cancel` fires
    pub fn open_with_cancel(
        opts: ColumnFamilyOptions,
        registry: Arc<IndexRegistry>,
        cancel: &CancelToken,
    ) -> Result<Self> {
        opts.validate()?;
        cancel.check()?;
        let dirs = create_dirs(&opts)?;

        registry.claim(&opts.name, dirs)?;
        let index_opts =
            IndexOptions::new(opts.name.clone(), opts.index_dir()).batch_size(opts.index_batch_size);
        let index: Arc<dyn Index> = match registry.acquire(index_opts) {
            Ok(index) => index as Arc<dyn Index>,
            Err(e) => {
                registry.unclaim(&opts.name);
                return Err(e);
            }
        };

        let name = opts.name.clone();
        let opened = cancel
            .check()
            .and_then(|_| {
                FileValueLog::open(
                    &opts.value_log_dir(),
                    opts.value_log_block_size,
                    IoMode::from_mmap_flag(opts.value_log_mmap),
                )
            })
            .and_then(|vlog| {
                Self::start(opts, Arc::clone(&registry), index, Arc::new(vlog), true, cancel)
            });

        if opened.is_err() {
            if let Err(e) = registry.release(&name) {
                warn!(name = %name, error = %e, "failed to release index after failed open");
            }
            registry.unclaim(&name);
        }
        opened
    }

    /// Open on caller-provided index and value log.
    ///
    /// The registry is still used to claim the name. Both backends are
    /// closed when the column family closes.
    pub fn open_with_backends(
        opts: ColumnFamilyOptions,
        registry: Arc<IndexRegistry>,
        index: Arc<dyn Index>,
        vlog: Arc<dyn ValueLog>,
        cancel: &CancelToken,
    ) -> Result<Self> {
        opts.validate()?;
        cancel.check()?;
        let dirs = create_dirs(&opts)?;

        registry.claim(&opts.name, dirs)?;
        let name = opts.name.clone();
        let opened = Self::start(opts, Arc::clone(&registry), index, vlog, false, cancel);
        if opened.is_err() {
            registry.unclaim(&name);
        }
        opened
    }

    /// Rebuild the memtable stack and start the flush worker
    fn start(
        opts: ColumnFamilyOptions,
        registry: Arc<IndexRegistry>,
        index: Arc<dyn Index>,
        vlog: Arc<dyn ValueLog>,
        registered_index: bool,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let (mut tables, next_fid) = load_memtables(&opts, index.as_ref(), cancel)?;

        // The newest segment keeps taking writes; everything older is flushed first.
        let active = tables.pop().ok_or_else(|| {
            KvError::Config("no memtable after replay".into())
        })?;
        for mem in &tables {
            mem.seal();
        }
        let recovered = tables.clone();

        let (flush_tx, flush_rx) = crossbeam::channel::bounded(opts.memtable_nums - 1);
        let shared = Arc::new(Shared {
            tables: Mutex::new(MemtableList {
                active: Arc::clone(&active),
                immutables: tables.into_iter().collect(),
            }),
            space: Condvar::new(),
            index,
            vlog,
            flush_tx,
            next_fid: AtomicU32::new(next_fid),
            closed: AtomicBool::new(false),
            opts,
        });

        let worker = FlushWorker::spawn(Arc::clone(&shared), flush_rx, recovered)?;

        info!(
            name = %shared.opts.name,
            dir = %shared.opts.dir_path.display(),
            active_fid = active.fid(),
            active_entries = active.entry_count(),
            "opened column family"
        );

        Ok(Self {
            shared,
            registry,
            worker: Mutex::new(Some(worker)),
            registered_index,
        })
    }

    // =========================================================================
    // Public API
    // =========================================================================

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with_options(key, value, &WriteOptions::default())
    }

    /// Store `value` under `key`, waiting (bounded) for memtable space
    pub fn put_with_options(&self, key: &[u8], value: &[u8], opts: &WriteOptions) -> Result<()> {
        check_key(key)?;
        self.write(entry_size(key.len(), value.len()), |mem| {
            mem.put(key, value, opts)
        })
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.delete_with_options(key, &WriteOptions::default())
    }

    /// Write a tombstone for `key`; waits for space like a put
    pub fn delete_with_options(&self, key: &[u8], opts: &WriteOptions) -> Result<()> {
        check_key(key)?;
        self.write(entry_size(key.len(), 0), |mem| mem.delete(key, opts))
    }

    /// Latest value of `key`, or None if absent, deleted or expired
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.is_closed() {
            return Err(KvError::Closed);
        }

        let layers: Vec<Arc<dyn Memtable>> = {
            let tables = self.shared.tables.lock();
            std::iter::once(Arc::clone(&tables.active))
                .chain(tables.immutables.iter().rev().cloned())
                .collect()
        };
        for mem in layers {
            match mem.get(key) {
                Lookup::Absent => continue,
                Lookup::Tombstone => return Ok(None),
                Lookup::Value(value) => return Ok(Some(value.to_vec())),
            }
        }

        let Some(raw) = self.shared.index.get(key)? else {
            return Ok(None);
        };
        let meta = IndexMeta::decode(&raw)?;
        if is_expired(meta.expires_at) {
            return Ok(None);
        }
        if let Some(value) = meta.value {
            return Ok(Some(value));
        }

        let entry = self.shared.vlog.read(meta.fid, meta.size, meta.offset)?;
        if entry.key != key {
            return Err(KvError::ValueLog(format!(
                "record at {}:{} belongs to another key",
                meta.fid, meta.offset
            )));
        }
        Ok(Some(entry.value))
    }

    /// Drain the flush queue, stop the worker and release all handles.
    ///
    /// The active memtable is not flushed; its WAL segment is synced and
    /// replayed on the next open. Calling close twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Taking the lock orders the flag before any writer's next wait.
        drop(self.shared.tables.lock());
        self.shared.space.notify_all();

        let mut result = Ok(());
        if let Some(mut worker) = self.worker.lock().take() {
            keep_first_error(&mut result, worker.shutdown());
        }

        let (active, pending) = {
            let tables = self.shared.tables.lock();
            (Arc::clone(&tables.active), tables.immutables.len())
        };
        if pending > 0 {
            warn!(
                name = %self.name(),
                pending,
                "closing with unflushed memtables; they will be replayed on open"
            );
        }
        keep_first_error(&mut result, active.sync());
        keep_first_error(&mut result, self.shared.vlog.close());

        let released = if self.registered_index {
            self.registry.release(self.name())
        } else {
            self.shared.index.close()
        };
        keep_first_error(&mut result, released);
        self.registry.unclaim(self.name());

        info!(name = %self.name(), "closed column family");
        result
    }

    pub fn stat(&self) -> ColumnFamilyStat {
        let tables = self.shared.tables.lock();
        ColumnFamilyStat {
            active_fid: tables.active.fid(),
            immutable_count: tables.immutables.len(),
            active_size: tables.active.size(),
            flush_queue_len: self.shared.flush_tx.len(),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.opts.name
    }

    pub fn options(&self) -> &ColumnFamilyOptions {
        &self.shared.opts
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn write<F>(&self, size: usize, apply: F) -> Result<()>
    where
        F: Fn(&dyn Memtable) -> Result<()>,
    {
        let deadline = Instant::now() + self.shared.opts.mem_space_wait_timeout;
        loop {
            let active = self.shared.wait_mem_space(size, deadline)?;
            match apply(active.as_ref()) {
                // Sealed between the room check and the append; go again.
                Err(KvError::MemtableSealed(_)) => continue,
                other => return other,
            }
        }
    }
}

impl Drop for ColumnFamily {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(name = %self.name(), error = %e, "error closing column family");
        }
    }
}

fn keep_first_error(result: &mut Result<()>, next: Result<()>) {
    if let Err(e) = next {
        if result.is_ok() {
            *result = Err(e);
        } else {
            error!(error = %e, "additional error while closing");
        }
    }
}

/// Create the data directories and return their canonical paths
fn create_dirs(opts: &ColumnFamilyOptions) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(&opts.dir_path)?;
    let mut dirs = Vec::with_capacity(2);
    for dir in [opts.wal_dir(), opts.value_log_dir()] {
        fs::create_dir_all(&dir)?;
        dirs.push(fs::canonicalize(&dir)?);
    }
    Ok(dirs)
}

/// Replay WAL segments oldest first, skipping those already flushed.
///
/// Returns the memtables in ascending fid order (never empty) and the next
/// unused fid.
fn load_memtables(
    opts: &ColumnFamilyOptions,
    index: &dyn Index,
    cancel: &CancelToken,
) -> Result<(Vec<Arc<dyn Memtable>>, u32)> {
    let flushed = match index.get_meta(FLUSHED_FID_KEY)? {
        Some(raw) => Some(decode_fid(&raw)?),
        None => None,
    };

    let wal_dir = opts.wal_dir();
    let mut next_fid = flushed.map_or(INITIAL_FID, |fid| fid.saturating_add(1));
    let mut tables: Vec<Arc<dyn Memtable>> = Vec::new();

    for fid in wal::list_segments(&wal_dir)? {
        cancel.check()?;
        next_fid = next_fid.max(fid.saturating_add(1));

        if flushed.is_some_and(|done| fid <= done) {
            warn!(fid, "removing WAL segment left behind after flush");
            fs::remove_file(wal::segment_path(&wal_dir, fid))?;
            continue;
        }
        tables.push(Arc::new(memtable::open(&memtable_options(opts, fid))?));
    }

    if tables.is_empty() {
        tables.push(Arc::new(memtable::open(&memtable_options(opts, next_fid))?));
        next_fid = next_fid.saturating_add(1);
    }

    Ok((tables, next_fid))
}

fn decode_fid(raw: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = raw
        .try_into()
        .map_err(|_| KvError::Index("malformed flushed_fid record".into()))?;
    Ok(u32::from_le_bytes(bytes))
}
