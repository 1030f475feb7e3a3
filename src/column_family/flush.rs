//! Flush Worker
//!
//! One background thread per column family. It receives sealed memtables
//! from the bounded flush queue and persists them into the value log and
//! the index. It is the only code that removes immutable memtables or
//! deletes WAL segments.
//!
//! ## Per memtable
//! ```text
//! prepare:  sorted snapshot → large values to value log → IndexMeta list
//!           (resumes from the next unconverted key on retry)
//! commit:   index.put_batch (resumes from last committed offset on retry)
//!           tombstones → index.delete
//!           flushed_fid → metadata store
//! reclaim:  pop oldest immutable → delete WAL segment → wake writers
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{select, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::config::is_expired;
use crate::error::{KvError, Result};
use crate::index::{IndexEntry, IndexMeta};
use crate::memtable::{MemEntry, Memtable};
use crate::vlog::ValueLogEntry;

use super::{Shared, FLUSHED_FID_KEY};

/// Attempts per memtable once shutdown has been requested
const SHUTDOWN_FLUSH_ATTEMPTS: usize = 3;

/// Backoff grows up to this multiple of the configured base
const MAX_BACKOFF_FACTOR: u32 = 16;

/// Handle owned by the column family
pub(crate) struct FlushWorker {
    /// Dropping this is the shutdown signal
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl FlushWorker {
    /// Start the worker. `recovered` are immutable memtables found at open,
    /// oldest first; they are flushed before anything from the queue.
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        flush_rx: Receiver<Arc<dyn Memtable>>,
        recovered: Vec<Arc<dyn Memtable>>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded::<()>(0);
        let name = format!("flush-{}", shared.opts.name);

        let task = FlushTask {
            shared,
            flush_rx,
            shutdown_rx,
            shutting_down: false,
        };
        let handle = thread::Builder::new().name(name).spawn(move || task.run(recovered))?;

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Signal shutdown, wait for the queue to drain and join the thread
    pub(crate) fn shutdown(&mut self) -> Result<()> {
        drop(self.shutdown_tx.take());
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| KvError::FlushStopped("flush thread panicked".into()))?,
            None => Ok(()),
        }
    }
}

/// Flush progress kept across retries so a retry never rewrites a value log
/// record or recommits entries that already made it into the index.
struct PreparedFlush {
    fid: u32,
    /// Sorted snapshot of the memtable
    snapshot: Vec<(Vec<u8>, MemEntry)>,
    /// Snapshot entries before this position are converted
    next_key: usize,
    /// Values were appended to the value log since the last sync
    unsynced: bool,
    entries: Vec<IndexEntry>,
    tombstones: Vec<Vec<u8>>,
    /// Entries before this position are committed
    next_entry: usize,
    /// Tombstones before this position are applied
    next_tombstone: usize,
}

impl PreparedFlush {
    fn new(mem: &dyn Memtable) -> Self {
        Self {
            fid: mem.fid(),
            snapshot: mem.entries(),
            next_key: 0,
            unsynced: false,
            entries: Vec::new(),
            tombstones: Vec::new(),
            next_entry: 0,
            next_tombstone: 0,
        }
    }
}

enum Event {
    Flush(Arc<dyn Memtable>),
    Shutdown,
    Disconnected,
}

struct FlushTask {
    shared: Arc<Shared>,
    flush_rx: Receiver<Arc<dyn Memtable>>,
    shutdown_rx: Receiver<()>,
    shutting_down: bool,
}

impl FlushTask {
    fn run(mut self, recovered: Vec<Arc<dyn Memtable>>) -> Result<()> {
        for mem in recovered {
            self.flush_with_retry(&mem)?;
        }

        loop {
            if self.shutting_down {
                return self.drain();
            }
            let event = select! {
                recv(self.flush_rx) -> msg => match msg {
                    Ok(mem) => Event::Flush(mem),
                    Err(_) => Event::Disconnected,
                },
                recv(self.shutdown_rx) -> _ => Event::Shutdown,
            };
            match event {
                Event::Flush(mem) => self.flush_with_retry(&mem)?,
                Event::Shutdown => self.shutting_down = true,
                Event::Disconnected => return Ok(()),
            }
        }
    }

    /// Flush whatever is still queued, then exit
    fn drain(&mut self) -> Result<()> {
        while let Ok(mem) = self.flush_rx.try_recv() {
            self.flush_with_retry(&mem)?;
        }
        debug!(name = %self.shared.opts.name, "flush queue drained");
        Ok(())
    }

    /// Retry until the memtable is flushed. While running this never gives
    /// up; after shutdown it stops after a few attempts and leaves the WAL
    /// segment for the next open to replay.
    fn flush_with_retry(&mut self, mem: &Arc<dyn Memtable>) -> Result<()> {
        let base = self.shared.opts.flush_retry_backoff;
        let mut backoff = base;
        let mut prepared = None;
        let mut attempts_after_shutdown = 0;

        loop {
            let err = match self.flush(mem, &mut prepared) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            error!(
                name = %self.shared.opts.name,
                fid = mem.fid(),
                error = %err,
                "flush failed, memtable kept for retry"
            );

            if self.shutting_down {
                attempts_after_shutdown += 1;
                if attempts_after_shutdown >= SHUTDOWN_FLUSH_ATTEMPTS {
                    return Err(err);
                }
                thread::sleep(backoff);
            } else {
                match self.shutdown_rx.recv_timeout(backoff) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => self.shutting_down = true,
                }
            }
            backoff = next_backoff(backoff, base);
        }
    }

    fn flush(&self, mem: &Arc<dyn Memtable>, prepared: &mut Option<PreparedFlush>) -> Result<()> {
        let fid = mem.fid();
        let progress = prepared.get_or_insert_with(|| PreparedFlush::new(mem.as_ref()));
        self.prepare(progress)?;

        // Index entries; on a partial failure remember how far we got.
        match self
            .shared
            .index
            .put_batch(&progress.entries[progress.next_entry..])
        {
            Ok(_) => progress.next_entry = progress.entries.len(),
            Err(KvError::PartialBatch { offset, source }) => {
                if let Some(offset) = offset {
                    progress.next_entry += offset + 1;
                }
                return Err(*source);
            }
            Err(e) => return Err(e),
        }

        while progress.next_tombstone < progress.tombstones.len() {
            self.shared
                .index
                .delete(&progress.tombstones[progress.next_tombstone])?;
            progress.next_tombstone += 1;
        }

        self.shared
            .index
            .put_meta(FLUSHED_FID_KEY, &progress.fid.to_le_bytes())?;

        debug!(
            name = %self.shared.opts.name,
            fid,
            entries = progress.entries.len(),
            tombstones = progress.tombstones.len(),
            "flushed memtable"
        );

        self.shared.reclaim(mem);
        if let Err(e) = mem.remove_wal() {
            // Already durable; the next open skips segments at or below flushed_fid.
            warn!(fid, error = %e, "could not delete flushed WAL segment");
        }
        *prepared = None;
        Ok(())
    }

    /// Move large values to the value log and build the index entries,
    /// continuing from wherever a failed attempt stopped
    fn prepare(&self, progress: &mut PreparedFlush) -> Result<()> {
        let threshold = self.shared.opts.value_threshold;

        while progress.next_key < progress.snapshot.len() {
            let (key, entry) = &progress.snapshot[progress.next_key];
            let value = match &entry.value {
                Some(value) if !is_expired(entry.expires_at) => value,
                // Deleted or already expired: older versions must disappear too.
                _ => {
                    progress.tombstones.push(key.clone());
                    progress.next_key += 1;
                    continue;
                }
            };

            let meta = if value.len() > threshold {
                let pos = self.shared.vlog.write(&ValueLogEntry {
                    key: key.clone(),
                    value: value.to_vec(),
                    expires_at: entry.expires_at,
                })?;
                progress.unsynced = true;
                IndexMeta::pointer(pos.fid, pos.offset, pos.size, entry.expires_at)
            } else {
                IndexMeta::inline(value.to_vec(), entry.expires_at)
            };
            progress.entries.push(IndexEntry::new(key.clone(), meta.encode()?));
            progress.next_key += 1;
        }

        // Pointers must not reach the index before the values are durable.
        if progress.unsynced {
            self.shared.vlog.sync()?;
            progress.unsynced = false;
        }
        Ok(())
    }
}

fn next_backoff(current: Duration, base: Duration) -> Duration {
    (current * 2).min(base * MAX_BACKOFF_FACTOR)
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.shutdown() {
                error!(error = %e, "flush worker stopped with error");
            } else {
                info!("flush worker stopped");
            }
        }
    }
}
