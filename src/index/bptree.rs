//! B+tree index on redb
//!
//! redb is a copy-on-write B-tree: one write transaction at a time, any
//! number of readers on committed snapshots. A database file can only be
//! opened once per process, which is why instances go through
//! [`IndexRegistry`](super::IndexRegistry).

use std::fs;
use std::ops::Bound;

use parking_lot::RwLock;
use redb::{Database, ReadOnlyTable, ReadTransaction, ReadableTable, TableDefinition};
use tracing::{debug, info};

use crate::error::{KvError, Result};

use super::{check_key, Index, IndexCursor, IndexEntry, IndexOptions, KvPair};

const META_FILE_SUFFIX: &str = "meta";
const INDEX_FILE_SUFFIX: &str = "index";

type BytesTable<'a> = TableDefinition<'a, &'static [u8], &'static [u8]>;

struct Stores {
    meta: Database,
    db: Database,
}

/// Index for one namespace, backed by two redb files
pub struct BpTreeIndex {
    opts: IndexOptions,
    /// None once closed
    stores: RwLock<Option<Stores>>,
}

impl BpTreeIndex {
    /// Open both files and make sure the namespace tables exist.
    ///
    /// Prefer `IndexRegistry::acquire`; opening the same files twice in one
    /// process fails.
    pub fn open(mut opts: IndexOptions) -> Result<Self> {
        opts.check()?;
        fs::create_dir_all(&opts.dir)?;

        let path = |suffix: &str| opts.dir.join(format!("{}.{}", opts.name, suffix));
        let meta = Database::create(path(META_FILE_SUFFIX))?;
        let db = Database::create(path(INDEX_FILE_SUFFIX))?;

        let table = BytesTable::new(&opts.name);
        for store in [&meta, &db] {
            let txn = store.begin_write()?;
            txn.open_table(table)?;
            txn.commit()?;
        }

        info!(name = %opts.name, dir = %opts.dir.display(), "opened index");

        Ok(Self {
            opts,
            stores: RwLock::new(Some(Stores { meta, db })),
        })
    }

    pub fn name(&self) -> &str {
        &self.opts.name
    }

    pub fn options(&self) -> &IndexOptions {
        &self.opts
    }

    pub fn is_closed(&self) -> bool {
        self.stores.read().is_none()
    }

    fn table(&self) -> BytesTable<'_> {
        TableDefinition::new(&self.opts.name)
    }

    fn put_in(&self, store: &Database, key: &[u8], value: &[u8]) -> Result<()> {
        let txn = store.begin_write()?;
        {
            let mut table = txn.open_table(self.table())?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn get_in(&self, store: &Database, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = store.begin_read()?;
        let table = txn.open_table(self.table())?;
        let value = table.get(key)?.map(|guard| guard.value().to_vec());
        Ok(value)
    }
}

/// Wrap a failure inside a batch with the last committed position
fn partial(offset: Option<usize>, source: KvError) -> KvError {
    KvError::PartialBatch {
        offset,
        source: Box::new(source),
    }
}

impl Index for BpTreeIndex {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        let stores = self.stores.read();
        let stores = stores.as_ref().ok_or(KvError::IndexClosed)?;
        self.put_in(&stores.db, key, value)
    }

    fn put_batch(&self, entries: &[IndexEntry]) -> Result<Option<usize>> {
        if entries.is_empty() {
            return Ok(None);
        }

        let stores = self.stores.read();
        let stores = stores
            .as_ref()
            .ok_or_else(|| partial(None, KvError::IndexClosed))?;

        let mut committed: Option<usize> = None;
        for (batch_idx, batch) in entries.chunks(self.opts.batch_size).enumerate() {
            let base = batch_idx * self.opts.batch_size;
            let txn = stores
                .db
                .begin_write()
                .map_err(|e| partial(committed, e.into()))?;

            // First entry of this batch that could not be written, if any.
            let mut failure: Option<(usize, KvError)> = None;
            {
                let mut table = txn
                    .open_table(self.table())
                    .map_err(|e| partial(committed, e.into()))?;
                for (i, entry) in batch.iter().enumerate() {
                    let written = check_key(&entry.key).and_then(|_| {
                        table
                            .insert(entry.key.as_slice(), entry.value.as_slice())
                            .map(|_| ())
                            .map_err(KvError::from)
                    });
                    if let Err(e) = written {
                        failure = Some((base + i, e));
                        break;
                    }
                }
            }

            // Keep whatever precedes the failing entry.
            let last_written = match &failure {
                Some((failed_at, _)) if *failed_at == base => None,
                Some((failed_at, _)) => Some(failed_at - 1),
                None => Some(base + batch.len() - 1),
            };

            match last_written {
                Some(last) => {
                    txn.commit().map_err(|e| partial(committed, e.into()))?;
                    committed = Some(last);
                }
                None => txn.abort().map_err(|e| partial(committed, e.into()))?,
            }

            if let Some((failed_at, e)) = failure {
                debug!(name = %self.opts.name, failed_at, ?committed, "batch write stopped");
                return Err(partial(committed, e));
            }
        }

        Ok(committed)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let stores = self.stores.read();
        let stores = stores.as_ref().ok_or(KvError::IndexClosed)?;
        self.get_in(&stores.db, key)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let stores = self.stores.read();
        let stores = stores.as_ref().ok_or(KvError::IndexClosed)?;

        let txn = stores.db.begin_write()?;
        {
            let mut table = txn.open_table(self.table())?;
            table.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn iter(&self) -> Result<Box<dyn IndexCursor>> {
        let stores = self.stores.read();
        let stores = stores.as_ref().ok_or(KvError::IndexClosed)?;

        let txn = stores.db.begin_read()?;
        let table = txn.open_table(self.table())?;
        Ok(Box::new(BpTreeCursor {
            table,
            _txn: txn,
            position: Position::Unset,
        }))
    }

    fn put_meta(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        let stores = self.stores.read();
        let stores = stores.as_ref().ok_or(KvError::IndexClosed)?;
        self.put_in(&stores.meta, key, value)
    }

    fn get_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let stores = self.stores.read();
        let stores = stores.as_ref().ok_or(KvError::IndexClosed)?;
        self.get_in(&stores.meta, key)
    }

    fn close(&self) -> Result<()> {
        // Dropping the databases releases the file locks.
        if self.stores.write().take().is_some() {
            info!(name = %self.opts.name, "closed index");
        }
        Ok(())
    }
}

// =============================================================================
// Cursor
// =============================================================================

enum Position {
    /// No move made yet
    Unset,
    At(Vec<u8>),
    /// Stepped off either end
    End,
}

struct BpTreeCursor {
    table: ReadOnlyTable<&'static [u8], &'static [u8]>,
    // Declared after `table` so the snapshot outlives it.
    _txn: ReadTransaction,
    position: Position,
}

impl BpTreeCursor {
    fn land(&mut self, found: Option<KvPair>) -> Option<KvPair> {
        self.position = match &found {
            Some((key, _)) => Position::At(key.clone()),
            None => Position::End,
        };
        found
    }

    fn scan(
        &self,
        range: (Bound<&[u8]>, Bound<&[u8]>),
        backwards: bool,
    ) -> Result<Option<KvPair>> {
        let mut range = self.table.range::<&[u8]>(range)?;
        let item = if backwards {
            range.next_back()
        } else {
            range.next()
        };
        let pair = item
            .transpose()?
            .map(|(k, v)| (k.value().to_vec(), v.value().to_vec()));
        Ok(pair)
    }
}

impl IndexCursor for BpTreeCursor {
    fn first(&mut self) -> Result<Option<KvPair>> {
        let found = self
            .table
            .first()?
            .map(|(k, v)| (k.value().to_vec(), v.value().to_vec()));
        Ok(self.land(found))
    }

    fn last(&mut self) -> Result<Option<KvPair>> {
        let found = self
            .table
            .last()?
            .map(|(k, v)| (k.value().to_vec(), v.value().to_vec()));
        Ok(self.land(found))
    }

    fn seek(&mut self, key: &[u8]) -> Result<Option<KvPair>> {
        let found = self.scan((Bound::Included(key), Bound::Unbounded), false)?;
        Ok(self.land(found))
    }

    fn next(&mut self) -> Result<Option<KvPair>> {
        let key = match &self.position {
            Position::Unset => return self.first(),
            Position::End => return Ok(None),
            Position::At(key) => key.clone(),
        };
        let found = self.scan((Bound::Excluded(key.as_slice()), Bound::Unbounded), false)?;
        Ok(self.land(found))
    }

    fn prev(&mut self) -> Result<Option<KvPair>> {
        let key = match &self.position {
            Position::Unset => return self.last(),
            Position::End => return Ok(None),
            Position::At(key) => key.clone(),
        };
        let found = self.scan((Bound::Unbounded, Bound::Excluded(key.as_slice())), true)?;
        Ok(self.land(found))
    }

    fn close(self: Box<Self>) -> Result<()> {
        drop(self);
        Ok(())
    }
}
