//! Index Registry
//!
//! Process-wide broker for index handles. The backing files take an
//! exclusive lock, so every namespace is opened at most once and shared by
//! reference count.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{KvError, Result};

use super::{BpTreeIndex, Index, IndexOptions};

struct Registered {
    index: Arc<BpTreeIndex>,
    refs: usize,
}

#[derive(Default)]
struct RegistryState {
    indexes: HashMap<String, Registered>,
    /// Namespaces owned by an open column family, with the WAL and value
    /// log directories they write to
    owners: HashMap<String, Vec<PathBuf>>,
}

/// Reference-counted owner of open indexes, keyed by namespace name
///
/// Create one per process (or per test) and hand it to every column family.
#[derive(Default)]
pub struct IndexRegistry {
    state: Mutex<RegistryState>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the open index for `opts.name`, opening it on first use
    pub fn acquire(&self, opts: IndexOptions) -> Result<Arc<BpTreeIndex>> {
        let mut state = self.state.lock();

        if let Some(registered) = state.indexes.get_mut(&opts.name) {
            if registered.index.options().dir != opts.dir {
                return Err(KvError::Config(format!(
                    "index {} is already open in {}",
                    opts.name,
                    registered.index.options().dir.display()
                )));
            }
            registered.refs += 1;
            debug!(name = %opts.name, refs = registered.refs, "reusing index");
            return Ok(Arc::clone(&registered.index));
        }

        let name = opts.name.clone();
        let index = Arc::new(BpTreeIndex::open(opts)?);
        state.indexes.insert(
            name,
            Registered {
                index: Arc::clone(&index),
                refs: 1,
            },
        );
        Ok(index)
    }

    /// Drop one reference; the last one closes the index
    pub fn release(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();

        let Some(registered) = state.indexes.get_mut(name) else {
            return Ok(());
        };
        registered.refs -= 1;
        if registered.refs > 0 {
            return Ok(());
        }

        if let Some(registered) = state.indexes.remove(name) {
            registered.index.close()?;
        }
        Ok(())
    }

    /// Live references to the index for `name`
    pub fn ref_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .indexes
            .get(name)
            .map_or(0, |registered| registered.refs)
    }

    /// Mark `name` and its data directories as owned by a column family
    ///
    /// Fails with `AlreadyExists` for an owned name, and with a config error
    /// when another column family already writes to one of `dirs`.
    pub(crate) fn claim(&self, name: &str, dirs: Vec<PathBuf>) -> Result<()> {
        let mut state = self.state.lock();
        if state.owners.contains_key(name) {
            return Err(KvError::AlreadyExists(name.to_string()));
        }
        for (owner, owned) in &state.owners {
            if let Some(dir) = dirs.iter().find(|dir| owned.contains(*dir)) {
                return Err(KvError::Config(format!(
                    "directory {} is already used by column family {}",
                    dir.display(),
                    owner
                )));
            }
        }
        state.owners.insert(name.to_string(), dirs);
        Ok(())
    }

    pub(crate) fn unclaim(&self, name: &str) {
        self.state.lock().owners.remove(name);
    }

    /// Whether a column family currently owns `name`
    pub fn is_claimed(&self, name: &str) -> bool {
        self.state.lock().owners.contains_key(name)
    }
}
