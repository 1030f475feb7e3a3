//! Memtable representations
//!
//! The ordered structures a memtable keeps its entries in.

use crossbeam_skiplist::SkipMap;

use crate::config::MemtableKind;

use super::MemEntry;

/// Buckets in a hash-skiplist memtable
const HASH_BUCKETS: usize = 16;

/// Leading key bytes that pick the bucket
const HASH_PREFIX_LEN: usize = 8;

/// Ordered in-memory storage behind a memtable
pub(crate) trait TableRep: Send + Sync {
    fn insert(&self, key: Vec<u8>, entry: MemEntry);

    fn get(&self, key: &[u8]) -> Option<MemEntry>;

    /// Distinct keys held
    fn len(&self) -> usize;

    /// All entries in ascending key order
    fn sorted_entries(&self) -> Vec<(Vec<u8>, MemEntry)>;
}

pub(crate) fn new_rep(kind: MemtableKind) -> Box<dyn TableRep> {
    match kind {
        MemtableKind::SkipList => Box::new(SkipListRep::default()),
        MemtableKind::HashSkipList => Box::new(HashSkipListRep::new(HASH_BUCKETS)),
    }
}

// =============================================================================
// SkipList
// =============================================================================

#[derive(Default)]
pub(crate) struct SkipListRep {
    map: SkipMap<Vec<u8>, MemEntry>,
}

impl TableRep for SkipListRep {
    fn insert(&self, key: Vec<u8>, entry: MemEntry) {
        self.map.insert(key, entry);
    }

    fn get(&self, key: &[u8]) -> Option<MemEntry> {
        self.map.get(key).map(|e| e.value().clone())
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn sorted_entries(&self) -> Vec<(Vec<u8>, MemEntry)> {
        self.map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

// =============================================================================
// Hash SkipList
// =============================================================================

/// Keys are spread over buckets by a hash of their prefix; point lookups
/// touch one small skiplist, full scans merge all buckets.
pub(crate) struct HashSkipListRep {
    buckets: Vec<SkipMap<Vec<u8>, MemEntry>>,
}

impl HashSkipListRep {
    fn new(buckets: usize) -> Self {
        Self {
            buckets: (0..buckets).map(|_| SkipMap::new()).collect(),
        }
    }

    fn bucket(&self, key: &[u8]) -> &SkipMap<Vec<u8>, MemEntry> {
        let prefix = &key[..key.len().min(HASH_PREFIX_LEN)];
        let idx = crc32fast::hash(prefix) as usize % self.buckets.len();
        &self.buckets[idx]
    }
}

impl TableRep for HashSkipListRep {
    fn insert(&self, key: Vec<u8>, entry: MemEntry) {
        self.bucket(&key).insert(key, entry);
    }

    fn get(&self, key: &[u8]) -> Option<MemEntry> {
        self.bucket(key).get(key).map(|e| e.value().clone())
    }

    fn len(&self) -> usize {
        self.buckets.iter().map(SkipMap::len).sum()
    }

    fn sorted_entries(&self) -> Vec<(Vec<u8>, MemEntry)> {
        let mut entries: Vec<_> = self
            .buckets
            .iter()
            .flat_map(|b| b.iter().map(|e| (e.key().clone(), e.value().clone())))
            .collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
