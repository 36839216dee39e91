//! In-memory [`TableStore`].
//!
//! Entries are held in an LRU cache, so the store never grows past its
//! capacity: the least recently used key is dropped first.

use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::trace;

use crate::protocols::TableStore;

/// Default number of entries held by [`MemoryStore`].
pub const DEFAULT_STORE_CAPACITY: usize = 10_000;

/// Largest value accepted by [`MemoryStore::write`].
/// Kept below the datagram limit so a stored value can always be returned.
pub const MAX_STORED_VALUE_SIZE: usize = 60 * 1024;

#[derive(Debug)]
pub struct MemoryStore {
    entries: LruCache<String, Vec<u8>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_capacity(NonZeroUsize::new(DEFAULT_STORE_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TableStore for MemoryStore {
    fn read(&mut self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn write(&mut self, key: &str, value: Vec<u8>) -> bool {
        if value.len() > MAX_STORED_VALUE_SIZE {
            trace!(key, len = value.len(), "refusing oversized value");
            return false;
        }
        self.entries.put(key.to_string(), value);
        true
    }
}
