//! Chunk identity cache.
//!
//! Maps a pointer to the single [`Chunk`] view materialized for it. The
//! "check cache, else read and insert" sequence runs under one coarse lock so
//! two callers can never end up holding divergent views of one address.

use crate::chunk::Chunk;
use crate::error::CoreResult;
use crate::pointer::ChunkPointer;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

/// Eviction policy of the chunk identity cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Keep every chunk ever materialized.
    Strong,
    /// Keep at most this many entries; only chunks nobody else holds are
    /// evicted.
    Bounded(usize),
    /// Keep entries only while some caller still holds the chunk.
    Weak,
}

enum Entry {
    Strong(Arc<Chunk>),
    Weak(Weak<Chunk>),
}

impl Entry {
    fn get(&self) -> Option<Arc<Chunk>> {
        match self {
            Self::Strong(chunk) => Some(Arc::clone(chunk)),
            Self::Weak(chunk) => chunk.upgrade(),
        }
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<ChunkPointer, Entry>,
    order: VecDeque<ChunkPointer>,
}

/// Pointer-keyed cache of materialized chunks.
pub struct ChunkCache {
    policy: CachePolicy,
    inner: Mutex<CacheInner>,
}

impl ChunkCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Returns the cached chunk for `ptr`, or materializes it with `load` and
    /// caches the result. The second value is true on a cache hit.
    ///
    /// # Errors
    ///
    /// Propagates errors from `load`.
    pub fn get_or_load(
        &self,
        ptr: ChunkPointer,
        load: impl FnOnce() -> CoreResult<Chunk>,
    ) -> CoreResult<(Arc<Chunk>, bool)> {
        let mut inner = self.inner.lock();
        if let Some(chunk) = inner.entries.get(&ptr).and_then(Entry::get) {
            return Ok((chunk, true));
        }
        let chunk = Arc::new(load()?);
        self.insert_locked(&mut inner, Arc::clone(&chunk));
        Ok((chunk, false))
    }

    /// Registers a freshly created chunk, replacing any stale entry.
    pub fn insert(&self, chunk: Arc<Chunk>) {
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, chunk);
    }

    /// Returns the cached chunk for `ptr` without loading.
    #[must_use]
    pub fn get(&self, ptr: ChunkPointer) -> Option<Arc<Chunk>> {
        self.inner.lock().entries.get(&ptr).and_then(Entry::get)
    }

    /// Drops the entry for `ptr`.
    pub fn remove(&self, ptr: ChunkPointer) {
        let mut inner = self.inner.lock();
        inner.entries.remove(&ptr);
        inner.order.retain(|p| *p != ptr);
    }

    /// Drops every entry at or past `offset`, used after truncation.
    pub fn remove_from(&self, offset: u64) {
        let mut inner = self.inner.lock();
        inner.entries.retain(|ptr, _| ptr.get() < offset);
        inner.order.retain(|ptr| ptr.get() < offset);
    }

    /// Live chunks whose header has unsynced changes.
    #[must_use]
    pub fn dirty_chunks(&self) -> Vec<Arc<Chunk>> {
        self.inner
            .lock()
            .entries
            .values()
            .filter_map(Entry::get)
            .filter(|chunk| chunk.is_dirty())
            .collect()
    }

    /// Number of entries, including dead weak entries not yet pruned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_locked(&self, inner: &mut CacheInner, chunk: Arc<Chunk>) {
        let ptr = chunk.ptr();
        let entry = match self.policy {
            CachePolicy::Weak => {
                if inner.order.len() % 256 == 255 {
                    Self::prune_dead(inner);
                }
                Entry::Weak(Arc::downgrade(&chunk))
            }
            CachePolicy::Bounded(limit) => {
                Self::evict_unshared(inner, limit.saturating_sub(1));
                Entry::Strong(chunk)
            }
            CachePolicy::Strong => Entry::Strong(chunk),
        };
        if inner.entries.insert(ptr, entry).is_none() {
            inner.order.push_back(ptr);
        }
    }

    fn evict_unshared(inner: &mut CacheInner, limit: usize) {
        let mut attempts = inner.order.len();
        while inner.entries.len() > limit && attempts > 0 {
            attempts -= 1;
            let Some(ptr) = inner.order.pop_front() else {
                break;
            };
            let evictable = match inner.entries.get(&ptr) {
                Some(Entry::Strong(chunk)) => Arc::strong_count(chunk) == 1 && !chunk.is_dirty(),
                _ => true,
            };
            if evictable {
                inner.entries.remove(&ptr);
            } else {
                inner.order.push_back(ptr);
            }
        }
    }

    fn prune_dead(inner: &mut CacheInner) {
        inner.entries.retain(|_, entry| entry.get().is_some());
        let entries = &inner.entries;
        inner.order.retain(|ptr| entries.contains_key(ptr));
    }
}

impl std::fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCache")
            .field("policy", &self.policy)
            .field("entries", &self.len())
            .finish()
    }
}
