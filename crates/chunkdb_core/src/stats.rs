//! Cluster statistics.
//!
//! All counters are atomic and can be read while operations are in progress.
//!
//! # Usage
//!
//! ```rust
//! use chunkdb_core::{AllocateTicket, Cluster};
//!
//! let cluster = Cluster::in_memory().unwrap();
//! cluster.alloc(&AllocateTicket::bytes(16)).unwrap();
//!
//! let stats = cluster.stats().snapshot();
//! assert!(stats.allocations >= 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Allocator and compaction counters.
#[derive(Debug, Default)]
pub struct ClusterStats {
    /// Chunks handed out by the memory manager.
    allocations: AtomicU64,
    /// Chunks shredded and returned to the free list.
    frees: AtomicU64,
    /// Chain growth requests served.
    chain_growths: AtomicU64,
    /// Chains copied to a new address by relocation.
    relocations: AtomicU64,
    /// Bytes removed from the end of the store.
    bytes_packed: AtomicU64,
}

impl ClusterStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_free(&self) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_chain_growth(&self) {
        self.chain_growths.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_relocation(&self) {
        self.relocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_packed(&self, bytes: u64) {
        self.bytes_packed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Chunks handed out by the memory manager.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Chunks freed.
    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    /// Chain growth requests served.
    pub fn chain_growths(&self) -> u64 {
        self.chain_growths.load(Ordering::Relaxed)
    }

    /// Relocations performed.
    pub fn relocations(&self) -> u64 {
        self.relocations.load(Ordering::Relaxed)
    }

    /// Bytes truncated from the store by packing.
    pub fn bytes_packed(&self) -> u64 {
        self.bytes_packed.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allocations: self.allocations(),
            frees: self.frees(),
            chain_growths: self.chain_growths(),
            relocations: self.relocations(),
            bytes_packed: self.bytes_packed(),
        }
    }
}

/// A point-in-time copy of [`ClusterStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Chunks handed out by the memory manager.
    pub allocations: u64,
    /// Chunks freed.
    pub frees: u64,
    /// Chain growth requests served.
    pub chain_growths: u64,
    /// Relocations performed.
    pub relocations: u64,
    /// Bytes truncated from the store by packing.
    pub bytes_packed: u64,
}
