//! Cluster configuration.

use crate::cache::CachePolicy;
use crate::defragment::FreeChunkScanPolicy;

/// Configuration for creating or opening a cluster.
#[derive(Debug, Clone)]
pub struct Config {
    /// Enables additional consistency checks (chain invariants, cache
    /// agreement, allocation contracts). Never changes outcomes, only fails
    /// earlier with a more specific error.
    pub debug_validation: bool,

    /// Eviction policy of the chunk identity cache.
    pub cache_policy: CachePolicy,

    /// Reachability scan performed when an existing store is opened.
    pub open_scan_policy: FreeChunkScanPolicy,

    /// Number of garbage chunks freed per batch by the reachability scan.
    pub free_batch_size: usize,

    /// Maximum chunks inspected after a free chunk when looking for a wedge.
    pub optimize_lookahead_chunks: usize,

    /// Maximum intervening capacity inspected when looking for a wedge.
    pub optimize_lookahead_bytes: u64,

    /// Upper bound on iterations of every compaction fixpoint loop.
    pub max_compaction_passes: usize,

    /// Smallest remainder that is split off into its own free chunk.
    pub min_split_footprint: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug_validation: false,
            cache_policy: CachePolicy::Weak,
            open_scan_policy: FreeChunkScanPolicy::Nothing,
            free_batch_size: 64,
            optimize_lookahead_chunks: 16,
            optimize_lookahead_bytes: 256,
            max_compaction_passes: 4096,
            min_split_footprint: 8,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether debug validation is enabled.
    #[must_use]
    pub const fn debug_validation(mut self, value: bool) -> Self {
        self.debug_validation = value;
        self
    }

    /// Sets the chunk cache eviction policy.
    #[must_use]
    pub const fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Sets the reachability scan policy used on open.
    #[must_use]
    pub const fn open_scan_policy(mut self, policy: FreeChunkScanPolicy) -> Self {
        self.open_scan_policy = policy;
        self
    }

    /// Sets the garbage free batch size.
    #[must_use]
    pub const fn free_batch_size(mut self, size: usize) -> Self {
        self.free_batch_size = size;
        self
    }

    /// Sets the wedge search lookahead limits.
    #[must_use]
    pub const fn optimize_lookahead(mut self, chunks: usize, bytes: u64) -> Self {
        self.optimize_lookahead_chunks = chunks;
        self.optimize_lookahead_bytes = bytes;
        self
    }

    /// Sets the fixpoint iteration cap.
    #[must_use]
    pub const fn max_compaction_passes(mut self, passes: usize) -> Self {
        self.max_compaction_passes = passes;
        self
    }

    /// Sets the smallest split-off remainder.
    #[must_use]
    pub const fn min_split_footprint(mut self, bytes: u64) -> Self {
        self.min_split_footprint = bytes;
        self
    }
}
