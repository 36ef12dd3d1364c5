//! Memory manager: strategy-driven allocation, chain growth and freeing.
//!
//! ## Invariants
//!
//! - Every byte after the store magic belongs to exactly one chunk footprint
//! - A freed chunk is shredded: free header, zeroed data, listed as free
//! - Free chunks never carry a next field
//! - Outside defragment mode, a non-last link whose successor holds data
//!   is full (`size == capacity`)

mod strategy;

pub use strategy::{
    default_allocate_strategies, default_grow_strategies, AbsorbFollowingFree, AllocPlan,
    AllocRequest, AllocateStrategy, AppendLinked, AppendToEnd, ExpandFreeTail, GrowAtEnd,
    GrowStrategy, ReuseFree, ReusedFree,
};

use crate::chunk::{Chunk, ChunkHeader};
use crate::cluster::{Cluster, FIRST_CHUNK};
use crate::error::{CoreError, CoreResult};
use crate::free_list::FreeList;
use crate::number_size::NumberSize;
use crate::pointer::ChunkPointer;
use crate::ticket::AllocateTicket;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Smallest footprint that can hold a free chunk header.
pub const MIN_FREE_FOOTPRINT: u64 = ChunkHeader::size_for(NumberSize::Byte, NumberSize::Void);

/// Allocator over the cluster's byte store.
pub struct MemoryManager {
    free_list: Mutex<FreeList>,
    allocate_strategies: Vec<Box<dyn AllocateStrategy>>,
    grow_strategies: Vec<Box<dyn GrowStrategy>>,
    defragment_depth: AtomicUsize,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager {
    /// Creates a manager with the default strategies and an empty free list.
    #[must_use]
    pub fn new() -> Self {
        Self::with_strategies(default_allocate_strategies(), default_grow_strategies())
    }

    /// Creates a manager with custom strategy lists, tried in order.
    #[must_use]
    pub fn with_strategies(
        allocate_strategies: Vec<Box<dyn AllocateStrategy>>,
        grow_strategies: Vec<Box<dyn GrowStrategy>>,
    ) -> Self {
        Self {
            free_list: Mutex::new(FreeList::new()),
            allocate_strategies,
            grow_strategies,
            defragment_depth: AtomicUsize::new(0),
        }
    }

    /// Allocates a fresh chunk for `ticket`.
    ///
    /// The first strategy producing an approved placement wins. The ticket's
    /// data populator runs before the chunk is returned.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownAllocationMethod`] if every strategy
    /// declines, or any store error.
    pub fn alloc(&self, cluster: &Cluster, ticket: &AllocateTicket) -> CoreResult<Arc<Chunk>> {
        let request = self.request(cluster, ticket)?;
        let Some((strategy, plan)) = self.plan(cluster, &request)? else {
            return Err(CoreError::UnknownAllocationMethod {
                bytes: ticket.requested_bytes(),
            });
        };
        let chunk = self.commit(cluster, &plan)?;
        tracing::debug!(
            strategy,
            ptr = %chunk.ptr(),
            bytes = ticket.requested_bytes(),
            capacity = chunk.capacity(),
            "allocated chunk"
        );

        if cluster.config().debug_validation {
            let capacity = chunk.capacity();
            if chunk.size() != 0 || capacity < ticket.requested_bytes() || !ticket.approve(&chunk) {
                return Err(CoreError::invalid_operation(format!(
                    "strategy {strategy} broke the allocation contract at {}",
                    chunk.ptr()
                )));
            }
        }
        cluster.stats().record_allocation();
        ticket.populate(cluster, &chunk)?;
        Ok(chunk)
    }

    /// Returns true if [`MemoryManager::alloc`] would succeed. Never
    /// modifies the store.
    #[must_use]
    pub fn can_alloc(&self, cluster: &Cluster, ticket: &AllocateTicket) -> bool {
        self.request(cluster, ticket)
            .and_then(|request| self.plan(cluster, &request))
            .is_ok_and(|plan| plan.is_some())
    }

    /// Grows the chain headed by `first` by at least `bytes` of capacity.
    ///
    /// `target` is the chain's last link; growth always continues from the
    /// true last link. Returns the capacity added.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownAllocationMethod`] if no growth strategy
    /// can make progress.
    pub fn alloc_to(
        &self,
        cluster: &Cluster,
        first: &Arc<Chunk>,
        target: &Arc<Chunk>,
        bytes: u64,
    ) -> CoreResult<u64> {
        let mut remaining = bytes;
        let mut added = 0;
        let mut last = target.last_in_chain(cluster)?;

        while remaining > 0 {
            let mut progress = None;
            for strategy in &self.grow_strategies {
                let grown = strategy.grow(cluster, &last, remaining)?;
                if grown > 0 {
                    progress = Some((strategy.name(), grown));
                    break;
                }
            }
            let Some((strategy, grown)) = progress else {
                return Err(CoreError::UnknownAllocationMethod { bytes: remaining });
            };
            tracing::debug!(strategy, head = %first.ptr(), grown, "grew chain");
            remaining = remaining.saturating_sub(grown);
            added += grown;
            last = last.last_in_chain(cluster)?;
        }

        cluster.stats().record_chain_growth();
        if cluster.config().debug_validation && !self.in_defragment_mode() {
            Self::validate_chain(cluster, first)?;
        }
        Ok(added)
    }

    /// Frees the given chunks (not their chains): shreds each one and lists
    /// it as free. Nothing is freed if any chunk is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] for the root chunk, or for an
    /// already free or repeated chunk under debug validation.
    pub fn free(&self, cluster: &Cluster, chunks: &[Arc<Chunk>]) -> CoreResult<()> {
        let mut seen = HashSet::new();
        let mut doomed = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let ptr = chunk.ptr();
            if ptr.get() == FIRST_CHUNK {
                return Err(CoreError::invalid_operation("the root chunk cannot be freed"));
            }
            if self.is_free(ptr) || !seen.insert(ptr) {
                if cluster.config().debug_validation {
                    return Err(CoreError::invalid_operation(format!(
                        "{ptr} is already free or listed twice"
                    )));
                }
                continue;
            }
            doomed.push(chunk);
        }

        for chunk in doomed {
            let ptr = chunk.ptr();
            let header = ChunkHeader::free(chunk.footprint())?;
            chunk.replace_header(cluster, header)?;
            cluster
                .store()
                .fill_zero(ptr.add(header.header_size()), header.capacity)?;
            cluster.unmanaged().unregister(ptr);
            self.free_list.lock().add(ptr);
            cluster.stats().record_free();
            tracing::trace!(%ptr, footprint = header.footprint(), "freed chunk");
        }
        Ok(())
    }

    /// Frees every chain headed by one of `heads`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] for duplicate heads under
    /// debug validation, or any error from [`MemoryManager::free`].
    pub fn free_chains(&self, cluster: &Cluster, heads: &[ChunkPointer]) -> CoreResult<()> {
        if cluster.config().debug_validation {
            let mut seen = HashSet::new();
            if let Some(dup) = heads.iter().find(|ptr| !seen.insert(**ptr)) {
                return Err(CoreError::invalid_operation(format!(
                    "chain {dup} listed twice for freeing"
                )));
            }
        }
        for head in heads {
            let chain = cluster.chunk(*head)?.collect_chain(cluster)?;
            self.free(cluster, &chain)?;
        }
        Ok(())
    }

    /// Lowers a chunk's capacity, splitting the tail off as a free chunk
    /// when it is large enough. Smaller tails stay inside the capacity.
    ///
    /// The caller zeroes the dropped data range first.
    ///
    /// # Errors
    ///
    /// Returns an error if headers cannot be written.
    pub fn shrink_chunk(&self, cluster: &Cluster, chunk: &Arc<Chunk>, capacity: u64) -> CoreResult<()> {
        chunk.clamp_size(capacity);
        if capacity >= chunk.capacity() {
            return chunk.sync_struct(cluster);
        }
        let footprint = chunk.footprint();
        let kept = chunk.header_size() + capacity;
        let remainder = footprint - kept;
        if remainder < cluster.config().min_split_footprint.max(MIN_FREE_FOOTPRINT) {
            return chunk.sync_struct(cluster);
        }
        chunk.set_capacity(cluster, capacity)?;
        self.release_region(cluster, chunk.end(), remainder)
    }

    /// Merges the free chunk `b` into the free chunk `a` right before it.
    ///
    /// Returns false if the two are not adjacent free chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if headers cannot be written.
    pub fn merge_free_pair(&self, cluster: &Cluster, a: &Arc<Chunk>, b: &Arc<Chunk>) -> CoreResult<bool> {
        if a.end() != b.ptr().get() || !self.is_free(a.ptr()) || !self.is_free(b.ptr()) {
            return Ok(false);
        }
        let header = ChunkHeader::free(a.footprint() + b.footprint())?;
        self.take_free(cluster, b)?;
        a.replace_header(cluster, header)?;
        Ok(true)
    }

    /// Truncates the store if its last chunk is free. Returns the number of
    /// bytes removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be resized.
    pub fn truncate_free_tail(&self, cluster: &Cluster) -> CoreResult<Option<u64>> {
        let Some(last) = self.free_list.lock().last() else {
            return Ok(None);
        };
        let size = cluster.store().size()?;
        if cluster.chunk(last)?.end() != size {
            return Ok(None);
        }
        self.free_list.lock().remove(last);
        cluster.cache().remove_from(last.get());
        cluster.store().set_size(last.get())?;
        Ok(Some(size - last.get()))
    }

    /// Snapshot of the free list.
    #[must_use]
    pub fn free_list(&self) -> FreeList {
        self.free_list.lock().clone()
    }

    /// Number of free chunks.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns true if `ptr` is a listed free chunk.
    #[must_use]
    pub fn is_free(&self, ptr: ChunkPointer) -> bool {
        self.free_list.lock().contains(ptr)
    }

    /// Lists additional free chunks. The chunks must already be shredded.
    pub fn add_free(&self, ptrs: impl IntoIterator<Item = ChunkPointer>) {
        self.free_list.lock().add_all(ptrs);
    }

    /// Releases spare free list capacity.
    pub fn trim_free_list(&self) {
        self.free_list.lock().trim();
    }

    pub(crate) fn replace_free_list(&self, list: FreeList) {
        *self.free_list.lock() = list;
    }

    /// Enters defragment mode until the returned guard is dropped.
    ///
    /// Chain consistency checks are suspended while any guard is alive.
    #[must_use]
    pub fn open_defragment_mode(&self) -> DefragmentGuard<'_> {
        self.defragment_depth.fetch_add(1, Ordering::AcqRel);
        DefragmentGuard { memory: self }
    }

    /// Returns true while a [`DefragmentGuard`] is alive.
    #[must_use]
    pub fn in_defragment_mode(&self) -> bool {
        self.defragment_depth.load(Ordering::Acquire) > 0
    }

    /// Checks that every non-last link whose successor holds data is full.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] naming the first bad link.
    pub fn validate_chain(cluster: &Cluster, head: &Arc<Chunk>) -> CoreResult<()> {
        let chain = head.collect_chain(cluster)?;
        for pair in chain.windows(2) {
            let (link, next) = (&pair[0], &pair[1]);
            if next.size() > 0 && link.size() != link.capacity() {
                return Err(CoreError::invalid_operation(format!(
                    "link {link} of chain {} is not full but its successor holds data",
                    head.ptr()
                )));
            }
        }
        Ok(())
    }

    /// Removes a free chunk from the free list and the cache and zeroes its
    /// header, so its bytes can be absorbed by a neighbour.
    pub(crate) fn take_free(&self, cluster: &Cluster, free: &Arc<Chunk>) -> CoreResult<()> {
        self.free_list.lock().remove(free.ptr());
        cluster.cache().remove(free.ptr());
        cluster
            .store()
            .fill_zero(free.ptr().get(), free.header_size())?;
        Ok(())
    }

    /// Turns `[addr, addr + footprint)` into a shredded free chunk.
    pub(crate) fn release_region(&self, cluster: &Cluster, addr: u64, footprint: u64) -> CoreResult<()> {
        let ptr = ChunkPointer::new(addr)?;
        let header = ChunkHeader::free(footprint)?;
        let chunk = Arc::new(Chunk::detached(ptr, header));
        chunk.write_header(cluster)?;
        cluster
            .store()
            .fill_zero(ptr.add(header.header_size()), header.capacity)?;
        cluster.cache().insert(chunk);
        self.free_list.lock().add(ptr);
        Ok(())
    }

    fn request<'t>(&self, cluster: &Cluster, ticket: &'t AllocateTicket) -> CoreResult<AllocRequest<'t>> {
        let store_size = cluster.store().size()?;
        let horizon = store_size
            .saturating_add(ticket.requested_bytes())
            .saturating_mul(2)
            .max(u64::from(u8::MAX));
        let mut next_size = NumberSize::by_value(horizon);
        if let Some(explicit) = ticket.explicit_next_size() {
            next_size = next_size.max(explicit);
        }
        if let Some(next) = ticket.next() {
            next_size = next_size.max(NumberSize::by_value(next.get()));
        }
        Ok(AllocRequest { ticket, next_size })
    }

    fn plan(
        &self,
        cluster: &Cluster,
        request: &AllocRequest<'_>,
    ) -> CoreResult<Option<(&'static str, AllocPlan)>> {
        for strategy in &self.allocate_strategies {
            if let Some(plan) = strategy.plan(cluster, request)? {
                return Ok(Some((strategy.name(), plan)));
            }
        }
        Ok(None)
    }

    fn commit(&self, cluster: &Cluster, plan: &AllocPlan) -> CoreResult<Arc<Chunk>> {
        let store = cluster.store();
        if let Some(reused) = plan.reused {
            self.free_list.lock().remove(reused.ptr);
        }
        if let Some(size) = plan.grow_store_to {
            if size > store.size()? {
                store.set_size(size)?;
            }
        }

        let chunk = Arc::new(Chunk::detached(plan.ptr, plan.header));
        chunk.write_header(cluster)?;
        if let Some(reused) = plan.reused {
            let new_header = plan.header.header_size();
            if reused.header_size > new_header {
                store.fill_zero(plan.ptr.add(new_header), reused.header_size - new_header)?;
            }
        }
        cluster.cache().insert(Arc::clone(&chunk));

        if let Some(remainder) = plan.remainder {
            self.release_region(cluster, chunk.end(), remainder)?;
        }
        Ok(chunk)
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("free_chunks", &self.free_count())
            .field("allocate_strategies", &self.allocate_strategies)
            .field("grow_strategies", &self.grow_strategies)
            .field("defragment_mode", &self.in_defragment_mode())
            .finish()
    }
}

/// Scope of a compaction operation; see
/// [`MemoryManager::open_defragment_mode`].
#[must_use = "defragment mode ends when the guard is dropped"]
pub struct DefragmentGuard<'a> {
    memory: &'a MemoryManager,
}

impl Drop for DefragmentGuard<'_> {
    fn drop(&mut self) {
        self.memory.defragment_depth.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for DefragmentGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefragmentGuard").finish_non_exhaustive()
    }
}
