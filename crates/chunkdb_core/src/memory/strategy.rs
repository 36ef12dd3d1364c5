//! Allocation and chain growth strategies.
//!
//! Allocation strategies only plan: they inspect the store and describe a
//! placement without mutating anything, so the same search serves both
//! `alloc` and the dry-run `can_alloc`. The memory manager commits the
//! winning plan. Growth strategies mutate directly and report how many
//! bytes of capacity they added.

use super::MIN_FREE_FOOTPRINT;
use crate::chunk::{Chunk, ChunkHeader};
use crate::cluster::{Cluster, FIRST_CHUNK};
use crate::error::{CoreError, CoreResult};
use crate::number_size::NumberSize;
use crate::pointer::ChunkPointer;
use crate::ticket::AllocateTicket;
use std::sync::Arc;

/// A ticket together with the resolved next field width.
#[derive(Debug)]
pub struct AllocRequest<'t> {
    /// The submitted ticket.
    pub ticket: &'t AllocateTicket,
    /// Width chosen for the new chunk's next field.
    pub next_size: NumberSize,
}

impl AllocRequest<'_> {
    /// Header of a chunk that exactly satisfies the request.
    #[must_use]
    pub fn header(&self) -> ChunkHeader {
        ChunkHeader::fresh(
            self.ticket.requested_bytes(),
            self.next_size,
            self.ticket.next(),
        )
    }

    /// Runs the ticket's approval on a candidate placement.
    #[must_use]
    pub fn approve(&self, ptr: ChunkPointer, header: ChunkHeader) -> bool {
        self.ticket.approve(&Chunk::detached(ptr, header))
    }
}

/// A free chunk consumed by a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReusedFree {
    /// Address of the free chunk.
    pub ptr: ChunkPointer,
    /// Length of its free header, zeroed if the new header is shorter.
    pub header_size: u64,
}

/// A placement found by an [`AllocateStrategy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocPlan {
    /// Address of the new chunk.
    pub ptr: ChunkPointer,
    /// Header of the new chunk.
    pub header: ChunkHeader,
    /// Free chunk taken over by the new chunk.
    pub reused: Option<ReusedFree>,
    /// Footprint of the free remainder placed right after the new chunk.
    pub remainder: Option<u64>,
    /// Store size required by the plan.
    pub grow_store_to: Option<u64>,
}

/// One way of placing a fresh chunk.
pub trait AllocateStrategy: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Finds an approved placement without modifying the store, or declines
    /// with `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be inspected.
    fn plan(&self, cluster: &Cluster, request: &AllocRequest<'_>) -> CoreResult<Option<AllocPlan>>;
}

/// One way of adding capacity to the last link of a chain.
pub trait GrowStrategy: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Adds capacity for about `bytes` more bytes to the chain ending at
    /// `last`. Returns the capacity actually added; 0 declines.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be modified.
    fn grow(&self, cluster: &Cluster, last: &Arc<Chunk>, bytes: u64) -> CoreResult<u64>;
}

/// Best fit from the free list, splitting off the remainder.
///
/// Among free chunks of equal footprint the one closest to the ticket's
/// position magnet wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReuseFree;

impl ReuseFree {
    fn fit(
        ptr: ChunkPointer,
        free: &Chunk,
        request: &AllocRequest<'_>,
        min_split: u64,
    ) -> Option<AllocPlan> {
        let footprint = free.footprint();
        let header = request.header();
        let remainder = footprint.checked_sub(header.footprint())?;
        let reused = Some(ReusedFree {
            ptr,
            header_size: free.header_size(),
        });

        if remainder >= min_split.max(MIN_FREE_FOOTPRINT) {
            return Some(AllocPlan {
                ptr,
                header,
                reused,
                remainder: Some(remainder),
                grow_store_to: None,
            });
        }
        let header = ChunkHeader::filling(footprint, request.next_size, request.ticket.next())?;
        (header.capacity >= request.ticket.requested_bytes()).then_some(AllocPlan {
            ptr,
            header,
            reused,
            remainder: None,
            grow_store_to: None,
        })
    }
}

impl AllocateStrategy for ReuseFree {
    fn name(&self) -> &'static str {
        "reuse-free"
    }

    fn plan(&self, cluster: &Cluster, request: &AllocRequest<'_>) -> CoreResult<Option<AllocPlan>> {
        let min_split = cluster.config().min_split_footprint;
        let magnet = request.ticket.position_magnet();
        let mut best: Option<(u64, u64, AllocPlan)> = None;

        for ptr in cluster.memory().free_list().iter() {
            let free = cluster.chunk(ptr)?;
            let Some(plan) = Self::fit(ptr, &free, request, min_split) else {
                continue;
            };
            if !request.approve(plan.ptr, plan.header) {
                continue;
            }
            let footprint = free.footprint();
            let distance = magnet.map_or(0, |m| m.abs_diff(ptr.get()));
            let better = best.as_ref().map_or(true, |(f, d, _)| {
                footprint < *f || (footprint == *f && distance < *d)
            });
            if better {
                best = Some((footprint, distance, plan));
            }
        }
        Ok(best.map(|(_, _, plan)| plan))
    }
}

/// Reuses a free chunk at the very end of the store, growing the store by
/// the deficit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpandFreeTail;

impl AllocateStrategy for ExpandFreeTail {
    fn name(&self) -> &'static str {
        "expand-free-tail"
    }

    fn plan(&self, cluster: &Cluster, request: &AllocRequest<'_>) -> CoreResult<Option<AllocPlan>> {
        let Some(ptr) = cluster.memory().free_list().last() else {
            return Ok(None);
        };
        let free = cluster.chunk(ptr)?;
        if free.end() != cluster.store().size()? {
            return Ok(None);
        }
        let header = request.header();
        if header.footprint() <= free.footprint() || !request.approve(ptr, header) {
            return Ok(None);
        }
        Ok(Some(AllocPlan {
            ptr,
            header,
            reused: Some(ReusedFree {
                ptr,
                header_size: free.header_size(),
            }),
            remainder: None,
            grow_store_to: Some(ptr.add(header.footprint())),
        }))
    }
}

/// Places the chunk at the current end of the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendToEnd;

impl AllocateStrategy for AppendToEnd {
    fn name(&self) -> &'static str {
        "append-to-end"
    }

    fn plan(&self, cluster: &Cluster, request: &AllocRequest<'_>) -> CoreResult<Option<AllocPlan>> {
        let ptr = ChunkPointer::new(cluster.store().size()?.max(FIRST_CHUNK))?;
        let header = request.header();
        if !request.approve(ptr, header) {
            return Ok(None);
        }
        Ok(Some(AllocPlan {
            ptr,
            header,
            reused: None,
            remainder: None,
            grow_store_to: Some(ptr.add(header.footprint())),
        }))
    }
}

/// Grows the last link in place when it is the physically last chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrowAtEnd;

impl GrowStrategy for GrowAtEnd {
    fn name(&self) -> &'static str {
        "grow-at-end"
    }

    fn grow(&self, cluster: &Cluster, last: &Arc<Chunk>, bytes: u64) -> CoreResult<u64> {
        if last.end() != cluster.store().size()? {
            return Ok(0);
        }
        let capacity = last.capacity() + bytes;
        let Some(footprint) = last.footprint_for_capacity(capacity) else {
            return Ok(0);
        };
        cluster.store().set_size(last.ptr().add(footprint))?;
        last.set_capacity(cluster, capacity)?;
        Ok(bytes)
    }
}

/// Swallows a free chunk that physically follows the last link.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbsorbFollowingFree;

impl GrowStrategy for AbsorbFollowingFree {
    fn name(&self) -> &'static str {
        "absorb-following-free"
    }

    fn grow(&self, cluster: &Cluster, last: &Arc<Chunk>, bytes: u64) -> CoreResult<u64> {
        let memory = cluster.memory();
        let Some(follower) = ChunkPointer::from_raw(last.end()) else {
            return Ok(0);
        };
        if follower.get() >= cluster.store().size()? || !memory.is_free(follower) {
            return Ok(0);
        }
        let free = cluster.chunk(follower)?;
        let old_capacity = last.capacity();
        let total = last.footprint() + free.footprint();
        let wanted = old_capacity + bytes;
        let min_split = cluster.config().min_split_footprint.max(MIN_FREE_FOOTPRINT);

        let (capacity, remainder) = match last.footprint_for_capacity(wanted) {
            Some(footprint) if footprint + min_split <= total => (wanted, total - footprint),
            _ => match last.capacity_for_footprint(total) {
                Some(capacity) => (capacity, 0),
                None => return Ok(0),
            },
        };

        memory.take_free(cluster, &free)?;
        last.set_capacity(cluster, capacity)?;
        if remainder > 0 {
            memory.release_region(cluster, last.end(), remainder)?;
        }
        Ok(capacity.saturating_sub(old_capacity))
    }
}

/// Allocates a fresh chunk and links it after the last link.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendLinked;

impl GrowStrategy for AppendLinked {
    fn name(&self) -> &'static str {
        "append-linked"
    }

    fn grow(&self, cluster: &Cluster, last: &Arc<Chunk>, bytes: u64) -> CoreResult<u64> {
        let width = last.next_size();
        if width == NumberSize::Void {
            return Ok(0);
        }
        let ticket =
            AllocateTicket::bytes(bytes).with_approval(move |c| width.can_fit(c.ptr().get()));
        let link = match cluster.memory().alloc(cluster, &ticket) {
            Ok(link) => link,
            Err(CoreError::UnknownAllocationMethod { .. }) => return Ok(0),
            Err(err) => return Err(err),
        };
        last.set_next(Some(link.ptr()))?;
        last.write_header(cluster)?;
        Ok(link.capacity())
    }
}

/// Default allocation strategies, in the order they are tried.
#[must_use]
pub fn default_allocate_strategies() -> Vec<Box<dyn AllocateStrategy>> {
    vec![Box::new(ReuseFree), Box::new(ExpandFreeTail), Box::new(AppendToEnd)]
}

/// Default chain growth strategies, in the order they are tried.
#[must_use]
pub fn default_grow_strategies() -> Vec<Box<dyn GrowStrategy>> {
    vec![
        Box::new(GrowAtEnd),
        Box::new(AbsorbFollowingFree),
        Box::new(AppendLinked),
    ]
}

impl std::fmt::Debug for dyn AllocateStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::fmt::Debug for dyn GrowStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
