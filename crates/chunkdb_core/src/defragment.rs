//! Compaction: chain merging, free space coalescing and store packing.
//!
//! Every relocation goes through [`DefragmentManager::move_reference`],
//! which copies a chain, rewrites the single reference to it and leaves
//! freeing the vacated chunks to the caller. The steps of one round share a
//! [`MoveBuffer`], so a candidate touched earlier in the round is left for
//! the next one.
//!
//! ## Invariants
//!
//! - A relocation never frees anything itself; if it fails half way, the
//!   source stays the live copy and the destination is orphaned garbage
//! - Every fixpoint loop is bounded by `max_compaction_passes`
//! - Running [`DefragmentManager::defragment`] on an already compacted store
//!   changes nothing

use crate::chunk::Chunk;
use crate::cluster::{Cluster, FIRST_CHUNK};
use crate::error::{CoreError, CoreResult};
use crate::move_buffer::MoveBuffer;
use crate::pointer::{ChunkPointer, Reference};
use crate::ticket::AllocateTicket;
use crate::walker::{SlotVisit, WalkControl};
use std::collections::HashSet;
use std::sync::Arc;

/// What the reachability scan does with unreferenced chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FreeChunkScanPolicy {
    /// Skip the scan.
    #[default]
    Nothing,
    /// Log the count.
    Warn,
    /// Log the count and free the chunks in batches.
    WarnAndList,
    /// Fail with [`CoreError::MalformedFile`].
    Error,
}

/// Outcome of [`DefragmentManager::optimize_free_chunks`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeOutcome {
    /// Adjacent free pairs merged.
    pub coalesced: usize,
    /// Wedged chunks moved out from between free regions.
    pub relocated: usize,
}

/// Outcome of [`DefragmentManager::pack`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackOutcome {
    /// Bytes cut from the end of the store.
    pub truncated: u64,
    /// Tail chunks moved to lower addresses.
    pub relocated: usize,
}

/// Summary of a full compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefragmentReport {
    /// Unreferenced chunks found by the reachability scan and freed.
    pub orphans_reclaimed: usize,
    /// Rounds run, including the final one that changed nothing.
    pub rounds: usize,
    /// Fragmented chains rewritten as single chunks.
    pub chains_merged: usize,
    /// Adjacent free pairs merged.
    pub free_chunks_coalesced: usize,
    /// Live chunks moved by free space optimization and packing.
    pub chunks_relocated: usize,
    /// Bytes cut from the end of the store.
    pub bytes_truncated: u64,
    /// Store size before compaction.
    pub size_before: u64,
    /// Store size after compaction.
    pub size_after: u64,
}

impl DefragmentReport {
    /// Returns true if the compaction modified the store.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.orphans_reclaimed > 0
            || self.chains_merged > 0
            || self.free_chunks_coalesced > 0
            || self.chunks_relocated > 0
            || self.bytes_truncated > 0
    }
}

enum Referrer {
    Slot(SlotVisit),
    Link(Arc<Chunk>),
}

/// Runs compaction passes over a cluster.
#[derive(Debug)]
pub struct DefragmentManager<'a> {
    cluster: &'a Cluster,
}

impl<'a> DefragmentManager<'a> {
    /// Creates a manager for `cluster`.
    #[must_use]
    pub fn new(cluster: &'a Cluster) -> Self {
        Self { cluster }
    }

    /// Frees unreferenced chunks, then merges chains, optimizes free space
    /// and packs the store, repeating until a round changes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if a step cannot make progress it committed to, or
    /// on any store error.
    pub fn defragment(&self) -> CoreResult<DefragmentReport> {
        let cluster = self.cluster;
        let _guard = cluster.memory().open_defragment_mode();
        let mut report = DefragmentReport {
            size_before: cluster.store().size()?,
            ..DefragmentReport::default()
        };
        report.orphans_reclaimed = self
            .scan_free_chunks(FreeChunkScanPolicy::WarnAndList)?
            .len();

        for _ in 0..cluster.config().max_compaction_passes {
            report.rounds += 1;
            let mut moves = MoveBuffer::new();
            let merged = self.merge_chains(&mut moves)?;
            let optimized = self.optimize_free_chunks(&mut moves)?;
            let packed = self.pack(&mut moves)?;

            report.chains_merged += merged;
            report.free_chunks_coalesced += optimized.coalesced;
            report.chunks_relocated += optimized.relocated + packed.relocated;
            report.bytes_truncated += packed.truncated;

            tracing::debug!(round = report.rounds, moves = moves.len(), "compaction round");
            let progress = merged > 0
                || optimized != OptimizeOutcome::default()
                || packed != PackOutcome::default();
            if !progress {
                break;
            }
        }

        report.size_after = cluster.store().size()?;
        tracing::info!(
            orphans = report.orphans_reclaimed,
            rounds = report.rounds,
            merged = report.chains_merged,
            coalesced = report.free_chunks_coalesced,
            relocated = report.chunks_relocated,
            size_before = report.size_before,
            size_after = report.size_after,
            "defragmented cluster"
        );
        Ok(report)
    }

    /// Chunks that are neither reachable from the root nor listed as free.
    ///
    /// Marks every chain reachable through the graph walker, plus the root
    /// chain, then enumerates the store physically.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph or the store cannot be walked.
    pub fn find_free_chunks(&self) -> CoreResult<Vec<ChunkPointer>> {
        let cluster = self.cluster;
        let mut reached = HashSet::new();
        Self::mark_chain(cluster, ChunkPointer::new(FIRST_CHUNK)?, &mut reached)?;
        cluster.walker().walk(cluster, &mut |slot| {
            if let Some(target) = slot.reference.ptr {
                Self::mark_chain(cluster, target, &mut reached)?;
            }
            Ok(WalkControl::Continue)
        })?;

        let memory = cluster.memory();
        let mut garbage = Vec::new();
        for chunk in cluster.physical_chunks() {
            let ptr = chunk?.ptr();
            if !reached.contains(&ptr) && !memory.is_free(ptr) {
                garbage.push(ptr);
            }
        }
        Ok(garbage)
    }

    fn mark_chain(
        cluster: &Cluster,
        head: ChunkPointer,
        reached: &mut HashSet<ChunkPointer>,
    ) -> CoreResult<()> {
        if reached.contains(&head) {
            return Ok(());
        }
        for link in cluster.chunk(head)?.collect_chain(cluster)? {
            reached.insert(link.ptr());
        }
        Ok(())
    }

    /// Runs the reachability scan and applies `policy` to what it finds.
    /// Returns the unreferenced chunks.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedFile`] under
    /// [`FreeChunkScanPolicy::Error`] if any chunk is unreferenced.
    pub fn scan_free_chunks(&self, policy: FreeChunkScanPolicy) -> CoreResult<Vec<ChunkPointer>> {
        if policy == FreeChunkScanPolicy::Nothing {
            return Ok(Vec::new());
        }
        let garbage = self.find_free_chunks()?;
        let Some(first) = garbage.first() else {
            return Ok(garbage);
        };

        match policy {
            FreeChunkScanPolicy::Nothing => {}
            FreeChunkScanPolicy::Warn => {
                tracing::warn!(count = garbage.len(), first = %first, "found unreferenced chunks");
            }
            FreeChunkScanPolicy::WarnAndList => {
                tracing::warn!(count = garbage.len(), first = %first, "freeing unreferenced chunks");
                let cluster = self.cluster;
                for batch in garbage.chunks(cluster.config().free_batch_size.max(1)) {
                    let chunks = batch
                        .iter()
                        .map(|ptr| cluster.chunk(*ptr))
                        .collect::<CoreResult<Vec<_>>>()?;
                    cluster.memory().free(cluster, &chunks)?;
                }
            }
            FreeChunkScanPolicy::Error => {
                return Err(CoreError::malformed_file(format!(
                    "{} unreferenced chunks, first at {first}",
                    garbage.len()
                )));
            }
        }
        Ok(garbage)
    }

    /// Rewrites every fragmented chain reachable from the root as a single
    /// chunk, recording each relocation in `moves`. Returns the number of
    /// chains merged.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownAllocationMethod`] if a fragmented chain
    /// cannot be relocated.
    pub fn merge_chains(&self, moves: &mut MoveBuffer) -> CoreResult<usize> {
        let cluster = self.cluster;
        let mut merged = 0;
        for _ in 0..cluster.config().max_compaction_passes {
            let Some(head) = self.find_fragmented_chain()? else {
                break;
            };
            let moved = self.move_reference(head, |ticket| ticket, true)?;
            if moved.is_empty() {
                let bytes = cluster.chunk(head)?.chain_size(cluster)?;
                return Err(CoreError::UnknownAllocationMethod { bytes });
            }
            cluster.memory().free_chains(cluster, &[head])?;
            moves.extend(&moved);
            merged += 1;
        }
        Ok(merged)
    }

    fn find_fragmented_chain(&self) -> CoreResult<Option<ChunkPointer>> {
        let cluster = self.cluster;
        let mut found = None;
        let mut checked = HashSet::new();
        cluster.walker().walk(cluster, &mut |slot| {
            let Some(target) = slot.reference.ptr else {
                return Ok(WalkControl::Continue);
            };
            if slot.reference.offset != 0 || !checked.insert(target) {
                return Ok(WalkControl::Continue);
            }
            if cluster.chunk(target)?.has_next() {
                found = Some(target);
                return Ok(WalkControl::Stop);
            }
            Ok(WalkControl::Continue)
        })?;
        Ok(found)
    }

    /// Coalesces adjacent free chunks and moves used chunks wedged between
    /// nearby free regions, to a fixpoint. Trims the free list afterwards.
    ///
    /// A wedged chunk whose chain was already touched by a move in `moves`
    /// stays where it is.
    ///
    /// # Errors
    ///
    /// Returns an error if a relocation or a header write fails.
    pub fn optimize_free_chunks(&self, moves: &mut MoveBuffer) -> CoreResult<OptimizeOutcome> {
        let cluster = self.cluster;
        let mut outcome = OptimizeOutcome::default();
        for _ in 0..cluster.config().max_compaction_passes {
            let coalesced = self.coalesce_adjacent()?;
            if coalesced > 0 {
                outcome.coalesced += coalesced;
                continue;
            }
            if !self.relocate_wedge(moves)? {
                break;
            }
            outcome.relocated += 1;
        }
        cluster.memory().trim_free_list();
        Ok(outcome)
    }

    fn coalesce_adjacent(&self) -> CoreResult<usize> {
        let cluster = self.cluster;
        let memory = cluster.memory();
        let mut merged = 0;
        // tail first, so a run of free chunks folds into its lowest member
        for ptr in memory.free_list().to_vec().into_iter().rev() {
            if !memory.is_free(ptr) {
                continue;
            }
            let chunk = cluster.chunk(ptr)?;
            let Some(follower) = ChunkPointer::from_raw(chunk.end()) else {
                continue;
            };
            if !memory.is_free(follower) {
                continue;
            }
            let follower = cluster.chunk(follower)?;
            if memory.merge_free_pair(cluster, &chunk, &follower)? {
                merged += 1;
            }
        }
        Ok(merged)
    }

    /// Moves the first movable used chunk sitting between two nearby free
    /// chunks to a place before the second one.
    fn relocate_wedge(&self, moves: &mut MoveBuffer) -> CoreResult<bool> {
        let cluster = self.cluster;
        let memory = cluster.memory();
        let config = cluster.config();
        let size = cluster.store().size()?;

        for free in memory.free_list().to_vec().into_iter().rev() {
            let mut at = cluster.chunk(free)?.end();
            let mut wedge = Vec::new();
            let mut bytes = 0;
            let mut gap = None;
            while at < size
                && wedge.len() < config.optimize_lookahead_chunks
                && bytes < config.optimize_lookahead_bytes
            {
                let ptr = ChunkPointer::new(at)?;
                if memory.is_free(ptr) {
                    gap = Some(ptr);
                    break;
                }
                let chunk = cluster.chunk(ptr)?;
                bytes += chunk.capacity();
                at = chunk.end();
                wedge.push(chunk);
            }
            let Some(gap) = gap else {
                continue;
            };

            let limit = gap.get();
            for chunk in &wedge {
                if moves.chain_affected(cluster, chunk)? {
                    continue;
                }
                let moved = self.move_reference(
                    chunk.ptr(),
                    |ticket| ticket.with_approval(move |c| c.end() <= limit),
                    true,
                )?;
                if moved.is_empty() {
                    continue;
                }
                memory.free_chains(cluster, &[chunk.ptr()])?;
                moves.extend(&moved);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Shrinks the store: truncates a free tail, otherwise moves the
    /// physically last chunk into free space that ends before it.
    ///
    /// Stops when the free list is empty, or the last chunk cannot move or
    /// heads a chain already touched by a move in `moves`.
    ///
    /// # Errors
    ///
    /// Returns an error if a relocation or the truncation fails.
    pub fn pack(&self, moves: &mut MoveBuffer) -> CoreResult<PackOutcome> {
        let cluster = self.cluster;
        let memory = cluster.memory();
        let mut outcome = PackOutcome::default();

        for _ in 0..cluster.config().max_compaction_passes {
            if let Some(bytes) = memory.truncate_free_tail(cluster)? {
                cluster.stats().record_packed(bytes);
                outcome.truncated += bytes;
                continue;
            }
            if memory.free_count() == 0 {
                break;
            }
            let Some(last) = cluster.last_chunk()? else {
                break;
            };
            if moves.chain_affected(cluster, &last)? {
                break;
            }
            let limit = last.ptr().get();
            let moved = self.move_reference(
                last.ptr(),
                |ticket| ticket.with_approval(move |c| c.end() <= limit),
                true,
            )?;
            if moved.is_empty() {
                break;
            }
            memory.free_chains(cluster, &[last.ptr()])?;
            moves.extend(&moved);
            outcome.relocated += 1;
        }
        Ok(outcome)
    }

    /// Copies the chain at `old` into a newly allocated chunk and rewrites
    /// the one reference to it.
    ///
    /// The ticket for the copy is built by `customize` from one sized to the
    /// chain's data. The reference is either a slot found by the graph
    /// walker or the next field of a preceding link. Unmanaged values move
    /// only when `allow_unmanaged` is set; their registered instance is
    /// notified. Returns an empty buffer when nothing moved. The caller
    /// frees the old chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails mid-way; the old chain then
    /// remains the live copy.
    pub fn move_reference(
        &self,
        old: ChunkPointer,
        customize: impl FnOnce(AllocateTicket) -> AllocateTicket,
        allow_unmanaged: bool,
    ) -> CoreResult<MoveBuffer> {
        let cluster = self.cluster;
        let mut moves = MoveBuffer::new();
        if old.get() == FIRST_CHUNK {
            return Ok(moves);
        }

        let data = cluster.io(old)?.read_all()?;
        let ticket = customize(AllocateTicket::bytes(data.len() as u64));
        if !ticket.can_submit(cluster) {
            tracing::debug!(%old, bytes = data.len(), "no room to relocate chain");
            return Ok(moves);
        }

        let _guard = cluster.memory().open_defragment_mode();
        let Some(referrer) = self.find_referrer(old)? else {
            tracing::debug!(%old, "no reference to relocate");
            return Ok(moves);
        };

        let bytes = data.len();
        let new = match referrer {
            Referrer::Slot(mut slot) => {
                if slot.is_unmanaged() && !allow_unmanaged {
                    return Ok(moves);
                }
                let ticket = if ticket.position_magnet().is_none() {
                    ticket.with_position_magnet(slot.slot_address(cluster)?)
                } else {
                    ticket
                };
                let new = cluster.alloc(&ticket.with_data(data))?.ptr();
                if slot.is_unmanaged() {
                    cluster.unmanaged().relocate(old, new);
                }
                slot.rewrite(cluster, Reference::to(new))?;
                new
            }
            Referrer::Link(pred) => {
                let width = pred.next_size();
                let ticket = ticket.with_approval(move |c| width.can_fit(c.ptr().get()));
                if !ticket.can_submit(cluster) {
                    return Ok(moves);
                }
                let new = cluster.alloc(&ticket.with_data(data))?.ptr();
                pred.set_next(Some(new))?;
                pred.write_header(cluster)?;
                new
            }
        };

        moves.record(old, new);
        cluster.stats().record_relocation();
        tracing::debug!(%old, %new, bytes, "relocated chain");
        Ok(moves)
    }

    fn find_referrer(&self, old: ChunkPointer) -> CoreResult<Option<Referrer>> {
        let cluster = self.cluster;
        let root = ChunkPointer::new(FIRST_CHUNK)?;
        if let Some(pred) = Self::predecessor(cluster, root, old)? {
            return Ok(Some(Referrer::Link(pred)));
        }

        let mut found = None;
        let mut scanned = HashSet::from([root]);
        cluster.walker().walk(cluster, &mut |slot| {
            let Some(target) = slot.reference.ptr else {
                return Ok(WalkControl::Continue);
            };
            if target == old && slot.reference.offset == 0 {
                found = Some(Referrer::Slot(slot.clone()));
                return Ok(WalkControl::Stop);
            }
            if scanned.insert(target) {
                if let Some(pred) = Self::predecessor(cluster, target, old)? {
                    found = Some(Referrer::Link(pred));
                    return Ok(WalkControl::Stop);
                }
            }
            Ok(WalkControl::Continue)
        })?;
        Ok(found)
    }

    fn predecessor(
        cluster: &Cluster,
        head: ChunkPointer,
        old: ChunkPointer,
    ) -> CoreResult<Option<Arc<Chunk>>> {
        Ok(cluster
            .chunk(head)?
            .collect_chain(cluster)?
            .into_iter()
            .find(|link| link.next_ptr() == Some(old)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unmanaged::UnmanagedInstance;
    use crate::value::NodeValue;
    use parking_lot::Mutex;

    fn root_target(cluster: &Cluster) -> ChunkPointer {
        cluster.root_reference().unwrap().ptr.unwrap()
    }

    /// Three 8-byte links holding one 24-byte blob, each followed by a
    /// one-byte spacer so nothing can grow in place.
    fn three_link_chain(cluster: &Cluster) -> Vec<Arc<Chunk>> {
        let links: Vec<_> = (0..3)
            .map(|_| {
                let link = cluster.alloc(&AllocateTicket::bytes(8)).unwrap();
                cluster.alloc(&AllocateTicket::bytes(1)).unwrap();
                link
            })
            .collect();
        for pair in links.windows(2) {
            pair[0].set_next(Some(pair[1].ptr())).unwrap();
            pair[0].write_header(cluster).unwrap();
        }
        let mut io = cluster.io(links[0].ptr()).unwrap();
        io.write_all(&NodeValue::blob(vec![7; 19]).encode()).unwrap();
        io.close().unwrap();
        cluster.set_root_reference(Reference::to(links[0].ptr())).unwrap();
        links
    }

    #[test]
    fn find_free_chunks_reports_only_orphans() {
        let cluster = Cluster::in_memory().unwrap();
        let live = cluster.write_value(&NodeValue::blob(b"live".to_vec())).unwrap();
        cluster.set_root_reference(Reference::to(live)).unwrap();
        let orphan = cluster.alloc(&AllocateTicket::bytes(12)).unwrap();
        let freed = cluster.alloc(&AllocateTicket::bytes(12)).unwrap();
        cluster.memory().free(&cluster, &[Arc::clone(&freed)]).unwrap();

        let garbage = DefragmentManager::new(&cluster).find_free_chunks().unwrap();
        assert_eq!(garbage, vec![orphan.ptr()]);
    }

    #[test]
    fn scan_policies() {
        let cluster = Cluster::in_memory().unwrap();
        let orphan = cluster.alloc(&AllocateTicket::bytes(12)).unwrap().ptr();
        let manager = DefragmentManager::new(&cluster);

        assert!(manager
            .scan_free_chunks(FreeChunkScanPolicy::Nothing)
            .unwrap()
            .is_empty());
        assert_eq!(
            manager.scan_free_chunks(FreeChunkScanPolicy::Warn).unwrap(),
            vec![orphan]
        );
        assert!(!cluster.memory().is_free(orphan));
        assert!(matches!(
            manager.scan_free_chunks(FreeChunkScanPolicy::Error),
            Err(CoreError::MalformedFile { .. })
        ));

        manager
            .scan_free_chunks(FreeChunkScanPolicy::WarnAndList)
            .unwrap();
        assert!(cluster.memory().is_free(orphan));
        assert!(manager.find_free_chunks().unwrap().is_empty());
    }

    #[test]
    fn merge_chains_rewrites_fragmented_chain() {
        let cluster = Cluster::in_memory().unwrap();
        let links = three_link_chain(&cluster);
        let value = cluster.read_value(links[0].ptr()).unwrap();

        let mut moves = MoveBuffer::new();
        let merged = DefragmentManager::new(&cluster)
            .merge_chains(&mut moves)
            .unwrap();
        assert_eq!(merged, 1);

        let head = root_target(&cluster);
        assert_ne!(head, links[0].ptr());
        assert_eq!(moves.to_dest(links[0].ptr()), Some(head));
        let chunk = cluster.chunk(head).unwrap();
        assert!(!chunk.has_next());
        assert!(chunk.capacity() >= 24);
        assert_eq!(cluster.read_value(head).unwrap(), value);
        for link in &links {
            assert!(cluster.memory().is_free(link.ptr()));
        }
    }

    #[test]
    fn pack_truncates_free_tail_without_moving() {
        let cluster = Cluster::in_memory().unwrap();
        let live = cluster.write_value(&NodeValue::blob(vec![1; 10])).unwrap();
        cluster.set_root_reference(Reference::to(live)).unwrap();
        let tail = cluster.alloc(&AllocateTicket::bytes(30)).unwrap();
        let footprint = tail.footprint();
        let size = cluster.store().size().unwrap();
        cluster.memory().free(&cluster, &[tail]).unwrap();

        let outcome = DefragmentManager::new(&cluster)
            .pack(&mut MoveBuffer::new())
            .unwrap();
        assert_eq!(outcome.truncated, footprint);
        assert_eq!(outcome.relocated, 0);
        assert_eq!(cluster.store().size().unwrap(), size - footprint);
        assert_eq!(root_target(&cluster), live);
    }

    #[test]
    fn pack_moves_last_chunk_into_hole() {
        let cluster = Cluster::in_memory().unwrap();
        let hole = cluster.alloc(&AllocateTicket::bytes(64)).unwrap();
        let live = cluster.write_value(&NodeValue::blob(vec![5; 10])).unwrap();
        cluster.set_root_reference(Reference::to(live)).unwrap();
        let hole_ptr = hole.ptr();
        cluster.memory().free(&cluster, &[hole]).unwrap();

        let mut moves = MoveBuffer::new();
        let outcome = DefragmentManager::new(&cluster).pack(&mut moves).unwrap();
        assert_eq!(outcome.relocated, 1);
        assert_eq!(root_target(&cluster), hole_ptr);
        assert_eq!(moves.to_dest(live), Some(hole_ptr));
        let moved = cluster.chunk(hole_ptr).unwrap();
        assert_eq!(cluster.store().size().unwrap(), moved.end());
        assert_eq!(
            cluster.read_value(hole_ptr).unwrap(),
            NodeValue::blob(vec![5; 10])
        );
        assert_eq!(cluster.memory().free_count(), 0);
    }

    #[test]
    fn pack_leaves_chunks_moved_this_round() {
        let cluster = Cluster::in_memory().unwrap();
        let hole = cluster.alloc(&AllocateTicket::bytes(64)).unwrap();
        let live = cluster.write_value(&NodeValue::blob(vec![5; 10])).unwrap();
        cluster.set_root_reference(Reference::to(live)).unwrap();
        cluster.memory().free(&cluster, &[hole]).unwrap();
        let size = cluster.store().size().unwrap();
        let manager = DefragmentManager::new(&cluster);

        let mut moves = MoveBuffer::new();
        moves.record(live, ChunkPointer::new(size + 1).unwrap());
        let outcome = manager.pack(&mut moves).unwrap();
        assert_eq!(outcome, PackOutcome::default());
        assert_eq!(moves.len(), 1);
        assert_eq!(root_target(&cluster), live);
        assert_eq!(cluster.store().size().unwrap(), size);

        let outcome = manager.pack(&mut MoveBuffer::new()).unwrap();
        assert_eq!(outcome.relocated, 1);
        assert_ne!(root_target(&cluster), live);
    }

    #[test]
    fn optimize_skips_wedge_moved_this_round() {
        let cluster = Cluster::in_memory().unwrap();
        let first = cluster.alloc(&AllocateTicket::bytes(16)).unwrap();
        let wedge = cluster.write_value(&NodeValue::blob(vec![1, 2, 3])).unwrap();
        let second = cluster.alloc(&AllocateTicket::bytes(16)).unwrap();
        cluster.alloc(&AllocateTicket::bytes(4)).unwrap();
        cluster.set_root_reference(Reference::to(wedge)).unwrap();
        cluster.memory().free(&cluster, &[first, second]).unwrap();

        let mut moves = MoveBuffer::new();
        moves.record(wedge, ChunkPointer::new(FIRST_CHUNK).unwrap());
        let outcome = DefragmentManager::new(&cluster)
            .optimize_free_chunks(&mut moves)
            .unwrap();
        assert_eq!(outcome.relocated, 0);
        assert_eq!(root_target(&cluster), wedge);
        assert_eq!(cluster.memory().free_count(), 2);
    }

    #[test]
    fn optimize_moves_wedge_and_coalesces() {
        let cluster = Cluster::in_memory().unwrap();
        let first = cluster.alloc(&AllocateTicket::bytes(16)).unwrap();
        let wedge = cluster.write_value(&NodeValue::blob(vec![1, 2, 3])).unwrap();
        let second = cluster.alloc(&AllocateTicket::bytes(16)).unwrap();
        cluster.alloc(&AllocateTicket::bytes(4)).unwrap();
        cluster.set_root_reference(Reference::to(wedge)).unwrap();
        let first_ptr = first.ptr();
        let span = second.end() - first_ptr.get();
        cluster.memory().free(&cluster, &[first, second]).unwrap();

        let mut moves = MoveBuffer::new();
        let outcome = DefragmentManager::new(&cluster)
            .optimize_free_chunks(&mut moves)
            .unwrap();
        assert_eq!(outcome.relocated, 1);
        assert!(outcome.coalesced >= 1);

        assert_eq!(root_target(&cluster), first_ptr);
        assert_eq!(moves.to_dest(wedge), Some(first_ptr));
        let moved = cluster.chunk(first_ptr).unwrap();
        assert_eq!(cluster.memory().free_count(), 1);
        let free = cluster.memory().free_list().first().unwrap();
        assert_eq!(free.get(), moved.end());
        assert_eq!(
            moved.footprint() + cluster.chunk(free).unwrap().footprint(),
            span
        );
    }

    #[test]
    fn move_reference_skips_root_and_infeasible_tickets() {
        let cluster = Cluster::in_memory().unwrap();
        let live = cluster.write_value(&NodeValue::blob(vec![1; 4])).unwrap();
        cluster.set_root_reference(Reference::to(live)).unwrap();
        let manager = DefragmentManager::new(&cluster);
        let size = cluster.store().size().unwrap();

        let root = ChunkPointer::new(FIRST_CHUNK).unwrap();
        assert!(manager.move_reference(root, |t| t, true).unwrap().is_empty());
        let never = manager
            .move_reference(live, |t| t.with_approval(|_| false), true)
            .unwrap();
        assert!(never.is_empty());
        assert_eq!(cluster.store().size().unwrap(), size);
        assert_eq!(root_target(&cluster), live);
    }

    #[test]
    fn move_reference_relocates_mid_chain_link() {
        let cluster = Cluster::in_memory().unwrap();
        let links = three_link_chain(&cluster);
        let value = cluster.read_value(links[0].ptr()).unwrap();

        let moves = DefragmentManager::new(&cluster)
            .move_reference(links[1].ptr(), |t| t, true)
            .unwrap();
        let new = moves.to_dest(links[1].ptr()).unwrap();
        assert_eq!(links[0].next_ptr(), Some(new));
        assert_eq!(cluster.read_value(links[0].ptr()).unwrap(), value);
    }

    #[derive(Default)]
    struct Tracker {
        moves: Mutex<Vec<(ChunkPointer, ChunkPointer)>>,
    }

    impl UnmanagedInstance for Tracker {
        fn on_relocated(&self, old: ChunkPointer, new: ChunkPointer) {
            self.moves.lock().push((old, new));
        }
    }

    #[test]
    fn unmanaged_values_move_only_when_allowed() {
        let cluster = Cluster::in_memory().unwrap();
        let opaque = cluster
            .write_value(&NodeValue::unmanaged(Vec::new(), b"self".to_vec()))
            .unwrap();
        cluster.set_root_reference(Reference::to(opaque)).unwrap();
        let tracker = Arc::new(Tracker::default());
        cluster.unmanaged().register(opaque, tracker.clone());
        let manager = DefragmentManager::new(&cluster);

        assert!(manager.move_reference(opaque, |t| t, false).unwrap().is_empty());
        assert!(tracker.moves.lock().is_empty());

        let moves = manager.move_reference(opaque, |t| t, true).unwrap();
        let new = moves.to_dest(opaque).unwrap();
        assert_eq!(*tracker.moves.lock(), vec![(opaque, new)]);
        assert_eq!(root_target(&cluster), new);
        assert!(cluster.unmanaged().get(new).is_some());
    }
}
