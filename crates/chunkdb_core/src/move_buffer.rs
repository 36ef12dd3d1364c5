//! Per-pass forwarding log of relocated chunks.

use crate::chunk::Chunk;
use crate::cluster::Cluster;
use crate::error::CoreResult;
use crate::pointer::ChunkPointer;
use std::sync::Arc;

/// Append-only list of `(old, new)` pointer pairs recorded during one
/// compaction pass. The first entry for an old pointer wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveBuffer {
    moves: Vec<(ChunkPointer, ChunkPointer)>,
}

impl MoveBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a move. Ignored if `old` already has an entry.
    pub fn record(&mut self, old: ChunkPointer, new: ChunkPointer) {
        if !self.moved(old) {
            self.moves.push((old, new));
        }
    }

    /// Appends the entries of another buffer.
    pub fn extend(&mut self, other: &MoveBuffer) {
        for &(old, new) in &other.moves {
            self.record(old, new);
        }
    }

    /// Returns true if `ptr` was moved during this pass.
    #[must_use]
    pub fn moved(&self, ptr: ChunkPointer) -> bool {
        self.moves.iter().any(|(old, _)| *old == ptr)
    }

    /// Forwarding address of `ptr`.
    #[must_use]
    pub fn to_dest(&self, ptr: ChunkPointer) -> Option<ChunkPointer> {
        self.moves
            .iter()
            .find_map(|&(old, new)| (old == ptr).then_some(new))
    }

    /// Returns true if any link of the chain starting at `start` was moved.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be walked.
    pub fn chain_affected(&self, cluster: &Cluster, start: &Arc<Chunk>) -> CoreResult<bool> {
        if self.moves.is_empty() {
            return Ok(false);
        }
        Ok(start
            .collect_chain(cluster)?
            .iter()
            .any(|link| self.moved(link.ptr())))
    }

    /// Number of recorded moves.
    #[must_use]
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    /// Returns true if nothing moved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Iterates the recorded pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (ChunkPointer, ChunkPointer)> + '_ {
        self.moves.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::AllocateTicket;

    fn ptr(v: u64) -> ChunkPointer {
        ChunkPointer::new(v).unwrap()
    }

    #[test]
    fn first_write_wins() {
        let mut buffer = MoveBuffer::new();
        buffer.record(ptr(100), ptr(20));
        buffer.record(ptr(100), ptr(60));

        assert_eq!(buffer.len(), 1);
        assert!(buffer.moved(ptr(100)));
        assert_eq!(buffer.to_dest(ptr(100)), Some(ptr(20)));
        assert_eq!(buffer.to_dest(ptr(20)), None);
    }

    #[test]
    fn extend_keeps_existing_entries() {
        let mut a = MoveBuffer::new();
        a.record(ptr(10), ptr(11));
        let mut b = MoveBuffer::new();
        b.record(ptr(10), ptr(99));
        b.record(ptr(30), ptr(31));

        a.extend(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![(ptr(10), ptr(11)), (ptr(30), ptr(31))]);
    }

    #[test]
    fn chain_affected_checks_every_link() {
        let cluster = Cluster::in_memory().unwrap();
        let tail = cluster.alloc(&AllocateTicket::bytes(4)).unwrap();
        let head = cluster
            .alloc(&AllocateTicket::bytes(4).with_next(tail.ptr()))
            .unwrap();

        let mut buffer = MoveBuffer::new();
        assert!(!buffer.chain_affected(&cluster, &head).unwrap());
        buffer.record(tail.ptr(), ptr(500));
        assert!(buffer.chain_affected(&cluster, &head).unwrap());
    }
}
