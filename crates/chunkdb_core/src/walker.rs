//! Live reference graph traversal.
//!
//! A [`GraphWalker`] enumerates every reference slot reachable from the
//! root chunk and hands each one to a visitor. The visitor can rewrite the
//! slot in place or stop the walk early.

use crate::cluster::{Cluster, FIRST_CHUNK};
use crate::error::CoreResult;
use crate::pointer::{ChunkPointer, Reference};
use crate::value::{NodeValue, ValueKind};
use std::collections::HashSet;

/// Visitor decision after each slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    /// Keep walking.
    Continue,
    /// End the walk after this slot.
    Stop,
}

/// Whether the value behind a reference can be walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Shape known; its own slots are walked as well.
    Managed,
    /// Opaque allocation that tracks its own address.
    Unmanaged,
}

/// One discovered reference slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotVisit {
    /// Head of the chain holding the slot.
    pub owner: ChunkPointer,
    /// Index of the slot in the owner's value.
    pub slot_index: usize,
    /// Logical offset of the slot in the owner's chain data.
    pub slot_offset: u64,
    /// Current slot value.
    pub reference: Reference,
    /// Kind of the referenced value.
    pub target_kind: TargetKind,
}

impl SlotVisit {
    /// Returns true if the referenced value is walkable.
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.target_kind == TargetKind::Managed
    }

    /// Returns true if the referenced value tracks its own address.
    #[must_use]
    pub fn is_unmanaged(&self) -> bool {
        self.target_kind == TargetKind::Unmanaged
    }

    /// Absolute store address of the slot's first byte.
    ///
    /// # Errors
    ///
    /// Returns an error if the owner chain cannot be walked.
    pub fn slot_address(&self, cluster: &Cluster) -> CoreResult<u64> {
        cluster.resolve_address(self.owner, self.slot_offset)
    }

    /// Overwrites the slot with `reference`.
    ///
    /// # Errors
    ///
    /// Returns an error if the owner chain cannot be written.
    pub fn rewrite(&mut self, cluster: &Cluster, reference: Reference) -> CoreResult<()> {
        let mut io = cluster.io(self.owner)?;
        io.set_pos(self.slot_offset)?;
        io.write_all(&reference.encode())?;
        io.close()?;
        self.reference = reference;
        Ok(())
    }
}

/// Enumerates the reference slots of the live graph.
pub trait GraphWalker: Send + Sync {
    /// Calls `visit` once per non-null slot reachable from the root chunk,
    /// in a single pass.
    ///
    /// # Errors
    ///
    /// Propagates errors from reading values or from `visit`.
    fn walk(
        &self,
        cluster: &Cluster,
        visit: &mut dyn FnMut(&mut SlotVisit) -> CoreResult<WalkControl>,
    ) -> CoreResult<()>;
}

/// Depth-first walker over [`NodeValue`] graphs.
///
/// Each chain is expanded once, so shared and cyclic references are safe.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeGraphWalker;

impl GraphWalker for NodeGraphWalker {
    fn walk(
        &self,
        cluster: &Cluster,
        visit: &mut dyn FnMut(&mut SlotVisit) -> CoreResult<WalkControl>,
    ) -> CoreResult<()> {
        let root = ChunkPointer::new(FIRST_CHUNK)?;
        let mut expanded = HashSet::from([root]);
        let mut stack = vec![root];

        while let Some(owner) = stack.pop() {
            let value = cluster.read_value(owner)?;
            for (slot_index, reference) in value.refs.iter().enumerate() {
                let Some(target) = reference.ptr else {
                    continue;
                };
                let kind = cluster.value_kind(target)?;
                let mut slot = SlotVisit {
                    owner,
                    slot_index,
                    slot_offset: NodeValue::slot_offset(slot_index),
                    reference: *reference,
                    target_kind: match kind {
                        ValueKind::Unmanaged => TargetKind::Unmanaged,
                        _ => TargetKind::Managed,
                    },
                };
                if visit(&mut slot)? == WalkControl::Stop {
                    return Ok(());
                }

                if let Some(target) = slot.reference.ptr {
                    let kind = if slot.reference == *reference {
                        kind
                    } else {
                        cluster.value_kind(target)?
                    };
                    if kind != ValueKind::Blob && expanded.insert(target) {
                        stack.push(target);
                    }
                }
            }
        }
        Ok(())
    }
}
