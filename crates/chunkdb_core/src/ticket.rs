//! Allocation requests.

use crate::chunk::Chunk;
use crate::cluster::Cluster;
use crate::error::{CoreError, CoreResult};
use crate::number_size::NumberSize;
use crate::pointer::ChunkPointer;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Predicate deciding whether a candidate chunk is an acceptable placement.
pub type Approval = Arc<dyn Fn(&Chunk) -> bool + Send + Sync>;

/// Callback filling a freshly allocated chunk before it is handed back.
pub type DataPopulator = Arc<dyn Fn(&Cluster, &Arc<Chunk>) -> CoreResult<()> + Send + Sync>;

/// Immutable allocation request.
///
/// Every `with_*` method returns a new ticket that shares the unchanged
/// fields.
///
/// ## Example
///
/// ```rust
/// use chunkdb_core::{AllocateTicket, Cluster};
///
/// let cluster = Cluster::in_memory().unwrap();
/// let chunk = AllocateTicket::bytes(64)
///     .with_data(b"hello".to_vec())
///     .submit(&cluster)
///     .unwrap();
/// assert_eq!(chunk.size(), 5);
/// assert!(chunk.capacity() >= 64);
/// ```
#[derive(Clone)]
pub struct AllocateTicket {
    bytes: u64,
    next: Option<ChunkPointer>,
    explicit_next_size: Option<NumberSize>,
    position_magnet: Option<u64>,
    approval: Option<Approval>,
    data_populator: Option<DataPopulator>,
}

impl AllocateTicket {
    /// Requests a chunk with room for `bytes`.
    #[must_use]
    pub fn bytes(bytes: u64) -> Self {
        Self {
            bytes,
            next: None,
            explicit_next_size: None,
            position_magnet: None,
            approval: None,
            data_populator: None,
        }
    }

    /// Requested byte count.
    #[must_use]
    pub fn requested_bytes(&self) -> u64 {
        self.bytes
    }

    /// Pre-chosen successor of the new chunk.
    #[must_use]
    pub fn next(&self) -> Option<ChunkPointer> {
        self.next
    }

    /// Explicit minimum width of the next field.
    #[must_use]
    pub fn explicit_next_size(&self) -> Option<NumberSize> {
        self.explicit_next_size
    }

    /// Preferred address, used only to break ties.
    #[must_use]
    pub fn position_magnet(&self) -> Option<u64> {
        self.position_magnet
    }

    /// Returns a copy requesting `bytes` instead.
    #[must_use]
    pub fn with_bytes(&self, bytes: u64) -> Self {
        Self {
            bytes,
            ..self.clone()
        }
    }

    /// Returns a copy that links the new chunk to `next`.
    #[must_use]
    pub fn with_next(&self, next: ChunkPointer) -> Self {
        Self {
            next: Some(next),
            ..self.clone()
        }
    }

    /// Returns a copy with an explicit minimum next field width.
    #[must_use]
    pub fn with_explicit_next_size(&self, size: NumberSize) -> Self {
        Self {
            explicit_next_size: Some(size),
            ..self.clone()
        }
    }

    /// Returns a copy preferring placement near `address`.
    #[must_use]
    pub fn with_position_magnet(&self, address: u64) -> Self {
        Self {
            position_magnet: Some(address),
            ..self.clone()
        }
    }

    /// Returns a copy that also requires `approve` to accept the candidate.
    ///
    /// Predicates compose with logical AND.
    #[must_use]
    pub fn with_approval(&self, approve: impl Fn(&Chunk) -> bool + Send + Sync + 'static) -> Self {
        let approval: Approval = match &self.approval {
            Some(existing) => {
                let existing = Arc::clone(existing);
                Arc::new(move |chunk: &Chunk| existing(chunk) && approve(chunk))
            }
            None => Arc::new(approve),
        };
        Self {
            approval: Some(approval),
            ..self.clone()
        }
    }

    /// Returns a copy that runs `populate` once on the new chunk.
    #[must_use]
    pub fn with_data_populated(
        &self,
        populate: impl Fn(&Cluster, &Arc<Chunk>) -> CoreResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            data_populator: Some(Arc::new(populate)),
            ..self.clone()
        }
    }

    /// Returns a copy that writes `data` into the new chunk. Also raises the
    /// requested size to at least `data.len()`.
    #[must_use]
    pub fn with_data(&self, data: Vec<u8>) -> Self {
        let bytes = self.bytes.max(data.len() as u64);
        self.with_bytes(bytes)
            .with_data_populated(move |cluster, chunk| {
                let mut io = cluster.io(chunk.ptr())?;
                io.write_all(&data)?;
                io.close()
            })
    }

    /// Evaluates the composed approval predicate; true when none is set.
    #[must_use]
    pub fn approve(&self, chunk: &Chunk) -> bool {
        self.approval.as_ref().map_or(true, |approve| approve(chunk))
    }

    /// Runs the data populator, if any.
    ///
    /// # Errors
    ///
    /// Propagates the populator's error.
    pub fn populate(&self, cluster: &Cluster, chunk: &Arc<Chunk>) -> CoreResult<()> {
        match &self.data_populator {
            Some(populate) => populate(cluster, chunk),
            None => Ok(()),
        }
    }

    /// Allocates a chunk for this ticket.
    ///
    /// # Errors
    ///
    /// Failures are wrapped in [`CoreError::Io`]; use
    /// [`CoreError::allocation_cause`] to recover the cause. A
    /// [`CoreError::MissingField`] propagates unwrapped.
    pub fn submit(&self, cluster: &Cluster) -> CoreResult<Arc<Chunk>> {
        match cluster.memory().alloc(cluster, self) {
            Ok(chunk) => Ok(chunk),
            Err(err @ CoreError::MissingField { .. }) => Err(err),
            Err(err) => Err(CoreError::Io(io::Error::other(err))),
        }
    }

    /// Returns true if [`AllocateTicket::submit`] would find a placement.
    /// Does not modify the store.
    #[must_use]
    pub fn can_submit(&self, cluster: &Cluster) -> bool {
        cluster.memory().can_alloc(cluster, self)
    }
}

impl fmt::Debug for AllocateTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocateTicket")
            .field("bytes", &self.bytes)
            .field("next", &self.next)
            .field("explicit_next_size", &self.explicit_next_size)
            .field("position_magnet", &self.position_magnet)
            .field("approval", &self.approval.is_some())
            .field("data_populator", &self.data_populator.is_some())
            .finish()
    }
}
