//! Chunks: a header plus a data region at a pointer.
//!
//! A [`Chunk`] is the materialized view of the header at one address. Views
//! are shared through the cluster's identity cache, so every mutation goes
//! through the single cached instance for that address.

mod header;

pub use header::ChunkHeader;

use crate::cluster::Cluster;
use crate::error::{CoreError, CoreResult};
use crate::number_size::NumberSize;
use crate::pointer::ChunkPointer;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A header-delimited run of bytes at a pointer.
pub struct Chunk {
    ptr: ChunkPointer,
    header: Mutex<ChunkHeader>,
    dirty: AtomicBool,
    body_pinned: AtomicBool,
}

impl Chunk {
    /// Creates a view that is not (yet) registered with any cache.
    ///
    /// Used for allocation candidates handed to approval predicates.
    #[must_use]
    pub fn detached(ptr: ChunkPointer, header: ChunkHeader) -> Self {
        Self {
            ptr,
            header: Mutex::new(header),
            dirty: AtomicBool::new(false),
            body_pinned: AtomicBool::new(false),
        }
    }

    /// Address of the header.
    #[must_use]
    pub fn ptr(&self) -> ChunkPointer {
        self.ptr
    }

    /// Copy of the current header.
    #[must_use]
    pub fn header(&self) -> ChunkHeader {
        *self.header.lock()
    }

    /// Total usable bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.header.lock().capacity
    }

    /// Bytes currently holding data.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.header.lock().size
    }

    /// Pointer to the next link, if any.
    #[must_use]
    pub fn next_ptr(&self) -> Option<ChunkPointer> {
        self.header.lock().next
    }

    /// Returns true if this chunk links to a successor.
    #[must_use]
    pub fn has_next(&self) -> bool {
        self.next_ptr().is_some()
    }

    /// Width of the next pointer field.
    #[must_use]
    pub fn next_size(&self) -> NumberSize {
        self.header.lock().next_size
    }

    /// Encoded header length.
    #[must_use]
    pub fn header_size(&self) -> u64 {
        self.header.lock().header_size()
    }

    /// Absolute address of the first data byte.
    #[must_use]
    pub fn data_start(&self) -> u64 {
        self.ptr.add(self.header_size())
    }

    /// Header plus capacity.
    #[must_use]
    pub fn footprint(&self) -> u64 {
        self.header.lock().footprint()
    }

    /// Address one past the last byte of this chunk.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.ptr.add(self.footprint())
    }

    /// Returns true if the in-memory header has unsynced changes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Pins the body width so that [`Chunk::set_capacity`] never re-encodes it.
    pub fn pin_body_size(&self) {
        self.body_pinned.store(true, Ordering::Release);
    }

    /// Dereferences the next pointer.
    ///
    /// # Errors
    ///
    /// Returns an error if the next pointer cannot be dereferenced.
    pub fn next(&self, cluster: &Cluster) -> CoreResult<Option<Arc<Chunk>>> {
        self.next_ptr().map(|ptr| cluster.chunk(ptr)).transpose()
    }

    /// Collects this chunk and every chunk reachable through `next`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedFile`] if the chain loops.
    pub fn collect_chain(self: &Arc<Self>, cluster: &Cluster) -> CoreResult<Vec<Arc<Chunk>>> {
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        let mut link = Some(Arc::clone(self));
        while let Some(chunk) = link {
            if !seen.insert(chunk.ptr) {
                return Err(CoreError::malformed_file(format!(
                    "chain starting at {} loops back to {}",
                    self.ptr, chunk.ptr
                )));
            }
            link = chunk.next(cluster)?;
            chain.push(chunk);
        }
        Ok(chain)
    }

    /// Last link of the chain starting at this chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be walked.
    pub fn last_in_chain(self: &Arc<Self>, cluster: &Cluster) -> CoreResult<Arc<Chunk>> {
        let chain = self.collect_chain(cluster)?;
        Ok(chain.last().map_or_else(|| Arc::clone(self), Arc::clone))
    }

    /// Sum of sizes over the chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be walked.
    pub fn chain_size(self: &Arc<Self>, cluster: &Cluster) -> CoreResult<u64> {
        Ok(self.collect_chain(cluster)?.iter().map(|c| c.size()).sum())
    }

    /// Sum of capacities over the chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be walked.
    pub fn chain_capacity(self: &Arc<Self>, cluster: &Cluster) -> CoreResult<u64> {
        Ok(self.collect_chain(cluster)?.iter().map(|c| c.capacity()).sum())
    }

    /// Number of links, counting at most `limit` when given.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be walked.
    pub fn chain_length(&self, cluster: &Cluster, limit: Option<usize>) -> CoreResult<usize> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut count = 1;
        let mut next = self.next_ptr();
        while let Some(ptr) = next {
            if count >= limit {
                break;
            }
            count += 1;
            next = cluster.chunk(ptr)?.next_ptr();
        }
        Ok(count.min(limit))
    }

    /// Capacity this chunk would have if its footprint became `footprint`,
    /// re-encoding the body width if needed.
    ///
    /// Returns `None` if the footprint cannot be represented (too small, or
    /// would need a wider body while the body width is pinned).
    #[must_use]
    pub fn capacity_for_footprint(&self, footprint: u64) -> Option<u64> {
        let header = self.header();
        let pinned = self.body_pinned.load(Ordering::Acquire);
        NumberSize::ALL
            .into_iter()
            .filter(|body| *body >= header.body_size && (!pinned || *body == header.body_size))
            .find_map(|body| {
                let capacity =
                    footprint.checked_sub(ChunkHeader::size_for(body, header.next_size))?;
                // set_capacity only widens to the narrowest width for the value
                let consistent = body == header.body_size || NumberSize::by_value(capacity) == body;
                (body.can_fit(capacity) && consistent).then_some(capacity)
            })
    }

    /// Footprint this chunk needs to hold `capacity` bytes, widening the body
    /// if required. `None` if the body width is pinned and too narrow.
    #[must_use]
    pub fn footprint_for_capacity(&self, capacity: u64) -> Option<u64> {
        let header = self.header();
        let body = NumberSize::by_value(capacity).max(header.body_size);
        if body != header.body_size && self.body_pinned.load(Ordering::Acquire) {
            return None;
        }
        Some(ChunkHeader::size_for(body, header.next_size) + capacity)
    }

    /// Sets the capacity field and persists the header.
    ///
    /// If `capacity` no longer fits the body width, the header is re-encoded
    /// wider and the data moved forward by the header growth; the caller
    /// must own the bytes up to `ptr + new_header + capacity`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OutOfBitDepth`] if the body width is pinned and
    /// cannot represent `capacity`.
    pub fn set_capacity(&self, cluster: &Cluster, capacity: u64) -> CoreResult<()> {
        let mut header = self.header();
        if header.body_size.can_fit(capacity) {
            header.capacity = capacity;
            header.size = header.size.min(capacity);
            return self.replace_header(cluster, header);
        }
        if self.body_pinned.load(Ordering::Acquire) {
            return Err(CoreError::OutOfBitDepth {
                value: capacity,
                width: header.body_size.bytes(),
            });
        }

        let old_start = self.data_start();
        let data = cluster.store().read_at(old_start, header.size as usize)?;
        header.body_size = NumberSize::by_value(capacity);
        header.capacity = capacity;
        let new_start = self.ptr.add(header.header_size());
        cluster.store().write_at(new_start, &data)?;
        tracing::debug!(ptr = %self.ptr, width = header.body_size.bytes(), "re-encoded chunk body width");
        self.replace_header(cluster, header)
    }

    /// Lowers `size` to at most `size`, without touching data bytes.
    pub fn clamp_size(&self, size: u64) {
        let mut header = self.header.lock();
        if size < header.size {
            header.size = size;
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Records that `size` bytes hold data. The caller has already written
    /// them.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OutOfSpace`] if `size` exceeds the capacity.
    pub fn set_size(&self, size: u64) -> CoreResult<()> {
        let mut header = self.header.lock();
        if size > header.capacity {
            return Err(CoreError::OutOfSpace {
                ptr: self.ptr,
                capacity: header.capacity,
                requested: size,
            });
        }
        if header.size != size {
            header.size = size;
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Grows `size`, zero-filling bytes newly brought into the data range.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OutOfSpace`] if `size` exceeds the capacity.
    pub fn grow_size_and_zero_out(&self, cluster: &Cluster, size: u64) -> CoreResult<()> {
        let old = self.size();
        if size <= old {
            return Ok(());
        }
        if size > self.capacity() {
            return Err(CoreError::OutOfSpace {
                ptr: self.ptr,
                capacity: self.capacity(),
                requested: size,
            });
        }
        cluster
            .store()
            .fill_zero(self.data_start() + old, size - old)?;
        self.set_size(size)
    }

    /// Changes the successor.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OutOfBitDepth`] if the next field is too narrow
    /// for `next`.
    pub fn set_next(&self, next: Option<ChunkPointer>) -> CoreResult<()> {
        let mut header = self.header.lock();
        let raw = ChunkPointer::to_raw(next);
        if !header.next_size.can_fit(raw) {
            return Err(CoreError::OutOfBitDepth {
                value: raw,
                width: header.next_size.bytes(),
            });
        }
        header.next = next;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Persists the header if it has unsynced changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be written.
    pub fn sync_struct(&self, cluster: &Cluster) -> CoreResult<()> {
        if self.is_dirty() {
            self.write_header(cluster)?;
        }
        Ok(())
    }

    /// Writes the header unconditionally.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be encoded or written.
    pub fn write_header(&self, cluster: &Cluster) -> CoreResult<()> {
        let header = self.header.lock();
        cluster.store().write_at(self.ptr.get(), &header.encode()?)?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Replaces the whole header and writes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be encoded or written.
    pub fn replace_header(&self, cluster: &Cluster, header: ChunkHeader) -> CoreResult<()> {
        *self.header.lock() = header;
        self.write_header(cluster)
    }

    /// Reads `len` data bytes starting at `offset` within this chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if the range exceeds the capacity or the read fails.
    pub fn read_data(&self, cluster: &Cluster, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        self.check_range(offset, len as u64)?;
        Ok(cluster.store().read_at(self.data_start() + offset, len)?)
    }

    /// Writes `data` starting at `offset` within this chunk.
    ///
    /// Does not change `size`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range exceeds the capacity or the write fails.
    pub fn write_data(&self, cluster: &Cluster, offset: u64, data: &[u8]) -> CoreResult<()> {
        self.check_range(offset, data.len() as u64)?;
        Ok(cluster.store().write_at(self.data_start() + offset, data)?)
    }

    /// Zero-fills data bytes in `[from, to)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range exceeds the capacity or the write fails.
    pub fn zero_data(&self, cluster: &Cluster, from: u64, to: u64) -> CoreResult<()> {
        if to <= from {
            return Ok(());
        }
        self.check_range(from, to - from)?;
        Ok(cluster.store().fill_zero(self.data_start() + from, to - from)?)
    }

    /// Frees this chunk and every chunk reachable via `next`.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be walked or freed.
    pub fn free_chaining(self: &Arc<Self>, cluster: &Cluster) -> CoreResult<()> {
        let chain = self.collect_chain(cluster)?;
        cluster.memory().free(cluster, &chain)
    }

    fn check_range(&self, offset: u64, len: u64) -> CoreResult<()> {
        let capacity = self.capacity();
        if offset.saturating_add(len) > capacity {
            return Err(CoreError::OutOfSpace {
                ptr: self.ptr,
                capacity,
                requested: offset.saturating_add(len),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header();
        f.debug_struct("Chunk")
            .field("ptr", &self.ptr)
            .field("capacity", &header.capacity)
            .field("size", &header.size)
            .field("next", &header.next)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header();
        write!(f, "{}[{}/{}]", self.ptr, header.size, header.capacity)?;
        if let Some(next) = header.next {
            write!(f, " -> {next}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::AllocateTicket;

    #[test]
    fn fresh_chunk_is_empty() {
        let cluster = Cluster::in_memory().unwrap();
        let chunk = cluster.alloc(&AllocateTicket::bytes(32)).unwrap();
        assert_eq!(chunk.size(), 0);
        assert_eq!(chunk.capacity(), 32);
        assert!(!chunk.has_next());
        assert_eq!(chunk.chain_length(&cluster, None).unwrap(), 1);
    }

    #[test]
    fn chain_metrics() {
        let cluster = Cluster::in_memory().unwrap();
        let tail = cluster.alloc(&AllocateTicket::bytes(8)).unwrap();
        let head = cluster
            .alloc(&AllocateTicket::bytes(16).with_next(tail.ptr()))
            .unwrap();

        head.write_data(&cluster, 0, &[7; 16]).unwrap();
        head.set_size(16).unwrap();
        head.sync_struct(&cluster).unwrap();
        tail.grow_size_and_zero_out(&cluster, 4).unwrap();

        assert_eq!(head.chain_size(&cluster).unwrap(), 20);
        assert_eq!(head.chain_capacity(&cluster).unwrap(), 24);
        assert_eq!(head.chain_length(&cluster, None).unwrap(), 2);
        assert_eq!(head.chain_length(&cluster, Some(1)).unwrap(), 1);
        assert_eq!(head.last_in_chain(&cluster).unwrap().ptr(), tail.ptr());
    }

    #[test]
    fn set_capacity_reencodes_body_width() {
        let cluster = Cluster::in_memory().unwrap();
        let chunk = cluster.alloc(&AllocateTicket::bytes(4)).unwrap();
        chunk.write_data(&cluster, 0, b"abcd").unwrap();
        chunk.set_size(4).unwrap();
        chunk.sync_struct(&cluster).unwrap();

        let footprint = chunk.header_size() + 1000;
        let capacity = chunk.capacity_for_footprint(footprint).unwrap();
        cluster
            .store()
            .set_size(chunk.ptr().add(footprint))
            .unwrap();
        chunk.set_capacity(&cluster, capacity).unwrap();

        assert_eq!(chunk.header().body_size, NumberSize::Short);
        assert_eq!(chunk.footprint(), footprint);
        assert_eq!(chunk.read_data(&cluster, 0, 4).unwrap(), b"abcd");
    }

    #[test]
    fn pinned_body_rejects_wide_capacity() {
        let cluster = Cluster::in_memory().unwrap();
        let chunk = cluster.alloc(&AllocateTicket::bytes(4)).unwrap();
        chunk.pin_body_size();
        let err = chunk.set_capacity(&cluster, 4000).unwrap_err();
        assert!(matches!(err, CoreError::OutOfBitDepth { value: 4000, .. }));
    }

    #[test]
    fn set_next_respects_width() {
        let cluster = Cluster::in_memory().unwrap();
        let chunk = cluster
            .alloc(&AllocateTicket::bytes(4).with_explicit_next_size(NumberSize::Byte))
            .unwrap();
        assert!(chunk.set_next(Some(ChunkPointer::new(200).unwrap())).is_ok());
        let err = chunk
            .set_next(Some(ChunkPointer::new(70_000).unwrap()))
            .unwrap_err();
        assert!(matches!(err, CoreError::OutOfBitDepth { .. }));
    }

    #[test]
    fn grow_size_zero_fills() {
        let cluster = Cluster::in_memory().unwrap();
        let chunk = cluster.alloc(&AllocateTicket::bytes(8)).unwrap();
        chunk.write_data(&cluster, 0, &[0xFF; 8]).unwrap();
        chunk.grow_size_and_zero_out(&cluster, 6).unwrap();
        assert_eq!(chunk.read_data(&cluster, 0, 8).unwrap(), vec![0, 0, 0, 0, 0, 0, 0xFF, 0xFF]);
        assert!(chunk.grow_size_and_zero_out(&cluster, 9).is_err());
    }
}
