//! Random-access cursor over a chunk chain.
//!
//! The logical data of a chain is the concatenation of each link's first
//! `size` bytes. Reads never go past the written data; writes fill the
//! remaining capacity and grow the chain through the memory manager when it
//! runs out.

use crate::chunk::Chunk;
use crate::cluster::Cluster;
use crate::error::{CoreError, CoreResult};
use crate::pointer::ChunkPointer;
use std::io;
use std::sync::Arc;

/// Cursor over the chain headed by a fixed chunk.
///
/// Dropping an unclosed cursor syncs the current chunk's header on a best
/// effort basis; call [`ChainCursor::close`] to observe errors.
pub struct ChainCursor<'a> {
    cluster: &'a Cluster,
    head: Arc<Chunk>,
    cursor: Arc<Chunk>,
    cursor_start: u64,
    pos: u64,
    closed: bool,
}

impl<'a> ChainCursor<'a> {
    /// Opens a cursor at position 0 of the chain headed by `head`.
    #[must_use]
    pub fn new(cluster: &'a Cluster, head: Arc<Chunk>) -> Self {
        Self {
            cluster,
            cursor: Arc::clone(&head),
            head,
            cursor_start: 0,
            pos: 0,
            closed: false,
        }
    }

    /// Head of the chain.
    #[must_use]
    pub fn head(&self) -> ChunkPointer {
        self.head.ptr()
    }

    /// Current logical position.
    #[must_use]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Moves to logical position `pos`, clamped to the end of the data.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be walked.
    pub fn set_pos(&mut self, pos: u64) -> CoreResult<()> {
        if pos < self.cursor_start {
            self.move_to(Arc::clone(&self.head), 0)?;
        }
        loop {
            let span = Self::effective_capacity(&self.cursor);
            if pos < self.cursor_start + span {
                break;
            }
            let Some(next) = self.cursor.next(self.cluster)? else {
                break;
            };
            let start = self.cursor_start + self.cursor.size();
            self.move_to(next, start)?;
        }
        self.pos = pos.min(self.cursor_start + Self::effective_capacity(&self.cursor));
        Ok(())
    }

    /// Reads up to `buf.len()` bytes of written data. Returns 0 at the end.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize> {
        let mut done = 0;
        while done < buf.len() {
            let local = self.pos - self.cursor_start;
            let size = self.cursor.size();
            if local >= size {
                let Some(next) = self.cursor.next(self.cluster)? else {
                    break;
                };
                let start = self.cursor_start + size;
                self.move_to(next, start)?;
                continue;
            }
            let n = (size - local).min((buf.len() - done) as u64) as usize;
            let bytes = self.cursor.read_data(self.cluster, local, n)?;
            buf[done..done + n].copy_from_slice(&bytes);
            done += n;
            self.pos += n as u64;
        }
        Ok(done)
    }

    /// Reads everything from the current position to the end of the data.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn read_all(&mut self) -> CoreResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Writes all of `buf` at the current position, growing the chain if
    /// needed. Returns `buf.len()`.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot grow or the store fails.
    pub fn write(&mut self, buf: &[u8]) -> CoreResult<usize> {
        let room = self
            .cursor
            .capacity()
            .saturating_sub(self.pos - self.cursor_start);
        if buf.len() as u64 > room {
            self.ensure_forward_capacity(buf.len() as u64)?;
        }

        let mut done = 0;
        while done < buf.len() {
            let local = self.pos - self.cursor_start;
            let capacity = self.cursor.capacity();
            if local >= capacity {
                self.advance_full((buf.len() - done) as u64)?;
                continue;
            }
            if local > self.cursor.size() {
                self.cursor.grow_size_and_zero_out(self.cluster, local)?;
            }
            let n = (capacity - local).min((buf.len() - done) as u64) as usize;
            self.cursor
                .write_data(self.cluster, local, &buf[done..done + n])?;
            let end = local + n as u64;
            if end > self.cursor.size() {
                self.cursor.set_size(end)?;
            }
            done += n;
            self.pos += n as u64;
        }
        Ok(done)
    }

    /// Writes all of `buf`.
    ///
    /// # Errors
    ///
    /// See [`ChainCursor::write`].
    pub fn write_all(&mut self, buf: &[u8]) -> CoreResult<()> {
        self.write(buf).map(|_| ())
    }

    /// Makes sure at least `bytes` of capacity exist from the current
    /// position onward, first counting capacity already allocated further
    /// down the chain and then growing the chain for the deficit.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownAllocationMethod`] if the chain cannot
    /// grow.
    pub fn ensure_forward_capacity(&mut self, bytes: u64) -> CoreResult<()> {
        let local = self.pos - self.cursor_start;
        let mut available = self.cursor.capacity().saturating_sub(local);
        let mut last = Arc::clone(&self.cursor);
        while available < bytes {
            let Some(next) = last.next(self.cluster)? else {
                break;
            };
            available += next.capacity();
            last = next;
        }
        if available < bytes {
            self.cluster
                .memory()
                .alloc_to(self.cluster, &self.head, &last, bytes - available)?;
        }
        Ok(())
    }

    /// Resizes the chain's total capacity.
    ///
    /// Shrinking truncates the link containing `capacity`, zeroes its
    /// dropped bytes and frees every following link. Growing extends the
    /// last link through the memory manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be walked, shrunk or grown.
    pub fn set_capacity(&mut self, capacity: u64) -> CoreResult<()> {
        let chain = self.head.collect_chain(self.cluster)?;
        let mut before = 0;
        for (i, link) in chain.iter().enumerate() {
            let link_capacity = link.capacity();
            if capacity <= before + link_capacity {
                let local = capacity - before;
                let detached = &chain[i + 1..];
                if !detached.is_empty() {
                    link.set_next(None)?;
                    link.write_header(self.cluster)?;
                    self.cluster.memory().free(self.cluster, detached)?;
                }
                link.zero_data(self.cluster, local, link_capacity)?;
                self.cluster.memory().shrink_chunk(self.cluster, link, local)?;
                return self.reset(capacity);
            }
            before += link_capacity;
        }

        let last = chain.last().map_or_else(|| Arc::clone(&self.head), Arc::clone);
        self.cluster
            .memory()
            .alloc_to(self.cluster, &self.head, &last, capacity - before)?;
        Ok(())
    }

    /// Sets the chain's total data size, filling links front to back and
    /// zero-filling newly included bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OutOfSpace`] if the chain's capacity is smaller
    /// than `size`.
    pub fn set_size(&mut self, size: u64) -> CoreResult<()> {
        let chain = self.head.collect_chain(self.cluster)?;
        let capacity: u64 = chain.iter().map(|link| link.capacity()).sum();
        if size > capacity {
            return Err(CoreError::OutOfSpace {
                ptr: self.head.ptr(),
                capacity,
                requested: size,
            });
        }

        let mut remaining = size;
        for link in &chain {
            let link_size = remaining.min(link.capacity());
            if link_size > link.size() {
                link.grow_size_and_zero_out(self.cluster, link_size)?;
            } else {
                link.clamp_size(link_size);
            }
            link.sync_struct(self.cluster)?;
            remaining -= link_size;
        }
        self.reset(size)
    }

    /// Persists the current chunk's header.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be written.
    pub fn close(mut self) -> CoreResult<()> {
        self.closed = true;
        self.cursor.sync_struct(self.cluster)
    }

    fn effective_capacity(chunk: &Chunk) -> u64 {
        if chunk.has_next() {
            chunk.capacity()
        } else {
            chunk.size()
        }
    }

    fn move_to(&mut self, chunk: Arc<Chunk>, start: u64) -> CoreResult<()> {
        if !Arc::ptr_eq(&chunk, &self.cursor) {
            self.cursor.sync_struct(self.cluster)?;
        }
        self.cursor = chunk;
        self.cursor_start = start;
        Ok(())
    }

    /// Steps past a full link during a write, growing the chain by
    /// `remaining` if this is the last link.
    fn advance_full(&mut self, remaining: u64) -> CoreResult<()> {
        let capacity = self.cursor.capacity();
        self.cursor.grow_size_and_zero_out(self.cluster, capacity)?;
        let next = match self.cursor.next(self.cluster)? {
            Some(next) => next,
            None => {
                self.cluster
                    .memory()
                    .alloc_to(self.cluster, &self.head, &self.cursor, remaining)?;
                match self.cursor.next(self.cluster)? {
                    Some(next) => next,
                    // grown in place
                    None => return Ok(()),
                }
            }
        };
        let start = self.cursor_start + capacity;
        self.move_to(next, start)
    }

    fn reset(&mut self, pos: u64) -> CoreResult<()> {
        let target = self.pos.min(pos);
        self.move_to(Arc::clone(&self.head), 0)?;
        self.set_pos(target)
    }
}

impl Drop for ChainCursor<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.cursor.sync_struct(self.cluster) {
                tracing::warn!(head = %self.head.ptr(), error = %err, "failed to sync chunk on drop");
            }
        }
    }
}

impl std::fmt::Debug for ChainCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainCursor")
            .field("head", &self.head.ptr())
            .field("cursor", &self.cursor.ptr())
            .field("cursor_start", &self.cursor_start)
            .field("pos", &self.pos)
            .finish()
    }
}

fn to_io(err: CoreError) -> io::Error {
    match err {
        CoreError::Io(err) => err,
        other => io::Error::other(other),
    }
}

impl io::Read for ChainCursor<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        ChainCursor::read(self, buf).map_err(to_io)
    }
}

impl io::Write for ChainCursor<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ChainCursor::write(self, buf).map_err(to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.cursor.sync_struct(self.cluster).map_err(to_io)
    }
}

impl io::Seek for ChainCursor<'_> {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(n) => Some(n),
            io::SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            io::SeekFrom::End(delta) => {
                let size = self.head.chain_size(self.cluster).map_err(to_io)?;
                size.checked_add_signed(delta)
            }
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of chain")
        })?;
        self.set_pos(target).map_err(to_io)?;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::AllocateTicket;
    use std::io::{Read as _, Seek as _, SeekFrom};

    fn chain(cluster: &Cluster, capacities: &[u64]) -> Arc<Chunk> {
        let mut next: Option<ChunkPointer> = None;
        let mut head = None;
        for capacity in capacities.iter().rev() {
            let mut ticket = AllocateTicket::bytes(*capacity);
            if let Some(ptr) = next {
                ticket = ticket.with_next(ptr);
            }
            let chunk = cluster.alloc(&ticket).unwrap();
            next = Some(chunk.ptr());
            head = Some(chunk);
        }
        head.unwrap()
    }

    #[test]
    fn write_spills_into_following_links() {
        let cluster = Cluster::in_memory().unwrap();
        let head = chain(&cluster, &[4, 4, 4]);
        let mut io = cluster.io(head.ptr()).unwrap();
        io.write_all(b"abcdefghij").unwrap();
        io.close().unwrap();

        let links = head.collect_chain(&cluster).unwrap();
        let sizes: Vec<_> = links.iter().map(|c| c.size()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(cluster.io(head.ptr()).unwrap().read_all().unwrap(), b"abcdefghij");
    }

    #[test]
    fn write_past_capacity_grows_chain() {
        let cluster = Cluster::in_memory().unwrap();
        let head = cluster.alloc(&AllocateTicket::bytes(4)).unwrap();
        cluster.alloc(&AllocateTicket::bytes(4)).unwrap();

        let data: Vec<u8> = (0..100).collect();
        let mut io = cluster.io(head.ptr()).unwrap();
        io.write_all(&data).unwrap();
        io.close().unwrap();

        assert!(head.has_next());
        assert_eq!(head.chain_size(&cluster).unwrap(), 100);
        assert_eq!(cluster.io(head.ptr()).unwrap().read_all().unwrap(), data);
    }

    #[test]
    fn set_pos_moves_backwards_and_clamps() {
        let cluster = Cluster::in_memory().unwrap();
        let head = chain(&cluster, &[3, 3, 3]);
        let mut io = cluster.io(head.ptr()).unwrap();
        io.write_all(b"012345678").unwrap();

        io.set_pos(7).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(io.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"78");

        io.set_pos(1).unwrap();
        assert_eq!(io.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"12");

        io.set_pos(500).unwrap();
        assert_eq!(io.pos(), 9);
        assert_eq!(io.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn overwrite_in_the_middle_keeps_size() {
        let cluster = Cluster::in_memory().unwrap();
        let head = chain(&cluster, &[4, 4]);
        let mut io = cluster.io(head.ptr()).unwrap();
        io.write_all(b"aaaaaaaa").unwrap();
        io.set_pos(3).unwrap();
        io.write_all(b"XY").unwrap();
        io.close().unwrap();

        assert_eq!(head.chain_size(&cluster).unwrap(), 8);
        assert_eq!(cluster.io(head.ptr()).unwrap().read_all().unwrap(), b"aaaXYaaa");
    }

    #[test]
    fn set_capacity_shrinks_single_chunk() {
        let cluster = Cluster::in_memory().unwrap();
        let head = cluster.alloc(&AllocateTicket::bytes(100)).unwrap();
        let mut io = cluster.io(head.ptr()).unwrap();
        io.write_all(&[0xEE; 100]).unwrap();
        io.set_capacity(40).unwrap();
        io.close().unwrap();

        assert_eq!(head.capacity(), 40);
        assert!(head.size() <= 40);
        assert!(!head.has_next());
        assert_eq!(head.read_data(&cluster, 0, 40).unwrap(), vec![0xEE; 40]);
        let rest = cluster.chunk(ChunkPointer::new(head.end()).unwrap()).unwrap();
        assert!(cluster.memory().is_free(rest.ptr()));
        let dropped = cluster
            .store()
            .read_at(rest.data_start(), rest.capacity() as usize)
            .unwrap();
        assert!(dropped.iter().all(|b| *b == 0));
    }

    #[test]
    fn set_capacity_frees_downstream_links() {
        let cluster = Cluster::in_memory().unwrap();
        let head = chain(&cluster, &[8, 8, 8]);
        let tail_ptrs: Vec<_> = head
            .collect_chain(&cluster)
            .unwrap()
            .iter()
            .skip(1)
            .map(|c| c.ptr())
            .collect();
        let mut io = cluster.io(head.ptr()).unwrap();
        io.write_all(&[1; 24]).unwrap();
        io.set_capacity(8).unwrap();
        io.close().unwrap();

        assert!(!head.has_next());
        assert_eq!(head.size(), 8);
        assert!(tail_ptrs.iter().all(|p| cluster.memory().is_free(*p)));
    }

    #[test]
    fn set_capacity_grows_chain() {
        let cluster = Cluster::in_memory().unwrap();
        let head = cluster.alloc(&AllocateTicket::bytes(10)).unwrap();
        let mut io = cluster.io(head.ptr()).unwrap();
        io.set_capacity(50).unwrap();
        io.close().unwrap();
        assert!(head.chain_capacity(&cluster).unwrap() >= 50);
    }

    #[test]
    fn set_size_zero_fills_and_rejects_overflow() {
        let cluster = Cluster::in_memory().unwrap();
        let head = chain(&cluster, &[4, 4]);
        let mut io = cluster.io(head.ptr()).unwrap();
        io.write_all(b"ab").unwrap();
        io.set_size(6).unwrap();
        assert_eq!(head.size(), 4);
        io.set_pos(0).unwrap();
        assert_eq!(io.read_all().unwrap(), b"ab\0\0\0\0");

        let err = io.set_size(9).unwrap_err();
        assert!(matches!(err, CoreError::OutOfSpace { capacity: 8, requested: 9, .. }));
    }

    #[test]
    fn std_io_traits() {
        let cluster = Cluster::in_memory().unwrap();
        let head = cluster.alloc(&AllocateTicket::bytes(8)).unwrap();
        let mut io = cluster.io(head.ptr()).unwrap();
        std::io::Write::write_all(&mut io, b"hello world").unwrap();

        assert_eq!(io.seek(SeekFrom::End(-5)).unwrap(), 6);
        let mut out = String::new();
        io.read_to_string(&mut out).unwrap();
        assert_eq!(out, "world");
        assert!(io.seek(SeekFrom::Current(-100)).is_err());
    }
}
