//! Cluster: the composition root tying one byte store to its allocator.
//!
//! A [`Cluster`] owns the store, the chunk identity cache, the memory
//! manager, the graph walker and the unmanaged registry. Every other
//! component receives the cluster by reference.
//!
//! ## Store layout
//!
//! ```text
//! ┌──────────┬──────────────┬─────────┬─────────┬─────
//! │ CHUNKDB1 │ root chunk   │ chunk   │ chunk   │ ...
//! │ 8 bytes  │ at offset 8  │         │         │
//! └──────────┴──────────────┴─────────┴─────────┴─────
//! ```
//!
//! The root chunk holds a node value with two slots: the application root
//! and the persisted free list.

use crate::cache::ChunkCache;
use crate::chunk::{Chunk, ChunkHeader};
use crate::config::Config;
use crate::cursor::ChainCursor;
use crate::defragment::{DefragmentManager, DefragmentReport, FreeChunkScanPolicy};
use crate::error::{CoreError, CoreResult};
use crate::free_list::FreeList;
use crate::memory::MemoryManager;
use crate::number_size::NumberSize;
use crate::pointer::{ChunkPointer, Reference};
use crate::stats::ClusterStats;
use crate::ticket::AllocateTicket;
use crate::unmanaged::UnmanagedRegistry;
use crate::value::{NodeValue, ValueKind};
use crate::walker::{GraphWalker, NodeGraphWalker};
use chunkdb_storage::{ByteStore, FileBackend, InMemoryBackend};
use std::path::Path;
use std::sync::Arc;

/// Identifying prefix of every store.
pub const MAGIC: [u8; 8] = *b"CHUNKDB1";

/// Address of the root chunk, right after the magic.
pub const FIRST_CHUNK: u64 = MAGIC.len() as u64;

const ROOT_SLOT: usize = 0;
const FREE_LIST_SLOT: usize = 1;
const ROOT_SLOTS: usize = 2;
const FLUSH_PASSES: usize = 16;

/// One store together with its allocator state.
pub struct Cluster {
    store: Box<dyn ByteStore>,
    config: Config,
    cache: ChunkCache,
    memory: MemoryManager,
    walker: Arc<dyn GraphWalker>,
    unmanaged: UnmanagedRegistry,
    stats: ClusterStats,
}

impl Cluster {
    /// Initializes an empty store: writes the magic and allocates the root
    /// chunk.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the store is not empty.
    pub fn create(store: impl ByteStore + 'static, config: Config) -> CoreResult<Self> {
        Self::create_with_memory(store, config, MemoryManager::new())
    }

    /// Like [`Cluster::create`], with a custom memory manager.
    ///
    /// # Errors
    ///
    /// See [`Cluster::create`].
    pub fn create_with_memory(
        store: impl ByteStore + 'static,
        config: Config,
        memory: MemoryManager,
    ) -> CoreResult<Self> {
        if store.size()? != 0 {
            return Err(CoreError::invalid_operation(
                "cannot create a cluster on a non-empty store",
            ));
        }
        store.write_at(0, &MAGIC)?;
        let cluster = Self::assemble(Box::new(store), config, memory);

        let root = NodeValue::node(vec![Reference::NULL; ROOT_SLOTS], Vec::new()).encode();
        let ticket = AllocateTicket::bytes(root.len() as u64).with_data(root);
        let chunk = cluster.alloc(&ticket)?;
        if chunk.ptr().get() != FIRST_CHUNK {
            return Err(CoreError::malformed_file(format!(
                "root chunk landed at {} instead of {FIRST_CHUNK}",
                chunk.ptr()
            )));
        }
        tracing::info!(size = cluster.store.size()?, "created cluster");
        Ok(cluster)
    }

    /// Opens an existing store.
    ///
    /// Loads the persisted free list, dropping entries that no longer look
    /// like free chunks, then runs the configured reachability scan.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedFile`] if the magic or the root chunk
    /// is invalid, or if a strict scan finds garbage.
    pub fn open(store: impl ByteStore + 'static, config: Config) -> CoreResult<Self> {
        Self::open_with_memory(store, config, MemoryManager::new())
    }

    /// Like [`Cluster::open`], with a custom memory manager.
    ///
    /// # Errors
    ///
    /// See [`Cluster::open`].
    pub fn open_with_memory(
        store: impl ByteStore + 'static,
        config: Config,
        memory: MemoryManager,
    ) -> CoreResult<Self> {
        let size = store.size()?;
        if size <= FIRST_CHUNK {
            return Err(CoreError::malformed_file(format!(
                "store of {size} bytes has no root chunk"
            )));
        }
        if store.read_at(0, MAGIC.len())? != MAGIC {
            return Err(CoreError::malformed_file("bad store magic"));
        }

        let cluster = Self::assemble(Box::new(store), config, memory);
        let root = cluster.read_value(cluster.root_ptr()?)?;
        if root.kind != ValueKind::Node || root.refs.len() < ROOT_SLOTS {
            return Err(CoreError::malformed_file("root chunk is not a root node"));
        }
        cluster.load_free_list()?;

        let policy = cluster.config.open_scan_policy;
        if policy != FreeChunkScanPolicy::Nothing {
            DefragmentManager::new(&cluster).scan_free_chunks(policy)?;
        }
        tracing::info!(
            size,
            free_chunks = cluster.memory.free_count(),
            "opened cluster"
        );
        Ok(cluster)
    }

    /// Opens the store file at `path`, creating and initializing it when it
    /// is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be locked or is not a store.
    pub fn open_path(path: &Path, config: Config) -> CoreResult<Self> {
        let store = FileBackend::open_with_create_dirs(path)?;
        if store.size()? == 0 {
            Self::create(store, config)
        } else {
            Self::open(store, config)
        }
    }

    /// Creates a cluster over a fresh in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the root chunk cannot be allocated.
    pub fn in_memory() -> CoreResult<Self> {
        Self::in_memory_with_config(Config::default())
    }

    /// Creates a cluster over a fresh in-memory store with `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root chunk cannot be allocated.
    pub fn in_memory_with_config(config: Config) -> CoreResult<Self> {
        Self::create(InMemoryBackend::new(), config)
    }

    /// Replaces the graph walker used for reachability and relocation.
    #[must_use]
    pub fn with_walker(mut self, walker: Arc<dyn GraphWalker>) -> Self {
        self.walker = walker;
        self
    }

    fn assemble(store: Box<dyn ByteStore>, config: Config, memory: MemoryManager) -> Self {
        Self {
            cache: ChunkCache::new(config.cache_policy),
            store,
            config,
            memory,
            walker: Arc::new(NodeGraphWalker),
            unmanaged: UnmanagedRegistry::new(),
            stats: ClusterStats::new(),
        }
    }

    /// The underlying byte store.
    #[must_use]
    pub fn store(&self) -> &dyn ByteStore {
        self.store.as_ref()
    }

    /// The configuration the cluster was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn cache(&self) -> &ChunkCache {
        &self.cache
    }

    /// The memory manager.
    #[must_use]
    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// The graph walker.
    #[must_use]
    pub fn walker(&self) -> &dyn GraphWalker {
        self.walker.as_ref()
    }

    /// Registry of self-tracking allocations.
    #[must_use]
    pub fn unmanaged(&self) -> &UnmanagedRegistry {
        &self.unmanaged
    }

    /// Operation counters.
    #[must_use]
    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }

    /// Dereferences `ptr` through the identity cache.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PointerOutsideFile`] past the end of the store,
    /// [`CoreError::MalformedPointer`] if no header parses there, and under
    /// debug validation [`CoreError::CacheOutOfSync`] if a clean cached view
    /// disagrees with the store.
    pub fn chunk(&self, ptr: ChunkPointer) -> CoreResult<Arc<Chunk>> {
        let size = self.store.size()?;
        if ptr.get() >= size {
            return Err(CoreError::PointerOutsideFile { ptr, size });
        }
        if ptr.get() < FIRST_CHUNK {
            return Err(CoreError::malformed_pointer(ptr, "points into the store magic"));
        }

        let (chunk, hit) = self.cache.get_or_load(ptr, || self.load(ptr, size))?;
        if hit && self.config.debug_validation && !chunk.is_dirty() {
            let stored = self.load(ptr, size)?;
            if stored.header() != chunk.header() {
                return Err(CoreError::CacheOutOfSync { ptr });
            }
        }
        Ok(chunk)
    }

    fn load(&self, ptr: ChunkPointer, size: u64) -> CoreResult<Chunk> {
        let len = (size - ptr.get()).min(ChunkHeader::MAX_SIZE as u64) as usize;
        let bytes = self.store.read_at(ptr.get(), len)?;
        let header = ChunkHeader::decode(ptr, &bytes)?;
        if ptr.add(header.footprint()) > size {
            return Err(CoreError::malformed_pointer(
                ptr,
                format!("footprint {} runs past the store end {size}", header.footprint()),
            ));
        }
        Ok(Chunk::detached(ptr, header))
    }

    fn root_ptr(&self) -> CoreResult<ChunkPointer> {
        ChunkPointer::new(FIRST_CHUNK)
    }

    /// The root chunk at [`FIRST_CHUNK`].
    ///
    /// # Errors
    ///
    /// Returns an error if the root chunk cannot be read.
    pub fn root_chunk(&self) -> CoreResult<Arc<Chunk>> {
        self.chunk(self.root_ptr()?)
    }

    /// The application root reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the root chunk cannot be read.
    pub fn root_reference(&self) -> CoreResult<Reference> {
        self.root_slot(ROOT_SLOT)
    }

    /// Replaces the application root reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the root chunk cannot be written.
    pub fn set_root_reference(&self, reference: Reference) -> CoreResult<()> {
        self.set_root_slot(ROOT_SLOT, reference)
    }

    fn root_slot(&self, index: usize) -> CoreResult<Reference> {
        self.read_value(self.root_ptr()?)?
            .refs
            .get(index)
            .copied()
            .ok_or_else(|| CoreError::malformed_file(format!("root node lacks slot {index}")))
    }

    fn set_root_slot(&self, index: usize, reference: Reference) -> CoreResult<()> {
        let mut io = self.io(self.root_ptr()?)?;
        io.set_pos(NodeValue::slot_offset(index))?;
        io.write_all(&reference.encode())?;
        io.close()
    }

    /// Allocates a chunk for `ticket` without wrapping errors.
    ///
    /// # Errors
    ///
    /// See [`MemoryManager::alloc`].
    pub fn alloc(&self, ticket: &AllocateTicket) -> CoreResult<Arc<Chunk>> {
        self.memory.alloc(self, ticket)
    }

    /// Opens a cursor over the chain headed by `ptr`.
    ///
    /// # Errors
    ///
    /// Returns an error if `ptr` cannot be dereferenced.
    pub fn io(&self, ptr: ChunkPointer) -> CoreResult<ChainCursor<'_>> {
        Ok(ChainCursor::new(self, self.chunk(ptr)?))
    }

    /// Enumerates every chunk in address order, free ones included.
    #[must_use]
    pub fn physical_chunks(&self) -> PhysicalChunks<'_> {
        PhysicalChunks {
            cluster: self,
            at: FIRST_CHUNK,
            done: false,
        }
    }

    /// The physically last chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if the store does not tile cleanly.
    pub fn last_chunk(&self) -> CoreResult<Option<Arc<Chunk>>> {
        let mut last = None;
        for chunk in self.physical_chunks() {
            last = Some(chunk?);
        }
        Ok(last)
    }

    /// Allocates a chain holding `value` and returns its head.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocation or the write fails.
    pub fn write_value(&self, value: &NodeValue) -> CoreResult<ChunkPointer> {
        let bytes = value.encode();
        let ticket = AllocateTicket::bytes(bytes.len() as u64).with_data(bytes);
        Ok(self.alloc(&ticket)?.ptr())
    }

    /// Reads and decodes the value held by the chain at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedFile`] if the data is not a value.
    pub fn read_value(&self, ptr: ChunkPointer) -> CoreResult<NodeValue> {
        let bytes = self.io(ptr)?.read_all()?;
        NodeValue::decode(&bytes)
    }

    /// Kind of the value at `ptr`, read from its first byte only.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedFile`] for an unknown tag.
    pub fn value_kind(&self, ptr: ChunkPointer) -> CoreResult<ValueKind> {
        let mut io = self.io(ptr)?;
        let mut tag = [0u8; 1];
        if io.read(&mut tag)? == 0 {
            return Ok(ValueKind::Blob);
        }
        ValueKind::from_tag(tag[0])
            .ok_or_else(|| CoreError::malformed_file(format!("unknown value tag {} at {ptr}", tag[0])))
    }

    /// Store address of logical byte `offset` of the chain at `head`.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be walked.
    pub fn resolve_address(&self, head: ChunkPointer, offset: u64) -> CoreResult<u64> {
        let chain = self.chunk(head)?.collect_chain(self)?;
        let mut start = 0;
        for link in &chain {
            if !link.has_next() || offset < start + link.size() {
                return Ok(link.data_start() + (offset - start));
            }
            start += link.size();
        }
        Err(CoreError::malformed_pointer(head, "empty chain"))
    }

    /// Persists the free list and every dirty chunk header, then flushes
    /// the store.
    ///
    /// # Errors
    ///
    /// Returns an error if any write fails.
    pub fn flush(&self) -> CoreResult<()> {
        self.persist_free_list()?;
        for chunk in self.cache.dirty_chunks() {
            chunk.sync_struct(self)?;
        }
        self.store.flush()?;
        Ok(())
    }

    /// Runs a full compaction.
    ///
    /// # Errors
    ///
    /// See [`DefragmentManager::defragment`].
    pub fn defragment(&self) -> CoreResult<DefragmentReport> {
        DefragmentManager::new(self).defragment()
    }

    fn persist_free_list(&self) -> CoreResult<()> {
        // writing the list may itself consume free chunks
        for _ in 0..FLUSH_PASSES {
            let encoded = NodeValue::blob(self.memory.free_list().encode()).encode();
            match self.root_slot(FREE_LIST_SLOT)?.ptr {
                Some(ptr) => {
                    let mut io = self.io(ptr)?;
                    if io.read_all()? == encoded {
                        return io.close();
                    }
                    io.set_pos(0)?;
                    io.write_all(&encoded)?;
                    io.set_size(encoded.len() as u64)?;
                    io.close()?;
                }
                None => {
                    if self.memory.free_count() == 0 {
                        return Ok(());
                    }
                    let ticket = AllocateTicket::bytes(encoded.len() as u64).with_data(encoded);
                    let chunk = self.alloc(&ticket)?;
                    self.set_root_slot(FREE_LIST_SLOT, Reference::to(chunk.ptr()))?;
                }
            }
        }
        tracing::warn!("free list did not settle while flushing");
        Ok(())
    }

    fn load_free_list(&self) -> CoreResult<()> {
        let Some(ptr) = self.root_slot(FREE_LIST_SLOT)?.ptr else {
            return Ok(());
        };
        let value = self.read_value(ptr)?;
        let stored = FreeList::decode(&value.payload)?;
        let list: FreeList = stored.iter().filter(|p| self.looks_free(*p)).collect();
        if list.len() != stored.len() {
            tracing::warn!(
                dropped = stored.len() - list.len(),
                "ignoring stale free list entries"
            );
        }
        self.memory.replace_free_list(list);
        Ok(())
    }

    fn looks_free(&self, ptr: ChunkPointer) -> bool {
        if ptr.get() == FIRST_CHUNK {
            return false;
        }
        self.chunk(ptr).is_ok_and(|chunk| {
            let header = chunk.header();
            header.size == 0 && header.next.is_none() && header.next_size == NumberSize::Void
        })
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("size", &self.store.size().ok())
            .field("config", &self.config)
            .field("memory", &self.memory)
            .field("unmanaged", &self.unmanaged)
            .finish_non_exhaustive()
    }
}

/// Iterator over the tiled chunks of a store; see
/// [`Cluster::physical_chunks`].
#[derive(Debug)]
pub struct PhysicalChunks<'a> {
    cluster: &'a Cluster,
    at: u64,
    done: bool,
}

impl Iterator for PhysicalChunks<'_> {
    type Item = CoreResult<Arc<Chunk>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = (|| {
            let size = self.cluster.store.size()?;
            if self.at >= size {
                return Ok(None);
            }
            let chunk = self.cluster.chunk(ChunkPointer::new(self.at)?)?;
            Ok(Some(chunk))
        })();
        match step {
            Ok(Some(chunk)) => {
                self.at = chunk.end();
                Some(Ok(chunk))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePolicy;

    #[test]
    fn fresh_store_layout() {
        let cluster = Cluster::in_memory().unwrap();
        let data = cluster.store().read_at(0, 8).unwrap();
        assert_eq!(data, MAGIC);

        let root = cluster.root_chunk().unwrap();
        assert_eq!(root.ptr().get(), FIRST_CHUNK);
        assert_eq!(root.end(), cluster.store().size().unwrap());
        assert_eq!(cluster.root_reference().unwrap(), Reference::NULL);
    }

    #[test]
    fn create_rejects_non_empty_store() {
        let store = InMemoryBackend::with_data(vec![1, 2, 3]);
        assert!(matches!(
            Cluster::create(store, Config::default()),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn open_rejects_bad_magic() {
        let store = InMemoryBackend::with_data(b"NOTCHUNKDB-AND-MORE".to_vec());
        assert!(matches!(
            Cluster::open(store, Config::default()),
            Err(CoreError::MalformedFile { .. })
        ));
    }

    #[test]
    fn pointer_errors() {
        let cluster = Cluster::in_memory().unwrap();
        let size = cluster.store().size().unwrap();
        let outside = ChunkPointer::new(size + 10).unwrap();
        assert!(matches!(
            cluster.chunk(outside),
            Err(CoreError::PointerOutsideFile { .. })
        ));
        assert!(matches!(
            cluster.chunk(ChunkPointer::new(3).unwrap()),
            Err(CoreError::MalformedPointer { .. })
        ));
    }

    #[test]
    fn cache_returns_one_view_per_address() {
        let cluster = Cluster::in_memory_with_config(
            Config::new().cache_policy(CachePolicy::Strong),
        )
        .unwrap();
        let chunk = cluster.alloc(&AllocateTicket::bytes(16)).unwrap();
        let again = cluster.chunk(chunk.ptr()).unwrap();
        assert!(Arc::ptr_eq(&chunk, &again));
    }

    #[test]
    fn debug_validation_detects_cache_divergence() {
        let cluster =
            Cluster::in_memory_with_config(Config::new().debug_validation(true)).unwrap();
        let chunk = cluster.alloc(&AllocateTicket::bytes(16)).unwrap();
        // clobber the size byte behind the cache's back
        cluster.store().write_at(chunk.ptr().add(2), &[9]).unwrap();
        assert!(matches!(
            cluster.chunk(chunk.ptr()),
            Err(CoreError::CacheOutOfSync { .. })
        ));
    }

    #[test]
    fn physical_chunks_tile_the_store() {
        let cluster = Cluster::in_memory().unwrap();
        for bytes in [3, 40, 7] {
            cluster.alloc(&AllocateTicket::bytes(bytes)).unwrap();
        }
        let chunks: Vec<_> = cluster
            .physical_chunks()
            .collect::<CoreResult<_>>()
            .unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].ptr().get(), FIRST_CHUNK);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end(), pair[1].ptr().get());
        }
        assert_eq!(
            cluster.last_chunk().unwrap().unwrap().end(),
            cluster.store().size().unwrap()
        );
    }

    #[test]
    fn values_round_trip() {
        let cluster = Cluster::in_memory().unwrap();
        let leaf = cluster.write_value(&NodeValue::blob(b"payload".to_vec())).unwrap();
        let node = NodeValue::node(vec![Reference::to(leaf)], b"meta".to_vec());
        let ptr = cluster.write_value(&node).unwrap();

        assert_eq!(cluster.read_value(ptr).unwrap(), node);
        assert_eq!(cluster.value_kind(ptr).unwrap(), ValueKind::Node);
        assert_eq!(cluster.value_kind(leaf).unwrap(), ValueKind::Blob);
    }

    #[test]
    fn resolve_address_follows_links() {
        let cluster = Cluster::in_memory().unwrap();
        let head = cluster.alloc(&AllocateTicket::bytes(4)).unwrap();
        cluster.alloc(&AllocateTicket::bytes(4)).unwrap();
        let mut io = cluster.io(head.ptr()).unwrap();
        io.write_all(&[1; 10]).unwrap();
        io.close().unwrap();

        assert_eq!(
            cluster.resolve_address(head.ptr(), 2).unwrap(),
            head.data_start() + 2
        );
        let second = head.next(&cluster).unwrap().unwrap();
        assert_eq!(
            cluster.resolve_address(head.ptr(), 5).unwrap(),
            second.data_start() + 1
        );
    }

    #[test]
    fn free_list_survives_reopen() {
        let store = Arc::new(InMemoryBackend::new());
        let cluster = Cluster::create(Arc::clone(&store), Config::default()).unwrap();
        let a = cluster.alloc(&AllocateTicket::bytes(20)).unwrap();
        cluster.alloc(&AllocateTicket::bytes(20)).unwrap();
        cluster.memory().free(&cluster, &[Arc::clone(&a)]).unwrap();
        cluster.flush().unwrap();
        let expected = cluster.memory().free_list();
        drop(cluster);

        let reopened = Cluster::open(store, Config::default()).unwrap();
        assert_eq!(reopened.memory().free_list(), expected);
        assert!(reopened.memory().is_free(a.ptr()));
    }
}
