//! # chunkdb Core
//!
//! Chunk allocator and compaction engine for chunkdb.
//!
//! This crate provides:
//! - Chunk headers, chains and the pointer-keyed chunk cache
//! - A memory manager with pluggable allocation and growth strategies
//! - Random-access I/O over chains
//! - Defragmentation: chain merging, free space coalescing, store packing
//!
//! ## Example
//!
//! ```rust
//! use chunkdb_core::{AllocateTicket, Cluster};
//!
//! let cluster = Cluster::in_memory().unwrap();
//! let chunk = cluster.alloc(&AllocateTicket::bytes(10)).unwrap();
//! assert_eq!(chunk.capacity(), 10);
//!
//! let mut io = cluster.io(chunk.ptr()).unwrap();
//! io.write_all(b"hello, chunks").unwrap();
//! io.close().unwrap();
//! assert_eq!(cluster.io(chunk.ptr()).unwrap().read_all().unwrap(), b"hello, chunks");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod chunk;
mod cluster;
mod config;
mod cursor;
mod defragment;
mod error;
mod free_list;
mod memory;
mod move_buffer;
mod number_size;
mod pointer;
mod stats;
mod ticket;
mod unmanaged;
mod value;
mod walker;

pub use cache::CachePolicy;
pub use chunk::{Chunk, ChunkHeader};
pub use cluster::{Cluster, PhysicalChunks, FIRST_CHUNK, MAGIC};
pub use config::Config;
pub use cursor::ChainCursor;
pub use defragment::{
    DefragmentManager, DefragmentReport, FreeChunkScanPolicy, OptimizeOutcome, PackOutcome,
};
pub use error::{CoreError, CoreResult};
pub use free_list::FreeList;
pub use memory::{
    default_allocate_strategies, default_grow_strategies, AbsorbFollowingFree, AllocPlan,
    AllocRequest, AllocateStrategy, AppendLinked, AppendToEnd, DefragmentGuard, ExpandFreeTail,
    GrowAtEnd, GrowStrategy, MemoryManager, ReuseFree, ReusedFree, MIN_FREE_FOOTPRINT,
};
pub use move_buffer::MoveBuffer;
pub use number_size::NumberSize;
pub use pointer::{ChunkPointer, Reference};
pub use stats::{ClusterStats, StatsSnapshot};
pub use ticket::{AllocateTicket, Approval, DataPopulator};
pub use unmanaged::{UnmanagedInstance, UnmanagedRegistry};
pub use value::{NodeValue, ValueKind};
pub use walker::{GraphWalker, NodeGraphWalker, SlotVisit, TargetKind, WalkControl};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
