//! # chunkdb Storage
//!
//! Byte store trait and implementations for chunkdb.
//!
//! This crate provides the lowest-level storage abstraction for chunkdb.
//! Byte stores are **opaque, random-access byte containers** - they do not
//! interpret the data they hold. Chunk headers, chains and free lists are
//! owned entirely by `chunkdb_core`.
//!
//! ## Design Principles
//!
//! - Stores are growable and truncatable (`set_size`)
//! - Writes may land anywhere, including past the current end
//! - Must be `Send + Sync`; all methods take `&self` and lock internally
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use chunkdb_storage::{ByteStore, InMemoryBackend};
//!
//! let store = InMemoryBackend::new();
//! store.write_at(4, b"hello").unwrap();
//! assert_eq!(store.size().unwrap(), 9);
//! assert_eq!(store.read_at(4, 5).unwrap(), b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::ByteStore;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
