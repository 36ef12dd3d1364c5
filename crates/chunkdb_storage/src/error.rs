//! Byte store errors.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for byte store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failures reported by a [`ByteStore`](crate::ByteStore).
#[derive(Debug, Error)]
pub enum StorageError {
    /// The operating system rejected a read, write or resize.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read reached past the current end of the store.
    #[error("read of {len} bytes at {offset} exceeds store size {size}")]
    ReadPastEnd {
        /// First byte requested.
        offset: u64,
        /// Bytes requested.
        len: usize,
        /// Store size at the time of the read.
        size: u64,
    },

    /// Another handle holds the exclusive lock on the store file.
    #[error("store file {} is locked by another handle", path.display())]
    Locked {
        /// The locked file.
        path: PathBuf,
    },
}
