//! Error types for chunkdb core.

use crate::pointer::ChunkPointer;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in chunkdb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] chunkdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A zero or otherwise unusable pointer value was used.
    #[error("invalid pointer: {value}")]
    InvalidPointer {
        /// The rejected raw value.
        value: u64,
    },

    /// A pointer was dereferenced at or past the end of the store.
    #[error("pointer {ptr} is outside of the store (size {size})")]
    PointerOutsideFile {
        /// The dereferenced pointer.
        ptr: ChunkPointer,
        /// Store size at the time of the dereference.
        size: u64,
    },

    /// The bytes at a pointer do not parse as a chunk header.
    #[error("malformed chunk at {ptr}: {message}")]
    MalformedPointer {
        /// The dereferenced pointer.
        ptr: ChunkPointer,
        /// Description of the problem.
        message: String,
    },

    /// The store as a whole is inconsistent.
    #[error("malformed store: {message}")]
    MalformedFile {
        /// Description of the problem.
        message: String,
    },

    /// A cached chunk view disagrees with the bytes in the store.
    #[error("cached chunk {ptr} is out of sync with the store")]
    CacheOutOfSync {
        /// The chunk whose cache entry diverged.
        ptr: ChunkPointer,
    },

    /// A pinned field width cannot represent a value.
    #[error("value {value} does not fit in {width} byte field")]
    OutOfBitDepth {
        /// The value that did not fit.
        value: u64,
        /// Width of the field in bytes.
        width: usize,
    },

    /// No allocation strategy could service a request.
    #[error("no allocation method could provide {bytes} bytes")]
    UnknownAllocationMethod {
        /// The requested byte count.
        bytes: u64,
    },

    /// A version transform requested by a collaborator is not supported.
    #[error("incompatible version transform: {message}")]
    IncompatibleVersionTransform {
        /// Description of the transform.
        message: String,
    },

    /// A required field was absent while populating data.
    #[error("required field absent: {field}")]
    MissingField {
        /// Name of the field.
        field: String,
    },

    /// A chain does not have enough capacity for the requested size.
    #[error("chain at {ptr} has capacity {capacity}, {requested} bytes requested")]
    OutOfSpace {
        /// Head of the chain.
        ptr: ChunkPointer,
        /// Total chain capacity.
        capacity: u64,
        /// Requested size.
        requested: u64,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a malformed pointer error.
    pub fn malformed_pointer(ptr: ChunkPointer, message: impl Into<String>) -> Self {
        Self::MalformedPointer {
            ptr,
            message: message.into(),
        }
    }

    /// Creates a malformed store error.
    pub fn malformed_file(message: impl Into<String>) -> Self {
        Self::MalformedFile {
            message: message.into(),
        }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an incompatible version transform error.
    pub fn incompatible_version_transform(message: impl Into<String>) -> Self {
        Self::IncompatibleVersionTransform {
            message: message.into(),
        }
    }

    /// Returns the wrapped core error when this is an I/O error produced by
    /// [`AllocateTicket::submit`](crate::AllocateTicket::submit).
    #[must_use]
    pub fn allocation_cause(&self) -> Option<&CoreError> {
        match self {
            Self::Io(err) => err.get_ref().and_then(|inner| inner.downcast_ref::<CoreError>()),
            _ => None,
        }
    }
}
