//! Byte store trait definition.

use crate::error::StorageResult;

/// Block size used by the default [`ByteStore::fill_zero`] implementation.
const ZERO_BLOCK: usize = 4096;

/// A low-level, random-access byte container for chunkdb.
///
/// Byte stores are **opaque**. They provide positional reads and writes,
/// size queries and resizing. chunkdb owns all interpretation of the bytes -
/// stores do not understand chunk headers, chains or free lists.
///
/// # Invariants
///
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `write_at` past the current end grows the store; any gap reads as zero
/// - `set_size` grows with zero bytes or truncates
/// - Stores must be `Send + Sync`; every method takes `&self`
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait ByteStore: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` at `offset`, growing the store if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Returns the current size of the store in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Grows (with zero bytes) or truncates the store to `new_size`.
    ///
    /// # Errors
    ///
    /// Returns an error if the resize fails.
    fn set_size(&self, new_size: u64) -> StorageResult<()>;

    /// Flushes all pending writes to the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&self) -> StorageResult<()>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// This is a stronger guarantee than `flush` - it ensures that
    /// file metadata (size, timestamps) is also durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&self) -> StorageResult<()>;

    /// Overwrites `len` bytes at `offset` with zeros.
    ///
    /// Used to shred freed regions.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn fill_zero(&self, offset: u64, len: u64) -> StorageResult<()> {
        let block = [0u8; ZERO_BLOCK];
        let mut written = 0u64;
        while written < len {
            let n = (len - written).min(ZERO_BLOCK as u64) as usize;
            self.write_at(offset + written, &block[..n])?;
            written += n as u64;
        }
        Ok(())
    }

    /// Appends data to the end of the store.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&self, data: &[u8]) -> StorageResult<u64> {
        let offset = self.size()?;
        self.write_at(offset, data)?;
        Ok(offset)
    }
}

impl<T: ByteStore + ?Sized> ByteStore for std::sync::Arc<T> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        (**self).read_at(offset, len)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        (**self).write_at(offset, data)
    }

    fn size(&self) -> StorageResult<u64> {
        (**self).size()
    }

    fn set_size(&self, new_size: u64) -> StorageResult<()> {
        (**self).set_size(new_size)
    }

    fn flush(&self) -> StorageResult<()> {
        (**self).flush()
    }

    fn sync(&self) -> StorageResult<()> {
        (**self).sync()
    }

    fn fill_zero(&self, offset: u64, len: u64) -> StorageResult<()> {
        (**self).fill_zero(offset, len)
    }
}
