//! In-memory byte store.

use crate::backend::ByteStore;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

/// A byte store held in a growable buffer.
///
/// Backs ephemeral clusters and most tests. Reads share a lock; writes and
/// resizes take it exclusively, so one store can serve several threads.
///
/// ```rust
/// use chunkdb_storage::{ByteStore, InMemoryBackend};
///
/// let store = InMemoryBackend::new();
/// store.write_at(8, b"chunk").unwrap();
/// assert_eq!(store.size().unwrap(), 13);
/// assert_eq!(store.read_at(0, 8).unwrap(), vec![0; 8]);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
}

impl InMemoryBackend {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store over existing bytes, e.g. a damaged container image.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Copies out the whole container.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl ByteStore for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let offset_usize = offset as usize;
        let end = offset_usize.saturating_add(len);

        if offset > size || end > data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[offset_usize..end].to_vec())
    }

    fn write_at(&self, offset: u64, new_data: &[u8]) -> StorageResult<()> {
        if new_data.is_empty() {
            return Ok(());
        }
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + new_data.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(new_data);
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn set_size(&self, new_size: u64) -> StorageResult<()> {
        self.data.write().resize(new_size as usize, 0);
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn memory_new_is_empty() {
        let store = InMemoryBackend::new();
        assert_eq!(store.size().unwrap(), 0);
        assert!(store.data().is_empty());
    }

    #[test]
    fn memory_append_lands_at_the_end() {
        let store = InMemoryBackend::new();

        assert_eq!(store.append(b"hello").unwrap(), 0);
        assert_eq!(store.append(b" world").unwrap(), 5);
        assert_eq!(store.size().unwrap(), 11);
    }

    #[test]
    fn memory_write_at_overwrites_in_place() {
        let store = InMemoryBackend::with_data(b"hello world".to_vec());
        store.write_at(6, b"WORLD").unwrap();
        assert_eq!(store.data(), b"hello WORLD");
    }

    #[test]
    fn memory_write_past_end_zero_fills_gap() {
        let store = InMemoryBackend::new();
        store.write_at(3, b"ab").unwrap();
        assert_eq!(store.data(), vec![0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn memory_read_at_past_end_fails() {
        let store = InMemoryBackend::with_data(b"hello".to_vec());
        let result = store.read_at(3, 10);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn memory_empty_read() {
        let store = InMemoryBackend::with_data(b"hello".to_vec());
        assert!(store.read_at(2, 0).unwrap().is_empty());
    }

    #[test]
    fn memory_set_size_grows_and_truncates() {
        let store = InMemoryBackend::with_data(b"hello".to_vec());
        store.set_size(8).unwrap();
        assert_eq!(store.read_at(5, 3).unwrap(), vec![0, 0, 0]);

        store.set_size(2).unwrap();
        assert_eq!(store.data(), b"he");
    }

    #[test]
    fn memory_fill_zero() {
        let store = InMemoryBackend::with_data(b"abcdefgh".to_vec());
        store.fill_zero(2, 4).unwrap();
        assert_eq!(store.data(), vec![b'a', b'b', 0, 0, 0, 0, b'g', b'h']);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(u64, Vec<u8>),
        SetSize(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..300, prop::collection::vec(any::<u8>(), 0..64))
                .prop_map(|(at, data)| Op::Write(at, data)),
            (0u64..400).prop_map(Op::SetSize),
        ]
    }

    proptest! {
        #[test]
        fn memory_matches_vec_model(ops in prop::collection::vec(op(), 1..32)) {
            let store = InMemoryBackend::new();
            let mut model: Vec<u8> = Vec::new();
            for op in ops {
                match op {
                    Op::Write(at, data) => {
                        store.write_at(at, &data).unwrap();
                        if data.is_empty() {
                            continue;
                        }
                        let end = at as usize + data.len();
                        if end > model.len() {
                            model.resize(end, 0);
                        }
                        model[at as usize..end].copy_from_slice(&data);
                    }
                    Op::SetSize(size) => {
                        store.set_size(size).unwrap();
                        model.resize(size as usize, 0);
                    }
                }
                prop_assert_eq!(store.size().unwrap(), model.len() as u64);
            }
            prop_assert_eq!(store.data(), model);
        }
    }
}
