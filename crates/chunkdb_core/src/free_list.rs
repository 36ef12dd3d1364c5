//! Sorted list of reclaimable chunk pointers.
//!
//! ## Persisted Format
//!
//! ```text
//! | count (8) | ptr (8) * count |
//! ```
//!
//! All integers are little-endian.

use crate::error::{CoreError, CoreResult};
use crate::pointer::ChunkPointer;

/// Ascending, duplicate-free sequence of free chunk pointers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeList {
    ptrs: Vec<ChunkPointer>,
}

impl FreeList {
    /// Creates an empty free list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of free chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ptrs.len()
    }

    /// Returns true if no chunk is free.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ptrs.is_empty()
    }

    /// Returns true if `ptr` is listed.
    #[must_use]
    pub fn contains(&self, ptr: ChunkPointer) -> bool {
        self.ptrs.binary_search(&ptr).is_ok()
    }

    /// Adds a pointer, keeping the order. Returns false if already present.
    pub fn add(&mut self, ptr: ChunkPointer) -> bool {
        match self.ptrs.binary_search(&ptr) {
            Ok(_) => false,
            Err(at) => {
                self.ptrs.insert(at, ptr);
                true
            }
        }
    }

    /// Adds a batch of pointers.
    pub fn add_all(&mut self, ptrs: impl IntoIterator<Item = ChunkPointer>) {
        self.ptrs.extend(ptrs);
        self.ptrs.sort_unstable();
        self.ptrs.dedup();
    }

    /// Removes a pointer. Returns false if it was not listed.
    pub fn remove(&mut self, ptr: ChunkPointer) -> bool {
        match self.ptrs.binary_search(&ptr) {
            Ok(at) => {
                self.ptrs.remove(at);
                true
            }
            Err(_) => false,
        }
    }

    /// Lowest free pointer.
    #[must_use]
    pub fn first(&self) -> Option<ChunkPointer> {
        self.ptrs.first().copied()
    }

    /// Highest free pointer.
    #[must_use]
    pub fn last(&self) -> Option<ChunkPointer> {
        self.ptrs.last().copied()
    }

    /// Iterates in ascending order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = ChunkPointer> + '_ {
        self.ptrs.iter().copied()
    }

    /// Copy of the pointers in ascending order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<ChunkPointer> {
        self.ptrs.clone()
    }

    /// Keeps only the pointers for which `keep` returns true.
    pub fn retain(&mut self, keep: impl FnMut(&ChunkPointer) -> bool) {
        self.ptrs.retain(keep);
    }

    /// Releases unused backing capacity.
    pub fn trim(&mut self) {
        self.ptrs.shrink_to_fit();
    }

    /// Serializes the list.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.ptrs.len() * 8);
        out.extend_from_slice(&(self.ptrs.len() as u64).to_le_bytes());
        for ptr in &self.ptrs {
            out.extend_from_slice(&ptr.get().to_le_bytes());
        }
        out
    }

    /// Deserializes a list. An empty input decodes to an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedFile`] if the bytes are truncated or
    /// contain a null pointer.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.is_empty() {
            return Ok(Self::new());
        }
        let word = |at: usize| -> CoreResult<u64> {
            let raw = bytes
                .get(at..at + 8)
                .ok_or_else(|| CoreError::malformed_file("truncated free list"))?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            Ok(u64::from_le_bytes(buf))
        };

        let count = word(0)? as usize;
        let mut list = Self::new();
        let mut ptrs = Vec::with_capacity(count.min(bytes.len() / 8));
        for i in 0..count {
            let raw = word(8 + i * 8)?;
            let ptr = ChunkPointer::from_raw(raw)
                .ok_or_else(|| CoreError::malformed_file("null pointer in free list"))?;
            ptrs.push(ptr);
        }
        list.add_all(ptrs);
        Ok(list)
    }
}

impl FromIterator<ChunkPointer> for FreeList {
    fn from_iter<T: IntoIterator<Item = ChunkPointer>>(iter: T) -> Self {
        let mut list = Self::new();
        list.add_all(iter);
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(v: u64) -> ChunkPointer {
        ChunkPointer::new(v).unwrap()
    }

    #[test]
    fn keeps_ascending_order_without_duplicates() {
        let mut list = FreeList::new();
        assert!(list.add(ptr(50)));
        assert!(list.add(ptr(10)));
        assert!(!list.add(ptr(50)));
        list.add_all([ptr(30), ptr(10), ptr(90)]);

        assert_eq!(list.to_vec(), vec![ptr(10), ptr(30), ptr(50), ptr(90)]);
        assert_eq!(list.first(), Some(ptr(10)));
        assert_eq!(list.last(), Some(ptr(90)));
    }

    #[test]
    fn remove_and_contains() {
        let mut list: FreeList = [ptr(10), ptr(20)].into_iter().collect();
        assert!(list.contains(ptr(20)));
        assert!(list.remove(ptr(20)));
        assert!(!list.remove(ptr(20)));
        assert!(!list.contains(ptr(20)));
    }

    #[test]
    fn persisted_form() {
        let list: FreeList = [ptr(300), ptr(12)].into_iter().collect();
        let bytes = list.encode();
        assert_eq!(bytes.len(), 24);
        assert_eq!(FreeList::decode(&bytes).unwrap(), list);
        assert!(FreeList::decode(&[]).unwrap().is_empty());
        assert!(FreeList::decode(&bytes[..20]).is_err());
    }
}
