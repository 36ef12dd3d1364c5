//! Chunk pointers and slot references.

use crate::error::{CoreError, CoreResult};
use std::fmt;
use std::num::NonZeroU64;

/// Absolute byte address of a chunk header inside the store.
///
/// Zero is reserved for "no pointer" and can never be constructed; absent
/// pointers are modelled as `Option<ChunkPointer>`, which has the same size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkPointer(NonZeroU64);

impl ChunkPointer {
    /// Creates a pointer from a non-zero address.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidPointer`] for zero.
    pub fn new(value: u64) -> CoreResult<Self> {
        NonZeroU64::new(value)
            .map(Self)
            .ok_or(CoreError::InvalidPointer { value })
    }

    /// Creates a pointer from a signed value, rejecting non-positive input.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidPointer`] for zero or negative values.
    pub fn from_signed(value: i64) -> CoreResult<Self> {
        if value <= 0 {
            return Err(CoreError::InvalidPointer {
                value: value as u64,
            });
        }
        Self::new(value as u64)
    }

    /// Decodes a stored raw value, where zero means "no pointer".
    #[must_use]
    pub fn from_raw(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(Self)
    }

    /// Encodes an optional pointer as a raw value.
    #[must_use]
    pub fn to_raw(ptr: Option<Self>) -> u64 {
        ptr.map_or(0, Self::get)
    }

    /// Returns the raw address.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Returns the address `offset` bytes after this pointer.
    #[must_use]
    pub fn add(self, offset: u64) -> u64 {
        self.get() + offset
    }
}

impl fmt::Display for ChunkPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "*{}", self.0)
    }
}

impl From<ChunkPointer> for u64 {
    fn from(ptr: ChunkPointer) -> Self {
        ptr.get()
    }
}

/// A reference stored in a slot: a chunk pointer plus a byte offset into
/// the chain it heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Reference {
    /// Target chain head, or `None` for a null reference.
    pub ptr: Option<ChunkPointer>,
    /// Offset into the target chain's data.
    pub offset: u64,
}

impl Reference {
    /// Encoded size of a reference slot.
    pub const ENCODED_SIZE: usize = 16;

    /// A null reference.
    pub const NULL: Self = Self {
        ptr: None,
        offset: 0,
    };

    /// Creates a reference to the start of a chain.
    #[must_use]
    pub const fn to(ptr: ChunkPointer) -> Self {
        Self {
            ptr: Some(ptr),
            offset: 0,
        }
    }

    /// Creates a reference with an explicit offset.
    #[must_use]
    pub const fn with_offset(ptr: ChunkPointer, offset: u64) -> Self {
        Self {
            ptr: Some(ptr),
            offset,
        }
    }

    /// Returns true when the reference points nowhere.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    /// Encodes the reference as `ptr u64 LE | offset u64 LE`.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut out = [0u8; Self::ENCODED_SIZE];
        out[..8].copy_from_slice(&ChunkPointer::to_raw(self.ptr).to_le_bytes());
        out[8..].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    /// Decodes a reference from at least [`Reference::ENCODED_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedFile`] if `bytes` is too short.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() < Self::ENCODED_SIZE {
            return Err(CoreError::malformed_file("truncated reference slot"));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        let ptr = ChunkPointer::from_raw(u64::from_le_bytes(raw));
        raw.copy_from_slice(&bytes[8..16]);
        Ok(Self {
            ptr,
            offset: u64::from_le_bytes(raw),
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ptr {
            Some(ptr) if self.offset == 0 => write!(f, "{ptr}"),
            Some(ptr) => write!(f, "{ptr}+{}", self.offset),
            None => f.write_str("null"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_pointer_is_invalid() {
        assert!(matches!(
            ChunkPointer::new(0),
            Err(CoreError::InvalidPointer { value: 0 })
        ));
        assert!(ChunkPointer::from_signed(-4).is_err());
        assert!(ChunkPointer::from_raw(0).is_none());
    }

    #[test]
    fn pointers_order_by_value() {
        let a = ChunkPointer::new(8).unwrap();
        let b = ChunkPointer::new(200).unwrap();
        assert!(a < b);
        assert_eq!(ChunkPointer::to_raw(Some(b)), 200);
        assert_eq!(ChunkPointer::to_raw(None), 0);
    }

    #[test]
    fn reference_encoding() {
        let r = Reference::with_offset(ChunkPointer::new(77).unwrap(), 3);
        assert_eq!(Reference::decode(&r.encode()).unwrap(), r);
        assert_eq!(Reference::decode(&[0u8; 16]).unwrap(), Reference::NULL);
        assert!(Reference::decode(&[1, 2, 3]).is_err());
    }
}
