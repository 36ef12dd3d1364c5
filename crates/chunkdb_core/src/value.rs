//! Node values: the minimal structured encoding stored in chains.
//!
//! ## Format
//!
//! ```text
//! Blob:             | tag=0 (1) | payload |
//! Node / Unmanaged: | tag (1) | count (4) | (ptr (8), offset (8)) * count | payload |
//! ```
//!
//! All integers are little-endian. An empty chain decodes as an empty blob.

use crate::error::{CoreError, CoreResult};
use crate::pointer::Reference;

const TAG_BLOB: u8 = 0;
const TAG_NODE: u8 = 1;
const TAG_UNMANAGED: u8 = 2;
const SLOTS_START: u64 = 1 + 4;

/// Shape of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Opaque bytes without references.
    Blob,
    /// Walkable value with reference slots.
    Node,
    /// Self-tracking allocation; relocations are reported to its registered
    /// instance.
    Unmanaged,
}

impl ValueKind {
    /// Kind encoded by the first byte of a value, if valid.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_BLOB => Some(Self::Blob),
            TAG_NODE => Some(Self::Node),
            TAG_UNMANAGED => Some(Self::Unmanaged),
            _ => None,
        }
    }

    /// Tag byte for this kind.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Blob => TAG_BLOB,
            Self::Node => TAG_NODE,
            Self::Unmanaged => TAG_UNMANAGED,
        }
    }
}

/// A decoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeValue {
    /// Value shape.
    pub kind: ValueKind,
    /// Reference slots, always empty for blobs.
    pub refs: Vec<Reference>,
    /// Trailing opaque bytes.
    pub payload: Vec<u8>,
}

impl NodeValue {
    /// Creates a blob.
    #[must_use]
    pub fn blob(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ValueKind::Blob,
            refs: Vec::new(),
            payload: payload.into(),
        }
    }

    /// Creates a node with reference slots.
    #[must_use]
    pub fn node(refs: Vec<Reference>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ValueKind::Node,
            refs,
            payload: payload.into(),
        }
    }

    /// Creates an unmanaged value.
    #[must_use]
    pub fn unmanaged(refs: Vec<Reference>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ValueKind::Unmanaged,
            refs,
            payload: payload.into(),
        }
    }

    /// Byte offset of reference slot `index` inside an encoded node.
    #[must_use]
    pub const fn slot_offset(index: usize) -> u64 {
        SLOTS_START + (index * Reference::ENCODED_SIZE) as u64
    }

    /// Encodes the value.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.kind.tag());
        if self.kind != ValueKind::Blob {
            out.extend_from_slice(&(self.refs.len() as u32).to_le_bytes());
            for reference in &self.refs {
                out.extend_from_slice(&reference.encode());
            }
        }
        out.extend_from_slice(&self.payload);
        out
    }

    /// Length of [`NodeValue::encode`]'s output.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self.kind {
            ValueKind::Blob => 1 + self.payload.len(),
            _ => {
                SLOTS_START as usize + self.refs.len() * Reference::ENCODED_SIZE + self.payload.len()
            }
        }
    }

    /// Decodes a value.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedFile`] on an unknown tag or truncated
    /// slots.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let Some((&tag, rest)) = bytes.split_first() else {
            return Ok(Self::blob(Vec::new()));
        };
        let kind = ValueKind::from_tag(tag)
            .ok_or_else(|| CoreError::malformed_file(format!("unknown value tag {tag}")))?;
        if kind == ValueKind::Blob {
            return Ok(Self::blob(rest));
        }

        let count_bytes: [u8; 4] = rest
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| CoreError::malformed_file("truncated slot count"))?;
        let count = u32::from_le_bytes(count_bytes) as usize;
        let slots_len = count
            .checked_mul(Reference::ENCODED_SIZE)
            .filter(|len| 4 + len <= rest.len())
            .ok_or_else(|| CoreError::malformed_file(format!("{count} slots do not fit value")))?;

        let slots = &rest[4..4 + slots_len];
        let refs = slots
            .chunks_exact(Reference::ENCODED_SIZE)
            .map(Reference::decode)
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Self {
            kind,
            refs,
            payload: rest[4 + slots_len..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer::ChunkPointer;

    #[test]
    fn node_layout() {
        let target = ChunkPointer::new(40).unwrap();
        let value = NodeValue::node(vec![Reference::NULL, Reference::to(target)], b"xy".to_vec());
        let bytes = value.encode();

        assert_eq!(bytes.len(), value.encoded_len());
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &2u32.to_le_bytes());
        let slot = NodeValue::slot_offset(1) as usize;
        assert_eq!(&bytes[slot..slot + 8], &40u64.to_le_bytes());
        assert_eq!(NodeValue::decode(&bytes).unwrap(), value);
    }

    #[test]
    fn empty_bytes_are_an_empty_blob() {
        let value = NodeValue::decode(&[]).unwrap();
        assert_eq!(value.kind, ValueKind::Blob);
        assert!(value.payload.is_empty());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(NodeValue::decode(&[9]).is_err());
        // three slots announced, none present
        assert!(NodeValue::decode(&[1, 3, 0, 0, 0]).is_err());
        assert!(NodeValue::decode(&[2, 0]).is_err());
    }
}
