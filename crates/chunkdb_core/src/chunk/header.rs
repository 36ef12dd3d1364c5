//! Binary chunk header codec.
//!
//! ```text
//! | flags (1) | capacity (body) | size (body) | next (next) |
//! ```
//!
//! `flags` holds the body width index in bits 0-2 and the next width index
//! in bits 3-5. Bits 6-7 are reserved and must be zero. A next value of 0
//! means the chunk has no successor; a next width of `Void` means the chunk
//! can never be linked.

use crate::error::{CoreError, CoreResult};
use crate::number_size::NumberSize;
use crate::pointer::ChunkPointer;

const BODY_MASK: u8 = 0b0000_0111;
const NEXT_SHIFT: u8 = 3;
const RESERVED_MASK: u8 = 0b1100_0000;

/// Decoded chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Width of the `capacity` and `size` fields.
    pub body_size: NumberSize,
    /// Width of the `next` field.
    pub next_size: NumberSize,
    /// Usable data bytes.
    pub capacity: u64,
    /// Bytes holding meaningful data.
    pub size: u64,
    /// Successor in the chain.
    pub next: Option<ChunkPointer>,
}

impl ChunkHeader {
    /// Largest possible encoded header.
    pub const MAX_SIZE: usize = 1 + 8 + 8 + 8;

    /// Smallest body width used for live chunks.
    pub const MIN_BODY: NumberSize = NumberSize::Byte;

    /// Encoded header length for the given widths.
    #[must_use]
    pub const fn size_for(body_size: NumberSize, next_size: NumberSize) -> u64 {
        (1 + 2 * body_size.bytes() + next_size.bytes()) as u64
    }

    /// Header for a brand-new, empty chunk.
    #[must_use]
    pub fn fresh(capacity: u64, next_size: NumberSize, next: Option<ChunkPointer>) -> Self {
        Self {
            body_size: NumberSize::by_value(capacity).max(Self::MIN_BODY),
            next_size,
            capacity,
            size: 0,
            next,
        }
    }

    /// Header whose capacity exactly fills `footprint` bytes, using the
    /// narrowest body width that fits.
    ///
    /// Returns `None` if the footprint cannot hold such a header.
    #[must_use]
    pub fn filling(
        footprint: u64,
        next_size: NumberSize,
        next: Option<ChunkPointer>,
    ) -> Option<Self> {
        NumberSize::ALL
            .into_iter()
            .filter(|body| *body >= Self::MIN_BODY)
            .find_map(|body| {
                let header = Self::size_for(body, next_size);
                let capacity = footprint.checked_sub(header)?;
                body.can_fit(capacity).then_some(Self {
                    body_size: body,
                    next_size,
                    capacity,
                    size: 0,
                    next,
                })
            })
    }

    /// Header of a shredded, free chunk covering `footprint` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedFile`] if `footprint` is too small to
    /// hold any header.
    pub fn free(footprint: u64) -> CoreResult<Self> {
        Self::filling(footprint, NumberSize::Void, None).ok_or_else(|| {
            CoreError::malformed_file(format!("{footprint} bytes cannot hold a free chunk"))
        })
    }

    /// Encoded header length.
    #[must_use]
    pub const fn header_size(&self) -> u64 {
        Self::size_for(self.body_size, self.next_size)
    }

    /// Header plus capacity.
    #[must_use]
    pub const fn footprint(&self) -> u64 {
        self.header_size() + self.capacity
    }

    /// Encodes the header.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OutOfBitDepth`] if a value does not fit its width.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.header_size() as usize);
        out.push(self.body_size.index() | (self.next_size.index() << NEXT_SHIFT));
        self.body_size.write(&mut out, self.capacity)?;
        self.body_size.write(&mut out, self.size)?;
        self.next_size
            .write(&mut out, ChunkPointer::to_raw(self.next))?;
        Ok(out)
    }

    /// Decodes the header of the chunk at `ptr` from `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedPointer`] if the bytes do not describe
    /// a valid header.
    pub fn decode(ptr: ChunkPointer, bytes: &[u8]) -> CoreResult<Self> {
        let flags = *bytes
            .first()
            .ok_or_else(|| CoreError::malformed_pointer(ptr, "empty header"))?;
        if flags & RESERVED_MASK != 0 {
            return Err(CoreError::malformed_pointer(
                ptr,
                format!("reserved flag bits set: {flags:#04x}"),
            ));
        }
        let body_size = NumberSize::from_index(flags & BODY_MASK)
            .ok_or_else(|| CoreError::malformed_pointer(ptr, "bad body width"))?;
        let next_size = NumberSize::from_index(flags >> NEXT_SHIFT)
            .ok_or_else(|| CoreError::malformed_pointer(ptr, "bad next width"))?;

        let truncated = || CoreError::malformed_pointer(ptr, "truncated header");
        let mut at = 1;
        let capacity = body_size.read(&bytes[at..]).ok_or_else(truncated)?;
        at += body_size.bytes();
        let size = body_size.read(&bytes[at..]).ok_or_else(truncated)?;
        at += body_size.bytes();
        let next = next_size.read(&bytes[at..]).ok_or_else(truncated)?;

        if size > capacity {
            return Err(CoreError::malformed_pointer(
                ptr,
                format!("size {size} exceeds capacity {capacity}"),
            ));
        }
        let next = ChunkPointer::from_raw(next);
        if next == Some(ptr) {
            return Err(CoreError::malformed_pointer(ptr, "chunk links to itself"));
        }

        Ok(Self {
            body_size,
            next_size,
            capacity,
            size,
            next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(v: u64) -> ChunkPointer {
        ChunkPointer::new(v).unwrap()
    }

    #[test]
    fn fresh_header_layout() {
        let header = ChunkHeader::fresh(10, NumberSize::Short, None);
        assert_eq!(header.body_size, NumberSize::Byte);
        assert_eq!(header.header_size(), 1 + 2 + 2);
        assert_eq!(header.footprint(), 15);

        let bytes = header.encode().unwrap();
        assert_eq!(bytes, vec![0x01 | (0x02 << 3), 10, 0, 0, 0]);
        assert_eq!(ChunkHeader::decode(ptr(8), &bytes).unwrap(), header);
    }

    #[test]
    fn header_with_next_pointer() {
        let mut header = ChunkHeader::fresh(300, NumberSize::Int, Some(ptr(70_000)));
        header.size = 299;
        assert_eq!(header.body_size, NumberSize::Short);
        let decoded = ChunkHeader::decode(ptr(8), &header.encode().unwrap()).unwrap();
        assert_eq!(decoded.next, Some(ptr(70_000)));
        assert_eq!(decoded.size, 299);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(ChunkHeader::decode(ptr(8), &[]).is_err());
        assert!(ChunkHeader::decode(ptr(8), &[0xC1, 1, 1]).is_err());
        // size larger than capacity
        assert!(ChunkHeader::decode(ptr(8), &[0x01, 4, 9]).is_err());
        // truncated body
        assert!(ChunkHeader::decode(ptr(8), &[0x03, 4]).is_err());
    }

    #[test]
    fn free_header_fills_footprint() {
        let header = ChunkHeader::free(60).unwrap();
        assert_eq!(header.next_size, NumberSize::Void);
        assert_eq!(header.footprint(), 60);
        assert_eq!(header.size, 0);

        let big = ChunkHeader::free(10_000).unwrap();
        assert_eq!(big.body_size, NumberSize::Short);
        assert_eq!(big.footprint(), 10_000);

        assert!(ChunkHeader::free(2).is_err());
    }

    #[test]
    fn filling_respects_next_width() {
        let header = ChunkHeader::filling(20, NumberSize::Short, None).unwrap();
        assert_eq!(header.capacity, 20 - 5);
    }
}
