//! Variable-width little-endian number fields.

use crate::error::{CoreError, CoreResult};

/// Byte width of an encoded number field.
///
/// Widths are stored as a 3-bit index inside chunk header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NumberSize {
    /// No field; can only hold zero.
    Void,
    /// 1 byte.
    Byte,
    /// 2 bytes.
    Short,
    /// 3 bytes.
    SMedium,
    /// 4 bytes.
    Int,
    /// 5 bytes.
    LMedium,
    /// 6 bytes.
    Big,
    /// 8 bytes.
    Long,
}

impl NumberSize {
    /// All widths, ordered by index.
    pub const ALL: [Self; 8] = [
        Self::Void,
        Self::Byte,
        Self::Short,
        Self::SMedium,
        Self::Int,
        Self::LMedium,
        Self::Big,
        Self::Long,
    ];

    /// Number of bytes occupied by the field.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Void => 0,
            Self::Byte => 1,
            Self::Short => 2,
            Self::SMedium => 3,
            Self::Int => 4,
            Self::LMedium => 5,
            Self::Big => 6,
            Self::Long => 8,
        }
    }

    /// Largest value the field can hold.
    #[must_use]
    pub const fn max_value(self) -> u64 {
        match self {
            Self::Void => 0,
            Self::Long => u64::MAX,
            other => (1u64 << (other.bytes() * 8)) - 1,
        }
    }

    /// 3-bit index used in header flags.
    #[must_use]
    pub const fn index(self) -> u8 {
        match self {
            Self::Void => 0,
            Self::Byte => 1,
            Self::Short => 2,
            Self::SMedium => 3,
            Self::Int => 4,
            Self::LMedium => 5,
            Self::Big => 6,
            Self::Long => 7,
        }
    }

    /// Width for a 3-bit index.
    #[must_use]
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// Smallest width able to hold `value`.
    #[must_use]
    pub fn by_value(value: u64) -> Self {
        Self::ALL
            .into_iter()
            .find(|size| value <= size.max_value())
            .unwrap_or(Self::Long)
    }

    /// The wider of the two widths.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        if other > self {
            other
        } else {
            self
        }
    }

    /// Returns true if `value` fits.
    #[must_use]
    pub const fn can_fit(self, value: u64) -> bool {
        value <= self.max_value()
    }

    /// Appends `value` to `out` using this width.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OutOfBitDepth`] if the value does not fit.
    pub fn write(self, out: &mut Vec<u8>, value: u64) -> CoreResult<()> {
        if !self.can_fit(value) {
            return Err(CoreError::OutOfBitDepth {
                value,
                width: self.bytes(),
            });
        }
        out.extend_from_slice(&value.to_le_bytes()[..self.bytes()]);
        Ok(())
    }

    /// Reads a value of this width from the start of `bytes`.
    ///
    /// Returns `None` if `bytes` is too short.
    #[must_use]
    pub fn read(self, bytes: &[u8]) -> Option<u64> {
        let width = self.bytes();
        let field = bytes.get(..width)?;
        let mut raw = [0u8; 8];
        raw[..width].copy_from_slice(field);
        Some(u64::from_le_bytes(raw))
    }
}
