#![forbid(unsafe_code)]
//! Shared types for the realtime summary checker.
//!
//! Every quantity that crosses a crate boundary is carried in a unit-tagged
//! newtype: realtime extents, realtime blocks, file-relative filesystem
//! blocks and summary word offsets are all `u64` underneath, and mixing them
//! up is the classic way to corrupt a summary computation.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size in bytes of one bitmap or summary word.
pub const WORD_SIZE: usize = 4;

/// `log2(WORD_SIZE)`.
pub const WORD_LOG: u32 = 2;

/// Bits in one bitmap word.
pub const BITS_PER_WORD: u64 = 32;

/// Size of the self-describing header at the start of every bitmap and
/// summary block on grouped-format filesystems.
///
/// Layout: magic (4), crc (4), owner (8), blkno (8), lsn (8), uuid (16).
pub const RTBUF_HEADER_SIZE: usize = 48;

/// Smallest and largest supported filesystem block sizes.
pub const MIN_BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Realtime extent number (allocation-unit index into the bitmap).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RtxNumber(pub u64);

/// Realtime device block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RtBlock(pub u64);

/// Filesystem-block offset inside a metadata file (bitmap or summary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileBlock(pub u64);

/// Word offset into the summary address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SummaryOffset(pub u64);

/// Validated filesystem block size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Mask selecting the byte offset within a block.
    #[must_use]
    pub fn mask(self) -> u64 {
        u64::from(self.0) - 1
    }

    #[must_use]
    pub fn is_aligned(self, bytes: u64) -> bool {
        bytes & self.mask() == 0
    }

    /// Convert a byte length to whole blocks, rounding up.
    #[must_use]
    pub fn bytes_to_blocks(self, bytes: u64) -> u64 {
        bytes.div_ceil(u64::from(self.0))
    }

    /// Convert a block count to bytes, returning `None` on overflow.
    #[must_use]
    pub fn blocks_to_bytes(self, blocks: u64) -> Option<u64> {
        blocks.checked_mul(u64::from(self.0))
    }
}

impl TryFrom<u32> for BlockSize {
    type Error = ParseError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BlockSize> for u32 {
    fn from(value: BlockSize) -> Self {
        value.0
    }
}

/// On-disk format family of the realtime metadata files.
///
/// The format decides two things at once: whether bitmap and summary blocks
/// carry a header, and how the 32-bit words inside them are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtFormat {
    /// Headerless blocks, host-endian words.
    #[default]
    Legacy,
    /// Realtime groups: headered blocks, big-endian words.
    Grouped,
}

impl RtFormat {
    /// Bytes reserved at the start of each bitmap/summary block.
    #[must_use]
    pub fn header_len(self) -> usize {
        match self {
            Self::Legacy => 0,
            Self::Grouped => RTBUF_HEADER_SIZE,
        }
    }

    /// Number of 32-bit payload words in one block of `block_size`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // header is at most 48 bytes
    pub fn block_words(self, block_size: BlockSize) -> u32 {
        // block_size >= 512 > header_len, so this never underflows.
        (block_size.get() - self.header_len() as u32) >> WORD_LOG
    }

    /// Decode one 32-bit word stored in this format.
    #[must_use]
    pub fn decode_word(self, raw: [u8; WORD_SIZE]) -> u32 {
        match self {
            Self::Legacy => u32::from_ne_bytes(raw),
            Self::Grouped => u32::from_be_bytes(raw),
        }
    }

    /// Encode one 32-bit word in this format.
    #[must_use]
    pub fn encode_word(self, value: u32) -> [u8; WORD_SIZE] {
        match self {
            Self::Legacy => value.to_ne_bytes(),
            Self::Grouped => value.to_be_bytes(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Checked arithmetic helpers ──────────────────────────────────────────────

impl RtxNumber {
    /// Add an extent count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// First realtime block of this extent.
    #[must_use]
    pub fn to_rtblock(self, rextsize: u32) -> Option<RtBlock> {
        self.0.checked_mul(u64::from(rextsize)).map(RtBlock)
    }
}

impl SummaryOffset {
    /// Byte offset of this word in the summary address space.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<u64> {
        self.0.checked_mul(WORD_SIZE as u64)
    }
}

/// Index of the most significant set bit, i.e. `floor(log2(value))`.
///
/// Returns `None` for zero, which has no set bit.
#[must_use]
pub fn highbit64(value: u64) -> Option<u32> {
    value.checked_ilog2()
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

impl fmt::Display for RtxNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RtBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FileBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SummaryOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RtFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy"),
            Self::Grouped => write!(f, "grouped"),
        }
    }
}
