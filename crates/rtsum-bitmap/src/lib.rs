#![forbid(unsafe_code)]
//! Realtime free-space bitmap.
//!
//! The bitmap file holds one bit per realtime extent; a set bit means the
//! extent is free. Each bitmap block carries `block_words` 32-bit words
//! (after the block header, on grouped filesystems), so one block covers
//! `block_words * 32` extents.
//!
//! ## Design
//!
//! 1. **Layout helpers**: how many extents a block covers, how many blocks
//!    a volume needs.
//! 2. **`FreeExtentSource`**: the seam the summary checker consumes, a
//!    lazy, single-pass, ascending sequence of free runs.
//! 3. **`RtBitmap`**: an in-memory bitmap file that implements the seam by
//!    scanning for maximal runs of set bits.

use rtsum_error::{Result, RtError};
use rtsum_types::{BITS_PER_WORD, BlockSize, RtFormat, RtxNumber, WORD_SIZE, u64_to_usize};
use serde::{Deserialize, Serialize};

// ── Layout ──────────────────────────────────────────────────────────────────

/// Realtime extents described by one bitmap block.
#[must_use]
pub fn rtx_per_bitmap_block(format: RtFormat, block_size: BlockSize) -> u64 {
    u64::from(format.block_words(block_size)) * BITS_PER_WORD
}

/// Number of bitmap blocks needed to describe `rextents` extents.
#[must_use]
pub fn bitmap_blockcount(format: RtFormat, block_size: BlockSize, rextents: u64) -> u64 {
    rextents.div_ceil(rtx_per_bitmap_block(format, block_size))
}

/// Bitmap block that holds the bit for `rtx`.
#[must_use]
pub fn rtx_to_bitmap_block(format: RtFormat, block_size: BlockSize, rtx: RtxNumber) -> u64 {
    rtx.0 / rtx_per_bitmap_block(format, block_size)
}

// ── Free extent records ─────────────────────────────────────────────────────

/// One maximal run of free realtime extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FreeExtentRecord {
    /// First free extent of the run.
    pub start: RtxNumber,
    /// Length of the run, in realtime extents.
    pub count: u64,
}

impl FreeExtentRecord {
    #[must_use]
    pub fn new(start: u64, count: u64) -> Self {
        Self {
            start: RtxNumber(start),
            count,
        }
    }
}

/// Lazy free-extent sequence over a bitmap.
pub type FreeExtentIter<'a> = Box<dyn Iterator<Item = Result<FreeExtentRecord>> + 'a>;

/// A realtime bitmap file the summary checker can scan.
///
/// Implementations yield free runs in ascending order of `start`. The
/// sequence is finite and single-pass; a consumer stops early by dropping
/// the iterator. Errors are I/O failures reading the bitmap and end the
/// scan.
pub trait FreeExtentSource {
    /// Size of the bitmap file in bytes, as recorded in its inode.
    fn disk_size(&self) -> u64;

    /// Begin a scan over every free run in the bitmap.
    fn free_extents(&self) -> Result<FreeExtentIter<'_>>;
}

// ── In-memory bitmap ────────────────────────────────────────────────────────

/// In-memory image of a realtime bitmap file.
///
/// Invariant: `data.len()` is a whole number of blocks, and bits for
/// extents at or beyond `rextents` are never reported as free.
#[derive(Debug, Clone)]
pub struct RtBitmap {
    format: RtFormat,
    block_size: BlockSize,
    rextents: u64,
    data: Vec<u8>,
}

impl RtBitmap {
    /// Create a fully-allocated bitmap sized exactly for `rextents`.
    pub fn new(format: RtFormat, block_size: BlockSize, rextents: u64) -> Result<Self> {
        let blocks = bitmap_blockcount(format, block_size, rextents);
        Self::with_blocks(format, block_size, rextents, blocks)
    }

    /// Create a fully-allocated bitmap file of exactly `blocks` blocks.
    ///
    /// The file may be smaller or larger than `rextents` requires; lookups
    /// past the end of the file read as allocated.
    pub fn with_blocks(
        format: RtFormat,
        block_size: BlockSize,
        rextents: u64,
        blocks: u64,
    ) -> Result<Self> {
        let bytes = block_size.blocks_to_bytes(blocks).ok_or_else(|| {
            RtError::InvalidGeometry(format!("bitmap of {blocks} blocks overflows u64"))
        })?;
        let len = u64_to_usize(bytes, "bitmap_bytes")
            .map_err(|e| RtError::InvalidGeometry(e.to_string()))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| RtError::NoMemory { bytes: len })?;
        data.resize(len, 0);
        Ok(Self {
            format,
            block_size,
            rextents,
            data,
        })
    }

    /// Build a bitmap in which exactly the given runs are free.
    pub fn from_free_runs(
        format: RtFormat,
        block_size: BlockSize,
        rextents: u64,
        runs: &[FreeExtentRecord],
    ) -> Result<Self> {
        let mut bitmap = Self::new(format, block_size, rextents)?;
        for run in runs {
            bitmap.mark_free(run.start, run.count)?;
        }
        Ok(bitmap)
    }

    #[must_use]
    pub fn format(&self) -> RtFormat {
        self.format
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn rextents(&self) -> u64 {
        self.rextents
    }

    /// Raw file contents, headers included.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mark `[start, start + count)` free.
    pub fn mark_free(&mut self, start: RtxNumber, count: u64) -> Result<()> {
        self.modify_range(start, count, true)
    }

    /// Mark `[start, start + count)` allocated.
    pub fn mark_used(&mut self, start: RtxNumber, count: u64) -> Result<()> {
        self.modify_range(start, count, false)
    }

    /// Whether extent `rtx` is free.
    #[must_use]
    pub fn is_free(&self, rtx: RtxNumber) -> bool {
        if rtx.0 >= self.rextents {
            return false;
        }
        let bit = rtx.0 % BITS_PER_WORD;
        self.word_at(rtx.0)
            .is_some_and(|word| (word >> bit) & 1 == 1)
    }

    /// Number of free extents in the whole bitmap.
    #[must_use]
    pub fn count_free(&self) -> u64 {
        self.runs().map(|run| run.count).sum()
    }

    /// Iterate maximal free runs in ascending order.
    #[must_use]
    pub fn runs(&self) -> FreeRuns<'_> {
        FreeRuns {
            bitmap: self,
            next: 0,
        }
    }

    fn modify_range(&mut self, start: RtxNumber, count: u64, free: bool) -> Result<()> {
        let end = start
            .checked_add(count)
            .filter(|end| end.0 <= self.rextents)
            .ok_or(RtError::OutOfBounds {
                offset: start.0,
                len: count,
                limit: self.rextents,
            })?;
        for rtx in start.0..end.0 {
            let offset = self.word_offset(rtx).ok_or(RtError::OutOfBounds {
                offset: rtx,
                len: 1,
                limit: self.rextents,
            })?;
            let raw = self.read_raw(offset);
            let mut word = self.format.decode_word(raw);
            let mask = 1_u32 << (rtx % BITS_PER_WORD);
            if free {
                word |= mask;
            } else {
                word &= !mask;
            }
            self.data[offset..offset + WORD_SIZE].copy_from_slice(&self.format.encode_word(word));
        }
        Ok(())
    }

    /// Byte offset in `data` of the word holding `rtx`, if the file is long
    /// enough to contain it.
    fn word_offset(&self, rtx: u64) -> Option<usize> {
        let per_block = rtx_per_bitmap_block(self.format, self.block_size);
        let block = rtx / per_block;
        let word = (rtx % per_block) / BITS_PER_WORD;
        let offset = block
            .checked_mul(u64::from(self.block_size.get()))?
            .checked_add(self.format.header_len() as u64)?
            .checked_add(word * WORD_SIZE as u64)?;
        let offset = usize::try_from(offset).ok()?;
        (offset + WORD_SIZE <= self.data.len()).then_some(offset)
    }

    fn word_at(&self, rtx: u64) -> Option<u32> {
        self.word_offset(rtx)
            .map(|offset| self.format.decode_word(self.read_raw(offset)))
    }

    fn read_raw(&self, offset: usize) -> [u8; WORD_SIZE] {
        let mut raw = [0_u8; WORD_SIZE];
        raw.copy_from_slice(&self.data[offset..offset + WORD_SIZE]);
        raw
    }

    /// First extent at or after `from` whose free state equals `want_free`.
    fn find_next(&self, from: u64, want_free: bool) -> Option<u64> {
        let mut rtx = from;
        while rtx < self.rextents {
            let bit = rtx % BITS_PER_WORD;
            let word = self.word_at(rtx).unwrap_or(0);
            let candidates = (if want_free { word } else { !word }) >> bit;
            if candidates != 0 {
                let found = rtx + u64::from(candidates.trailing_zeros());
                return (found < self.rextents).then_some(found);
            }
            rtx += BITS_PER_WORD - bit;
        }
        None
    }
}

impl FreeExtentSource for RtBitmap {
    fn disk_size(&self) -> u64 {
        self.data.len() as u64
    }

    fn free_extents(&self) -> Result<FreeExtentIter<'_>> {
        Ok(Box::new(self.runs().map(Ok)))
    }
}

/// Iterator over maximal free runs of an [`RtBitmap`].
#[derive(Debug)]
pub struct FreeRuns<'a> {
    bitmap: &'a RtBitmap,
    next: u64,
}

impl Iterator for FreeRuns<'_> {
    type Item = FreeExtentRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.bitmap.find_next(self.next, true)?;
        let end = self
            .bitmap
            .find_next(start, false)
            .unwrap_or(self.bitmap.rextents);
        self.next = end;
        Some(FreeExtentRecord::new(start, end - start))
    }
}
