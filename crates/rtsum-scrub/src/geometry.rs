//! Realtime geometry derivation and validation.
//!
//! Every size in the summary's shape is a function of the realtime block
//! count and the block format. The validator recomputes them and compares
//! against what the superblock and the summary inode claim, before any scan
//! runs.

use rtsum_error::{Result, RtError};
use rtsum_types::highbit64;
use serde::Serialize;
use tracing::debug;

use crate::config::{RtSummaryConfig, RtSuperblock};
use crate::finding::{CorruptionFinding, CorruptionKind, Structure};

/// Derived realtime geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Geometry {
    /// Realtime device size in realtime blocks (input).
    pub rblocks: u64,
    /// Number of whole realtime extents on the device.
    pub rextents: u64,
    /// Bitmap file length in filesystem blocks.
    pub bitmap_blocks: u64,
    /// Number of size orders tracked by the summary.
    pub summary_levels: u32,
    /// Summary file length in filesystem blocks.
    pub summary_blocks: u64,
}

impl Geometry {
    /// Derive the geometry for a device of `rblocks` realtime blocks.
    ///
    /// A zero-sized realtime device has an all-zero geometry.
    pub fn compute(config: &RtSummaryConfig, rblocks: u64) -> Result<Self> {
        config.validate()?;
        if rblocks == 0 {
            return Ok(Self::default());
        }

        let rextents = rblocks / u64::from(config.rextsize);
        let bitmap_blocks =
            rtsum_bitmap::bitmap_blockcount(config.format, config.block_size, rextents);
        let summary_levels = highbit64(rextents).map_or(1, |bit| bit + 1);
        let block_words = u64::from(config.block_words());
        let summary_words = bitmap_blocks
            .checked_mul(u64::from(summary_levels))
            .ok_or_else(|| {
                RtError::InvalidGeometry(format!(
                    "summary of {bitmap_blocks} bitmap blocks x {summary_levels} levels overflows"
                ))
            })?;

        let geometry = Self {
            rblocks,
            rextents,
            bitmap_blocks,
            summary_levels,
            summary_blocks: summary_words.div_ceil(block_words),
        };
        debug!(
            rblocks,
            rextents,
            bitmap_blocks,
            summary_levels,
            summary_blocks = geometry.summary_blocks,
            "rtsummary geometry"
        );
        Ok(geometry)
    }

    /// Number of summary words the geometry addresses.
    ///
    /// Offsets `order * bitmap_blocks + bitmap_block` for every in-range
    /// extent fall below this bound.
    #[must_use]
    pub fn summary_words(&self) -> u64 {
        self.bitmap_blocks
            .saturating_mul(u64::from(self.summary_levels))
    }

    /// Compare this geometry with the persisted metadata.
    ///
    /// Checks run in a fixed order and stop at the first failure. A summary
    /// file larger than `summary_blocks` is accepted: growing the realtime
    /// volume extends the summary before the superblock's extent count is
    /// updated.
    #[must_use]
    pub fn validate(
        &self,
        config: &RtSummaryConfig,
        persisted: &RtSuperblock,
        summary_size: u64,
    ) -> Option<CorruptionFinding> {
        if persisted.rextents != self.rextents {
            return Some(CorruptionFinding::new(
                Structure::Bitmap,
                CorruptionKind::ExtentCount,
                format!(
                    "persisted rextents={}, computed {}",
                    persisted.rextents, self.rextents
                ),
            ));
        }
        if persisted.rbmblocks != self.bitmap_blocks {
            return Some(CorruptionFinding::new(
                Structure::Bitmap,
                CorruptionKind::BitmapBlockCount,
                format!(
                    "persisted rbmblocks={}, computed {}",
                    persisted.rbmblocks, self.bitmap_blocks
                ),
            ));
        }
        if persisted.rsumlevels != self.summary_levels {
            return Some(CorruptionFinding::new(
                Structure::Summary,
                CorruptionKind::SummaryLevels,
                format!(
                    "persisted rsumlevels={}, computed {}",
                    persisted.rsumlevels, self.summary_levels
                ),
            ));
        }
        if persisted.rsumblocks != self.summary_blocks {
            return Some(CorruptionFinding::new(
                Structure::Summary,
                CorruptionKind::SummaryBlockCount,
                format!(
                    "persisted rsumblocks={}, computed {}",
                    persisted.rsumblocks, self.summary_blocks
                ),
            ));
        }
        if !config.block_size.is_aligned(summary_size) {
            return Some(CorruptionFinding::new(
                Structure::Summary,
                CorruptionKind::MisalignedSize,
                format!(
                    "size {summary_size} is not a multiple of block size {}",
                    config.block_size.get()
                ),
            ));
        }
        let needed = config.block_size.blocks_to_bytes(self.summary_blocks);
        if needed.is_none_or(|needed| summary_size < needed) {
            return Some(CorruptionFinding::new(
                Structure::Summary,
                CorruptionKind::SummaryTooSmall,
                format!(
                    "size {summary_size} cannot hold {} summary blocks",
                    self.summary_blocks
                ),
            ));
        }
        None
    }

    /// The persisted values a consistent superblock would carry.
    #[must_use]
    pub fn to_superblock(&self) -> RtSuperblock {
        RtSuperblock {
            rblocks: self.rblocks,
            rextents: self.rextents,
            rbmblocks: self.bitmap_blocks,
            rsumlevels: self.summary_levels,
            rsumblocks: self.summary_blocks,
        }
    }
}
