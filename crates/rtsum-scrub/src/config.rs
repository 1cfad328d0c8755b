//! Check configuration and persisted realtime metadata.

use rtsum_error::{Result, RtError};
use rtsum_types::{BlockSize, RtFormat, WORD_SIZE};
use serde::{Deserialize, Serialize};

use crate::sumword::CounterEncoding;

/// What to do when a summary counter would exceed `u32::MAX`.
///
/// `Wrap` reproduces plain integer arithmetic and therefore matches the
/// values existing filesystems have written. `Corrupt` treats the overflow
/// as bitmap corruption: a valid bitmap block cannot hold enough free runs
/// to fill a 32-bit counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    #[default]
    Wrap,
    Corrupt,
}

/// Filesystem-wide parameters for one check.
///
/// Built once and passed by reference to every stage; nothing in the
/// checker reads ambient global state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtSummaryConfig {
    /// Filesystem block size; the unit of bitmap and summary file blocks.
    pub block_size: BlockSize,
    /// Realtime extent size in realtime blocks (one bitmap bit each).
    pub rextsize: u32,
    /// Bitmap/summary block format, which also selects the counter encoding.
    pub format: RtFormat,
    /// Counter overflow handling.
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl RtSummaryConfig {
    pub fn new(block_size: BlockSize, rextsize: u32, format: RtFormat) -> Result<Self> {
        let config = Self {
            block_size,
            rextsize,
            format,
            overflow: OverflowPolicy::default(),
        };
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Reject parameters that cannot describe a realtime volume.
    pub fn validate(&self) -> Result<()> {
        if self.rextsize == 0 {
            return Err(RtError::InvalidGeometry("rextsize=0".to_owned()));
        }
        Ok(())
    }

    /// Summary words held by one summary block.
    #[must_use]
    pub fn block_words(&self) -> u32 {
        self.format.block_words(self.block_size)
    }

    /// Bytes of word payload in one summary block.
    #[must_use]
    pub fn block_payload_len(&self) -> usize {
        self.block_words() as usize * WORD_SIZE
    }

    #[must_use]
    pub fn encoding(&self) -> CounterEncoding {
        CounterEncoding::for_format(self.format)
    }
}

/// Persisted realtime geometry as recorded in the superblock and derived at
/// mount time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RtSuperblock {
    /// Realtime device size in realtime blocks.
    pub rblocks: u64,
    /// Number of realtime extents.
    pub rextents: u64,
    /// Size of the bitmap file in filesystem blocks.
    pub rbmblocks: u64,
    /// Number of size orders in the summary.
    pub rsumlevels: u32,
    /// Size of the summary in filesystem blocks.
    pub rsumblocks: u64,
}
