//! JSON description of a realtime volume to check.
//!
//! ```json
//! {
//!   "config": { "block_size": 4096, "rextsize": 1, "format": "legacy" },
//!   "superblock": { "rblocks": 100000, "rextents": 100000, "rbmblocks": 4,
//!                   "rsumlevels": 17, "rsumblocks": 1 },
//!   "bitmap": { "free": [ { "start": 0, "count": 4 } ] },
//!   "summary": { "size": 4096, "words": [ [8, 1] ] }
//! }
//! ```
//!
//! `bitmap.blocks` overrides the bitmap file length; `summary.mappings` and
//! `summary.faults` replace the default fully-written fork and inject read
//! failures.

use anyhow::{Context, Result};
use rtsum_bitmap::{FreeExtentRecord, RtBitmap};
use rtsum_scrub::mem::{MemSummaryFile, ReadFault};
use rtsum_scrub::{Mapping, MappingState, RtSummaryConfig, RtSuperblock};
use rtsum_types::{FileBlock, SummaryOffset};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fixture {
    pub config: RtSummaryConfig,
    pub superblock: RtSuperblock,
    pub bitmap: BitmapSpec,
    pub summary: SummarySpec,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BitmapSpec {
    #[serde(default)]
    pub free: Vec<FreeExtentRecord>,
    pub blocks: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SummarySpec {
    pub size: u64,
    /// `[word_offset, value]` pairs; every other word is zero.
    #[serde(default)]
    pub words: Vec<(u64, u32)>,
    pub mappings: Option<Vec<MappingSpec>>,
    #[serde(default)]
    pub faults: Vec<FaultSpec>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateSpec {
    Hole,
    Unwritten,
    Written,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingSpec {
    pub state: StateSpec,
    pub start: u64,
    pub length: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FaultSpec {
    pub block: u64,
    /// `true` for a verifier failure, `false` for an I/O error.
    #[serde(default)]
    pub corrupt: bool,
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fixture {}", path.display()))?;
        let fixture: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse fixture {}", path.display()))?;
        fixture.config.validate()?;
        Ok(fixture)
    }

    /// Bitmap image with exactly the listed runs free.
    pub fn build_bitmap(&self) -> Result<RtBitmap> {
        let cfg = &self.config;
        let rextents = self
            .superblock
            .rblocks
            .checked_div(u64::from(cfg.rextsize))
            .context("rextsize must be non-zero")?;
        let mut bitmap = match self.bitmap.blocks {
            Some(blocks) => RtBitmap::with_blocks(cfg.format, cfg.block_size, rextents, blocks)?,
            None => RtBitmap::new(cfg.format, cfg.block_size, rextents)?,
        };
        for run in &self.bitmap.free {
            bitmap
                .mark_free(run.start, run.count)
                .with_context(|| format!("free run {}+{} does not fit", run.start, run.count))?;
        }
        Ok(bitmap)
    }

    pub fn build_summary(&self) -> Result<MemSummaryFile> {
        let summary = MemSummaryFile::new(self.config, self.summary.size);
        for &(offset, value) in &self.summary.words {
            summary
                .set_word(SummaryOffset(offset), value)
                .with_context(|| format!("summary word {offset} is outside the file"))?;
        }
        if let Some(mappings) = &self.summary.mappings {
            summary.set_mappings(mappings.iter().map(MappingSpec::to_mapping).collect());
        }
        for fault in &self.summary.faults {
            let kind = if fault.corrupt {
                ReadFault::Corrupt
            } else {
                ReadFault::Io
            };
            summary.inject_read_fault(FileBlock(fault.block), kind);
        }
        Ok(summary)
    }
}

impl MappingSpec {
    fn to_mapping(&self) -> Mapping {
        let state = match self.state {
            StateSpec::Hole => MappingState::Hole,
            StateSpec::Unwritten => MappingState::Unwritten,
            StateSpec::Written => MappingState::Written,
        };
        Mapping {
            state,
            start: FileBlock(self.start),
            length: self.length,
        }
    }
}
