//! Corruption findings.

use serde::Serialize;
use std::fmt;

/// Which metadata file a finding blames.
///
/// Findings are attributed so that reporting and any later repair pass aim
/// at the right inode: a summary that disagrees with a malformed bitmap is
/// the bitmap's fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Structure {
    Bitmap,
    Summary,
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bitmap => write!(f, "rtbitmap"),
            Self::Summary => write!(f, "rtsummary"),
        }
    }
}

/// Category of corruption detected during a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionKind {
    /// Persisted extent count differs from the one derived from the volume size.
    ExtentCount,
    /// Persisted bitmap block count differs from the derived one.
    BitmapBlockCount,
    /// Persisted summary level count differs from the derived one.
    SummaryLevels,
    /// Persisted summary block count differs from the derived one.
    SummaryBlockCount,
    /// Summary file size is not a whole number of blocks.
    MisalignedSize,
    /// Summary file is too small to hold the summary.
    SummaryTooSmall,
    /// Summary fork failed the structural fork check.
    ForkStructure,
    /// Summary file has a hole, unwritten extent, or zero-length mapping.
    BadMapping,
    /// Summary file has a mapping crossing or beyond end of file.
    MappingBeyondEof,
    /// A summary block failed its read verifier.
    UnreadableBlock,
    /// Summary block contents differ from the recomputed summary.
    ContentMismatch,
    /// The bitmap could not be scanned into a summary (bad size,
    /// out-of-range extent, counter overflow).
    BitmapCrossReference,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ExtentCount => "extent_count",
            Self::BitmapBlockCount => "bitmap_block_count",
            Self::SummaryLevels => "summary_levels",
            Self::SummaryBlockCount => "summary_block_count",
            Self::MisalignedSize => "misaligned_size",
            Self::SummaryTooSmall => "summary_too_small",
            Self::ForkStructure => "fork_structure",
            Self::BadMapping => "bad_mapping",
            Self::MappingBeyondEof => "mapping_beyond_eof",
            Self::UnreadableBlock => "unreadable_block",
            Self::ContentMismatch => "content_mismatch",
            Self::BitmapCrossReference => "bitmap_xref",
        };
        f.write_str(name)
    }
}

/// A single corruption finding. A check produces at most one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptionFinding {
    /// File blamed for the inconsistency.
    pub structure: Structure,
    /// Category of corruption.
    pub kind: CorruptionKind,
    /// File block (or realtime extent, for bitmap records) where the
    /// problem was seen, when it has a location.
    pub block: Option<u64>,
    /// Human-readable detail (e.g. "persisted rextents=10, computed 12").
    pub detail: String,
}

impl CorruptionFinding {
    pub fn new(structure: Structure, kind: CorruptionKind, detail: impl Into<String>) -> Self {
        Self {
            structure,
            kind,
            block: None,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn at_block(mut self, block: u64) -> Self {
        self.block = Some(block);
        self
    }
}

impl fmt::Display for CorruptionFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.block {
            Some(block) => write!(
                f,
                "{} block {} [{}]: {}",
                self.structure, block, self.kind, self.detail
            ),
            None => write!(f, "{} [{}]: {}", self.structure, self.kind, self.detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let finding = CorruptionFinding::new(
            Structure::Summary,
            CorruptionKind::ContentMismatch,
            "word 7 differs",
        )
        .at_block(3);
        let s = finding.to_string();
        assert_eq!(s, "rtsummary block 3 [content_mismatch]: word 7 differs");

        let unplaced = CorruptionFinding::new(
            Structure::Bitmap,
            CorruptionKind::ExtentCount,
            "persisted rextents=9, computed 8",
        );
        assert_eq!(
            unplaced.to_string(),
            "rtbitmap [extent_count]: persisted rextents=9, computed 8"
        );
    }
}
