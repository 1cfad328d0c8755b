//! Top-level check sequence.
//!
//! ```text
//! Geometry -> ForkStructure -> Recompute -> Compare -> Done
//! ```
//!
//! Each stage either passes, records a corruption finding and ends the
//! check successfully, or fails with an error that ends the check
//! unsuccessfully. Corruption found while recomputing is blamed on the
//! bitmap, since the summary cannot be rebuilt from a malformed bitmap.

use rtsum_bitmap::FreeExtentSource;
use rtsum_error::{Result, RtError};
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

use crate::compare::{SummaryFile, compare_summary};
use crate::compute::compute_summary;
use crate::config::{RtSummaryConfig, RtSuperblock};
use crate::finding::{CorruptionFinding, CorruptionKind, Structure};
use crate::geometry::Geometry;
use crate::scratch::ScratchIndex;
use crate::terminate::{NeverTerminate, Terminate, checkpoint};

// ── Outcome types ───────────────────────────────────────────────────────────

/// Stage of the check sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStage {
    Geometry,
    ForkStructure,
    Recompute,
    Compare,
    Done,
}

impl fmt::Display for CheckStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Geometry => write!(f, "geometry"),
            Self::ForkStructure => write!(f, "fork_structure"),
            Self::Recompute => write!(f, "recompute"),
            Self::Compare => write!(f, "compare"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Overall outcome of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Summary and geometry are consistent with the bitmap.
    Ok,
    /// The summary file is inconsistent.
    CorruptSummary,
    /// The bitmap (or the extent count derived from it) is inconsistent.
    CorruptBitmap,
    /// The check could not finish. Cancellation, I/O failures and
    /// allocation failures all end here; inspect [`CheckResult::error`] to
    /// tell a cancelled check from a failed one.
    Terminated,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::CorruptSummary => write!(f, "corrupt_summary"),
            Self::CorruptBitmap => write!(f, "corrupt_bitmap"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// A completed check.
#[derive(Debug)]
pub struct CheckReport {
    /// Geometry derived from the realtime device size.
    pub geometry: Geometry,
    /// Stage the check ended in; `Done` when every stage passed.
    pub stage: CheckStage,
    /// Free extent records counted by the recompute stage.
    pub records_scanned: u64,
    /// Summary blocks compared.
    pub blocks_compared: u64,
    finding: Option<CorruptionFinding>,
    scratch: Option<ScratchIndex>,
}

impl CheckReport {
    fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            stage: CheckStage::Geometry,
            records_scanned: 0,
            blocks_compared: 0,
            finding: None,
            scratch: None,
        }
    }

    fn corrupt(mut self, finding: CorruptionFinding) -> Self {
        warn!(
            stage = %self.stage,
            structure = %finding.structure,
            kind = %finding.kind,
            block = ?finding.block,
            detail = %finding.detail,
            "rtsummary check found corruption"
        );
        self.finding = Some(finding);
        self
    }

    #[must_use]
    pub fn finding(&self) -> Option<&CorruptionFinding> {
        self.finding.as_ref()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.finding.is_none()
    }

    #[must_use]
    pub fn verdict(&self) -> Verdict {
        match self.finding.as_ref().map(|finding| finding.structure) {
            None => Verdict::Ok,
            Some(Structure::Summary) => Verdict::CorruptSummary,
            Some(Structure::Bitmap) => Verdict::CorruptBitmap,
        }
    }

    /// The recomputed summary, if the recompute stage completed.
    #[must_use]
    pub fn scratch(&self) -> Option<&ScratchIndex> {
        self.scratch.as_ref()
    }

    /// Hand the recomputed summary to a repair pass.
    #[must_use]
    pub fn into_scratch(self) -> Option<ScratchIndex> {
        self.scratch
    }
}

/// Flattened outcome: a verdict plus the error that ended the check, if
/// any. `Terminated` is reported exactly when `error` is set.
#[derive(Debug)]
pub struct CheckResult {
    pub verdict: Verdict,
    pub error: Option<RtError>,
}

impl From<Result<CheckReport>> for CheckResult {
    fn from(result: Result<CheckReport>) -> Self {
        match result {
            Ok(report) => Self {
                verdict: report.verdict(),
                error: None,
            },
            Err(err) => Self {
                verdict: Verdict::Terminated,
                error: Some(err),
            },
        }
    }
}

// ── Fork structure ──────────────────────────────────────────────────────────

/// Structural check of the summary inode's data fork, run before the
/// recompute stage.
pub trait MetadataForkCheck {
    fn check_forks(&self, summary: &dyn SummaryFile) -> Result<Option<CorruptionFinding>>;
}

/// Fork check that accepts every fork.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptForks;

impl MetadataForkCheck for AcceptForks {
    fn check_forks(&self, _summary: &dyn SummaryFile) -> Result<Option<CorruptionFinding>> {
        Ok(None)
    }
}

// ── Checker ─────────────────────────────────────────────────────────────────

/// Realtime summary checker.
///
/// The caller must hold the bitmap, the summary and the superblock geometry
/// stable (no allocation, no growfs) until [`check`](Self::check) returns.
/// The checker only reads them.
pub struct RtSummaryChecker<'a> {
    config: RtSummaryConfig,
    superblock: RtSuperblock,
    bitmap: &'a dyn FreeExtentSource,
    summary: &'a dyn SummaryFile,
    forks: &'a dyn MetadataForkCheck,
    terminate: &'a dyn Terminate,
}

impl<'a> RtSummaryChecker<'a> {
    pub fn new(
        config: RtSummaryConfig,
        superblock: RtSuperblock,
        bitmap: &'a dyn FreeExtentSource,
        summary: &'a dyn SummaryFile,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            superblock,
            bitmap,
            summary,
            forks: &AcceptForks,
            terminate: &NeverTerminate,
        })
    }

    #[must_use]
    pub fn with_fork_check(mut self, forks: &'a dyn MetadataForkCheck) -> Self {
        self.forks = forks;
        self
    }

    #[must_use]
    pub fn with_terminate(mut self, terminate: &'a dyn Terminate) -> Self {
        self.terminate = terminate;
        self
    }

    /// Run every stage, stopping at the first corruption or error.
    ///
    /// Corruption is reported in the returned [`CheckReport`]. I/O errors,
    /// allocation failures and cancellation are returned as errors, and no
    /// partial verdict is kept.
    pub fn check(&self) -> Result<CheckReport> {
        let geometry = Geometry::compute(&self.config, self.superblock.rblocks)?;
        let mut report = CheckReport::new(geometry);
        let summary_size = self.summary.disk_size();

        debug!(stage = %report.stage, summary_size, "rtsummary check");
        if let Some(finding) = geometry.validate(&self.config, &self.superblock, summary_size) {
            return Ok(report.corrupt(finding));
        }

        report.stage = CheckStage::ForkStructure;
        checkpoint(self.terminate)?;
        if let Some(finding) = self.forks.check_forks(self.summary)? {
            return Ok(report.corrupt(finding));
        }

        report.stage = CheckStage::Recompute;
        let block_words = u64::from(self.config.block_words());
        let eof_blocks = self.config.block_size.bytes_to_blocks(summary_size);
        let words = geometry
            .summary_blocks
            .max(eof_blocks)
            .checked_mul(block_words)
            .ok_or_else(|| {
                RtError::InvalidGeometry(format!("summary of {eof_blocks} blocks overflows"))
            })?;
        let mut scratch = ScratchIndex::new(words, self.config.encoding())?;
        debug!(stage = %report.stage, words, "rtsummary check");
        match compute_summary(
            &self.config,
            &geometry,
            self.bitmap,
            self.terminate,
            &mut scratch,
        ) {
            Ok(stats) => report.records_scanned = stats.records,
            Err(RtError::Corruption { block, detail }) => {
                let finding = CorruptionFinding::new(
                    Structure::Bitmap,
                    CorruptionKind::BitmapCrossReference,
                    detail,
                )
                .at_block(block);
                return Ok(report.corrupt(finding));
            }
            Err(err) => return Err(err),
        }

        report.stage = CheckStage::Compare;
        debug!(stage = %report.stage, eof_blocks, "rtsummary check");
        let outcome = compare_summary(&self.config, &scratch, self.summary, self.terminate)?;
        report.blocks_compared = outcome.blocks_compared;
        report.scratch = Some(scratch);
        if let Some(finding) = outcome.finding {
            return Ok(report.corrupt(finding));
        }

        report.stage = CheckStage::Done;
        debug!(
            records = report.records_scanned,
            blocks = report.blocks_compared,
            "rtsummary clean"
        );
        Ok(report)
    }

    /// [`check`](Self::check), flattened into a [`CheckResult`].
    #[must_use]
    pub fn run(&self) -> CheckResult {
        self.check().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemSummaryFile;
    use asupersync::Cx;
    use rtsum_bitmap::{FreeExtentRecord, RtBitmap};
    use rtsum_types::{BlockSize, RtFormat, SummaryOffset};

    struct RejectForks;

    impl MetadataForkCheck for RejectForks {
        fn check_forks(
            &self,
            _summary: &dyn SummaryFile,
        ) -> Result<Option<CorruptionFinding>> {
            Ok(Some(CorruptionFinding::new(
                Structure::Summary,
                CorruptionKind::ForkStructure,
                "bad bmbt",
            )))
        }
    }

    fn fixture(runs: &[FreeExtentRecord]) -> (RtSummaryConfig, RtSuperblock, RtBitmap) {
        let cfg = RtSummaryConfig::new(BlockSize::new(512).expect("bs"), 2, RtFormat::Legacy)
            .expect("config");
        let geometry = Geometry::compute(&cfg, 20_000).expect("geometry");
        let bitmap = RtBitmap::from_free_runs(cfg.format, cfg.block_size, geometry.rextents, runs)
            .expect("bitmap");
        (cfg, geometry.to_superblock(), bitmap)
    }

    #[test]
    fn clean_check_keeps_scratch() {
        let (cfg, sb, bitmap) = fixture(&[FreeExtentRecord::new(100, 16)]);
        // 10000 extents, 3 bitmap blocks, 14 levels: 42 words in one block.
        assert_eq!(sb.rsumblocks, 1);
        let summary = MemSummaryFile::new(cfg, 512);
        // order 4, bitmap block 0
        summary.set_word(SummaryOffset(12), 1).expect("set");

        let checker = RtSummaryChecker::new(cfg, sb, &bitmap, &summary).expect("checker");
        let report = checker.check().expect("check");
        assert_eq!(report.verdict(), Verdict::Ok);
        assert_eq!(report.stage, CheckStage::Done);
        assert_eq!(report.records_scanned, 1);
        assert_eq!(report.blocks_compared, 1);

        let scratch = report.into_scratch().expect("scratch");
        assert_eq!(
            scratch.copy_out(SummaryOffset(12), 1).expect("copy"),
            1_u32.to_ne_bytes()
        );
    }

    #[test]
    fn fork_check_runs_before_recompute() {
        let (cfg, sb, bitmap) = fixture(&[]);
        let summary = MemSummaryFile::new(cfg, 512);
        let checker = RtSummaryChecker::new(cfg, sb, &bitmap, &summary)
            .expect("checker")
            .with_fork_check(&RejectForks);
        let report = checker.check().expect("check");
        assert_eq!(report.verdict(), Verdict::CorruptSummary);
        assert_eq!(report.stage, CheckStage::ForkStructure);
        assert!(report.scratch().is_none());
        assert_eq!(summary.read_count(), 0);
    }

    #[test]
    fn recompute_corruption_blames_bitmap() {
        let (cfg, sb, _) = fixture(&[]);
        // One block short.
        let bitmap = RtBitmap::with_blocks(cfg.format, cfg.block_size, sb.rextents, 2)
            .expect("bitmap");
        let summary = MemSummaryFile::new(cfg, 512);
        let result = RtSummaryChecker::new(cfg, sb, &bitmap, &summary)
            .expect("checker")
            .run();
        assert_eq!(result.verdict, Verdict::CorruptBitmap);
        assert!(result.error.is_none());
    }

    #[test]
    fn cancelled_cx_stops_before_reading_summary() {
        let (cfg, sb, bitmap) = fixture(&[FreeExtentRecord::new(0, 8)]);
        let summary = MemSummaryFile::new(cfg, 512);
        let cx = Cx::for_testing();
        cx.set_cancel_requested(true);
        let result = RtSummaryChecker::new(cfg, sb, &bitmap, &summary)
            .expect("checker")
            .with_terminate(&cx)
            .run();
        assert_eq!(result.verdict, Verdict::Terminated);
        assert!(matches!(result.error, Some(RtError::Cancelled)));
        assert_eq!(summary.read_count(), 0);
    }

    #[test]
    fn errors_become_terminated() {
        let result = CheckResult::from(Err(RtError::Cancelled));
        assert_eq!(result.verdict, Verdict::Terminated);
        assert!(matches!(result.error, Some(RtError::Cancelled)));
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let (mut cfg, sb, bitmap) = fixture(&[]);
        let summary = MemSummaryFile::new(cfg, 512);
        cfg.rextsize = 0;
        assert!(RtSummaryChecker::new(cfg, sb, &bitmap, &summary).is_err());
    }
}
