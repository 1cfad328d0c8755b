//! Compare the on-disk summary with the recomputed one.
//!
//! The summary file is reached through two collaborators: a fork mapper
//! that describes which file blocks are backed by written extents, and a
//! buffer-cache reader that returns one verified block at a time. The
//! comparator first proves that `[0, eof)` is fully backed by written
//! extents, then compares blocks in ascending order and stops at the first
//! difference.

use rtsum_error::{Result, RtError};
use rtsum_types::{FileBlock, SummaryOffset};
use tracing::{debug, trace, warn};

use crate::config::RtSummaryConfig;
use crate::finding::{CorruptionFinding, CorruptionKind, Structure};
use crate::scratch::ScratchIndex;
use crate::terminate::{Terminate, checkpoint};

// ── Collaborator interfaces ─────────────────────────────────────────────────

/// Allocation state of a file range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingState {
    /// No storage behind the range.
    Hole,
    /// Preallocated storage that has never been written.
    Unwritten,
    /// Storage holding data.
    Written,
}

/// A contiguous run of file blocks sharing one allocation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mapping {
    pub state: MappingState,
    /// First file block of the run.
    pub start: FileBlock,
    /// Length of the run in file blocks.
    pub length: u64,
}

impl Mapping {
    #[must_use]
    pub fn written(start: u64, length: u64) -> Self {
        Self {
            state: MappingState::Written,
            start: FileBlock(start),
            length,
        }
    }

    /// One past the last file block of the run, saturating.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.0.saturating_add(self.length)
    }

    #[must_use]
    pub fn contains(&self, block: FileBlock) -> bool {
        self.start <= block && block.0 < self.end()
    }
}

/// One summary block as returned by the buffer cache.
///
/// Holds the whole block; the comparator only looks at the word payload
/// that follows the block header. Dropping the buffer releases it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryBuf {
    data: Vec<u8>,
    header_len: usize,
}

impl SummaryBuf {
    #[must_use]
    pub fn new(data: Vec<u8>, header_len: usize) -> Self {
        Self { data, header_len }
    }

    /// Summary words following the header. Empty if the block is shorter
    /// than its header.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.data.get(self.header_len..).unwrap_or_default()
    }
}

/// Extent-fork view of the summary file.
pub trait SummaryForkMap {
    /// File size in bytes, as recorded in the inode.
    fn disk_size(&self) -> u64;

    /// Describe the range starting at `offset`, at most `max_len` blocks
    /// long. The returned mapping starts at `offset`.
    fn lookup_mapping(&self, offset: FileBlock, max_len: u64) -> Result<Mapping>;

    /// The mapping containing `offset`, or else the first mapping that
    /// starts after it.
    fn first_mapping_at_or_after(&self, offset: FileBlock) -> Result<Option<Mapping>>;
}

/// Buffer-cache view of the summary file.
pub trait SummaryBlockReader {
    /// Read and verify one block.
    ///
    /// A block that fails verification is reported as
    /// [`RtError::Corruption`]; any other error is an I/O failure.
    fn read_block(&self, block: FileBlock) -> Result<SummaryBuf>;
}

/// A summary file: fork map plus block reader.
pub trait SummaryFile: SummaryForkMap + SummaryBlockReader {}

impl<T: SummaryForkMap + SummaryBlockReader + ?Sized> SummaryFile for T {}

// ── Comparator ──────────────────────────────────────────────────────────────

/// Result of a completed comparison.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompareOutcome {
    /// First inconsistency found, if any.
    pub finding: Option<CorruptionFinding>,
    /// Blocks read from disk and compared.
    pub blocks_compared: u64,
}

/// Compare every block of `summary` with the matching words of `scratch`.
///
/// `scratch` must cover the whole file: at least `eof_blocks *
/// block_words` words, zero past the recomputed summary. The caller keeps
/// the summary file stable for the duration of the call.
pub fn compare_summary(
    config: &RtSummaryConfig,
    scratch: &ScratchIndex,
    summary: &dyn SummaryFile,
    terminate: &dyn Terminate,
) -> Result<CompareOutcome> {
    let eof = config.block_size.bytes_to_blocks(summary.disk_size());

    if let Some(finding) = check_coverage(summary, eof, terminate)? {
        return Ok(CompareOutcome {
            finding: Some(finding),
            blocks_compared: 0,
        });
    }

    let block_words = config.block_words();
    let payload_len = config.block_payload_len();
    let mut computed = vec![0_u8; payload_len];
    let mut outcome = CompareOutcome::default();

    for off in 0..eof {
        checkpoint(terminate)?;
        let block = FileBlock(off);

        let ondisk = match summary.read_block(block) {
            Ok(buf) => buf,
            Err(err) => {
                outcome.finding = Some(process_error(err, block, CorruptionKind::UnreadableBlock)?);
                return Ok(outcome);
            }
        };

        let sumoff = off.checked_mul(u64::from(block_words)).ok_or_else(|| {
            RtError::InvalidGeometry(format!("summary block {off} overflows word offset"))
        })?;
        scratch.copy_into(SummaryOffset(sumoff), &mut computed)?;
        outcome.blocks_compared += 1;

        let payload = ondisk.payload();
        if payload.len() != payload_len {
            outcome.finding = Some(mismatch(
                block,
                CorruptionKind::UnreadableBlock,
                format!("block payload is {} bytes, expected {payload_len}", payload.len()),
            ));
            return Ok(outcome);
        }
        if let Some(word) = first_differing_word(payload, &computed) {
            outcome.finding = Some(mismatch(
                block,
                CorruptionKind::ContentMismatch,
                format!("summary word {} differs from recomputed value", sumoff + word),
            ));
            return Ok(outcome);
        }
        trace!(block = off, "rtsummary block matches");
    }

    debug!(
        blocks = outcome.blocks_compared,
        "rtsummary comparison complete"
    );
    Ok(outcome)
}

/// Prove that `[0, eof)` is backed by written extents and nothing is mapped
/// at or beyond `eof`.
fn check_coverage(
    summary: &dyn SummaryFile,
    eof: u64,
    terminate: &dyn Terminate,
) -> Result<Option<CorruptionFinding>> {
    if let Some(map) = summary.first_mapping_at_or_after(FileBlock(eof))? {
        return Ok(Some(mismatch(
            FileBlock(eof),
            CorruptionKind::MappingBeyondEof,
            format!(
                "mapping {}+{} crosses or lies beyond eof block {eof}",
                map.start.0, map.length
            ),
        )));
    }

    let mut off = 0_u64;
    while off < eof {
        checkpoint(terminate)?;
        let block = FileBlock(off);
        let map = match summary.lookup_mapping(block, eof - off) {
            Ok(map) => map,
            Err(err) => return process_error(err, block, CorruptionKind::BadMapping).map(Some),
        };
        if map.state != MappingState::Written || map.length == 0 || map.start != block {
            return Ok(Some(mismatch(
                block,
                CorruptionKind::BadMapping,
                format!("{:?} mapping {}+{}", map.state, map.start.0, map.length),
            )));
        }
        off = off.saturating_add(map.length);
    }
    Ok(None)
}

/// Turn a verifier failure into a finding; pass every other error through.
fn process_error(
    err: RtError,
    block: FileBlock,
    kind: CorruptionKind,
) -> Result<CorruptionFinding> {
    match err {
        RtError::Corruption { detail, .. } => Ok(mismatch(block, kind, detail)),
        other => Err(other),
    }
}

fn mismatch(block: FileBlock, kind: CorruptionKind, detail: String) -> CorruptionFinding {
    warn!(block = block.0, %kind, detail = %detail, "rtsummary corrupt");
    CorruptionFinding::new(Structure::Summary, kind, detail).at_block(block.0)
}

fn first_differing_word(ondisk: &[u8], computed: &[u8]) -> Option<u64> {
    if ondisk == computed {
        return None;
    }
    ondisk
        .chunks_exact(rtsum_types::WORD_SIZE)
        .zip(computed.chunks_exact(rtsum_types::WORD_SIZE))
        .position(|(a, b)| a != b)
        .map(|idx| idx as u64)
}
