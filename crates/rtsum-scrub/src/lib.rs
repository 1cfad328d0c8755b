#![forbid(unsafe_code)]
//! Realtime summary scrub.
//!
//! The realtime summary is a derived index over the realtime bitmap: for
//! every (size order, bitmap block) pair it counts the free extents of that
//! size order that start inside that bitmap block. This crate checks it by
//! recomputing the whole index from the bitmap into pageable scratch memory
//! and comparing the result, block by block, with the summary file.
//!
//! The check runs as a short pipeline that stops at the first problem:
//!
//! 1. [`geometry`]: derived extent/block/level counts against the persisted
//!    values, plus summary file size sanity.
//! 2. Fork structure: delegated to a [`MetadataForkCheck`] collaborator.
//! 3. [`compute`]: scan the bitmap once and build the [`ScratchIndex`].
//! 4. [`compare`]: walk the summary file and compare it to the scratch
//!    index, first mismatching block wins.
//!
//! Corruption is a normal outcome and is returned inside a [`CheckReport`];
//! only I/O failures, allocation failures and cancellation surface as
//! [`RtError`](rtsum_error::RtError).
//!
//! # Usage
//!
//! ```no_run
//! use asupersync::Cx;
//! use rtsum_bitmap::{FreeExtentRecord, RtBitmap};
//! use rtsum_scrub::mem::MemSummaryFile;
//! use rtsum_scrub::{Geometry, RtSummaryChecker, RtSummaryConfig};
//! use rtsum_types::{BlockSize, RtFormat};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RtSummaryConfig::new(BlockSize::new(4096)?, 1, RtFormat::Legacy)?;
//! let geometry = Geometry::compute(&config, 100_000)?;
//! let bitmap = RtBitmap::from_free_runs(
//!     config.format,
//!     config.block_size,
//!     geometry.rextents,
//!     &[FreeExtentRecord::new(0, 4)],
//! )?;
//! let summary = MemSummaryFile::new(config, 4096);
//!
//! let cx = Cx::for_request();
//! let report = RtSummaryChecker::new(config, geometry.to_superblock(), &bitmap, &summary)?
//!     .with_terminate(&cx)
//!     .check()?;
//! if let Some(finding) = report.finding() {
//!     eprintln!("{finding}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod check;
pub mod compare;
pub mod compute;
pub mod config;
pub mod finding;
pub mod geometry;
pub mod mem;
pub mod scratch;
pub mod sumword;
pub mod terminate;

pub use check::{
    AcceptForks, CheckReport, CheckResult, CheckStage, MetadataForkCheck, RtSummaryChecker,
    Verdict,
};
pub use compare::{
    Mapping, MappingState, SummaryBlockReader, SummaryBuf, SummaryFile, SummaryForkMap,
    compare_summary,
};
pub use compute::{RecomputeStats, compute_summary};
pub use config::{OverflowPolicy, RtSummaryConfig, RtSuperblock};
pub use finding::{CorruptionFinding, CorruptionKind, Structure};
pub use geometry::Geometry;
pub use scratch::ScratchIndex;
pub use sumword::{CounterEncoding, SummaryCoordinate};
pub use terminate::{NeverTerminate, Terminate};
