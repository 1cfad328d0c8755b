//! Recompute the summary from the bitmap.

use rtsum_bitmap::{FreeExtentRecord, FreeExtentSource};
use rtsum_error::{Result, RtError};
use tracing::{debug, trace};

use crate::config::RtSummaryConfig;
use crate::geometry::Geometry;
use crate::scratch::ScratchIndex;
use crate::sumword::SummaryCoordinate;
use crate::terminate::{Terminate, checkpoint};

/// Counters from one recompute pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecomputeStats {
    /// Free extent records consumed.
    pub records: u64,
    /// Summary words that went from zero to non-zero.
    pub words_touched: u64,
}

/// Scan every free extent of `bitmap` and count it into `scratch`.
///
/// `scratch` must be zero-filled and hold at least
/// [`Geometry::summary_words`] words. The caller keeps the bitmap stable
/// for the duration of the call.
///
/// A bitmap whose size disagrees with the geometry, a record outside the
/// realtime device, and (under [`OverflowPolicy::Corrupt`]) a counter
/// overflow all fail with [`RtError::Corruption`]. The scan stops at the
/// first such record.
///
/// [`OverflowPolicy::Corrupt`]: crate::config::OverflowPolicy::Corrupt
pub fn compute_summary(
    config: &RtSummaryConfig,
    geometry: &Geometry,
    bitmap: &dyn FreeExtentSource,
    terminate: &dyn Terminate,
    scratch: &mut ScratchIndex,
) -> Result<RecomputeStats> {
    let expected = config.block_size.blocks_to_bytes(geometry.bitmap_blocks);
    if expected != Some(bitmap.disk_size()) {
        return Err(RtError::Corruption {
            block: 0,
            detail: format!(
                "bitmap size {} does not match {} bitmap blocks",
                bitmap.disk_size(),
                geometry.bitmap_blocks
            ),
        });
    }

    let encoding = config.encoding();
    let mut stats = RecomputeStats::default();
    for record in bitmap.free_extents()? {
        checkpoint(terminate)?;
        let record = record?;
        verify_extent(config, geometry, &record)?;

        let offset = SummaryCoordinate::for_record(config, &record)
            .and_then(|coord| coord.offset(geometry.bitmap_blocks).map(|off| (coord, off)));
        let Some((coord, offset)) = offset else {
            return Err(record_corruption(&record, "no summary coordinate"));
        };

        let mut raw = scratch.load_raw(offset)?;
        let value = encoding
            .increment(&mut raw, config.overflow)
            .ok_or_else(|| record_corruption(&record, "summary counter overflow"))?;
        trace!(
            start = record.start.0,
            count = record.count,
            order = coord.order,
            offset = offset.0,
            value,
            "rtsum_record_free"
        );
        scratch.store_raw(offset, raw)?;

        stats.records += 1;
        if value == 1 {
            stats.words_touched += 1;
        }
    }

    debug!(
        records = stats.records,
        words_touched = stats.words_touched,
        "rtsummary recomputed"
    );
    Ok(stats)
}

/// Check that a free run lies on the realtime device.
///
/// The run must be non-empty and `[start, start + count)` extents, scaled
/// to realtime blocks, must fit inside `[0, rblocks)`.
pub fn verify_extent(
    config: &RtSummaryConfig,
    geometry: &Geometry,
    record: &FreeExtentRecord,
) -> Result<()> {
    if record.count == 0 {
        return Err(record_corruption(record, "empty free extent"));
    }
    let rextsize = u64::from(config.rextsize);
    let Some(start) = record.start.to_rtblock(config.rextsize) else {
        return Err(record_corruption(record, "start overflows the rt device"));
    };
    let Some(len) = record.count.checked_mul(rextsize) else {
        return Err(record_corruption(record, "length overflows the rt device"));
    };
    let in_range = start.0 < geometry.rblocks
        && start
            .0
            .checked_add(len)
            .is_some_and(|end| end <= geometry.rblocks);
    if !in_range {
        return Err(record_corruption(
            record,
            &format!(
                "rt blocks {}+{len} beyond device end {}",
                start.0, geometry.rblocks
            ),
        ));
    }
    Ok(())
}

fn record_corruption(record: &FreeExtentRecord, what: &str) -> RtError {
    RtError::Corruption {
        block: record.start.0,
        detail: format!(
            "free extent {}+{}: {what}",
            record.start.0, record.count
        ),
    }
}
