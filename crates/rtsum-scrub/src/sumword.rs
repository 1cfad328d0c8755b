//! Summary coordinates and counter encoding.

use rtsum_bitmap::{FreeExtentRecord, rtx_to_bitmap_block};
use rtsum_types::{RtFormat, SummaryOffset, WORD_SIZE, highbit64};

use crate::config::{OverflowPolicy, RtSummaryConfig};

/// Position of a free extent in the summary: size order by bitmap block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SummaryCoordinate {
    /// `floor(log2(count))`.
    pub order: u32,
    /// Bitmap block holding the extent's first bit.
    pub bitmap_block: u64,
}

impl SummaryCoordinate {
    /// Coordinate of a free run. `None` for an empty run, which has no
    /// size order.
    #[must_use]
    pub fn for_record(config: &RtSummaryConfig, record: &FreeExtentRecord) -> Option<Self> {
        let order = highbit64(record.count)?;
        Some(Self {
            order,
            bitmap_block: rtx_to_bitmap_block(config.format, config.block_size, record.start),
        })
    }

    /// Word offset of this coordinate in a summary over `bitmap_blocks`
    /// bitmap blocks. Summaries are laid out order-major.
    #[must_use]
    pub fn offset(self, bitmap_blocks: u64) -> Option<SummaryOffset> {
        u64::from(self.order)
            .checked_mul(bitmap_blocks)?
            .checked_add(self.bitmap_block)
            .map(SummaryOffset)
    }
}

/// On-disk representation of a summary counter.
///
/// Words are encoded with the same [`RtFormat`] codec the bitmap uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterEncoding {
    /// Host-endian `u32`.
    Legacy,
    /// Big-endian `u32`.
    Grouped,
}

impl CounterEncoding {
    #[must_use]
    pub fn for_format(format: RtFormat) -> Self {
        match format {
            RtFormat::Legacy => Self::Legacy,
            RtFormat::Grouped => Self::Grouped,
        }
    }

    #[must_use]
    pub fn format(self) -> RtFormat {
        match self {
            Self::Legacy => RtFormat::Legacy,
            Self::Grouped => RtFormat::Grouped,
        }
    }

    #[must_use]
    pub fn decode(self, raw: [u8; WORD_SIZE]) -> u32 {
        self.format().decode_word(raw)
    }

    #[must_use]
    pub fn encode(self, value: u32) -> [u8; WORD_SIZE] {
        self.format().encode_word(value)
    }

    /// Add one to the counter stored in `raw`, returning the new value.
    ///
    /// At `u32::MAX` the counter wraps to zero under
    /// [`OverflowPolicy::Wrap`]; under [`OverflowPolicy::Corrupt`] `raw` is
    /// left untouched and `None` is returned.
    pub fn increment(self, raw: &mut [u8; WORD_SIZE], overflow: OverflowPolicy) -> Option<u32> {
        let current = self.decode(*raw);
        let next = match overflow {
            OverflowPolicy::Wrap => current.wrapping_add(1),
            OverflowPolicy::Corrupt => current.checked_add(1)?,
        };
        *raw = self.encode(next);
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rtsum_types::BlockSize;

    fn legacy_4k() -> RtSummaryConfig {
        RtSummaryConfig::new(BlockSize::new(4096).expect("bs"), 1, RtFormat::Legacy)
            .expect("config")
    }

    #[test]
    fn four_extent_run_at_zero() {
        let cfg = legacy_4k();
        let coord = SummaryCoordinate::for_record(&cfg, &FreeExtentRecord::new(0, 4))
            .expect("non-empty");
        assert_eq!(
            coord,
            SummaryCoordinate {
                order: 2,
                bitmap_block: 0
            }
        );
        assert_eq!(coord.offset(10), Some(SummaryOffset(20)));
    }

    #[test]
    fn bitmap_block_follows_start() {
        let cfg = legacy_4k();
        // 32768 extents per block.
        let coord = SummaryCoordinate::for_record(&cfg, &FreeExtentRecord::new(32_768 * 3 + 5, 1))
            .expect("non-empty");
        assert_eq!(coord.order, 0);
        assert_eq!(coord.bitmap_block, 3);
        assert!(SummaryCoordinate::for_record(&cfg, &FreeExtentRecord::new(7, 0)).is_none());
    }

    #[test]
    fn grouped_counters_are_big_endian() {
        let enc = CounterEncoding::Grouped;
        let mut raw = [0_u8; 4];
        for _ in 0..0x0102 {
            enc.increment(&mut raw, OverflowPolicy::Wrap);
        }
        assert_eq!(raw, [0, 0, 1, 2]);
        assert_eq!(enc.decode(raw), 0x0102);
    }

    #[test]
    fn legacy_counters_are_native_endian() {
        let enc = CounterEncoding::Legacy;
        let mut raw = enc.encode(41);
        assert_eq!(enc.increment(&mut raw, OverflowPolicy::Wrap), Some(42));
        assert_eq!(raw, 42_u32.to_ne_bytes());
    }

    #[test]
    fn overflow_policy() {
        for enc in [CounterEncoding::Legacy, CounterEncoding::Grouped] {
            let mut raw = enc.encode(u32::MAX);
            assert_eq!(enc.increment(&mut raw, OverflowPolicy::Corrupt), None);
            assert_eq!(enc.decode(raw), u32::MAX);
            assert_eq!(enc.increment(&mut raw, OverflowPolicy::Wrap), Some(0));
            assert_eq!(raw, [0; 4]);
        }
    }

    proptest! {
        #[test]
        fn counters_share_the_bitmap_word_codec(value in any::<u32>()) {
            for format in [RtFormat::Legacy, RtFormat::Grouped] {
                let enc = CounterEncoding::for_format(format);
                prop_assert_eq!(enc.format(), format);
                prop_assert_eq!(enc.encode(value), format.encode_word(value));
                prop_assert_eq!(enc.decode(format.encode_word(value)), value);
            }
        }

        #[test]
        fn offsets_are_bijective(
            a_order in 0_u32..64,
            a_block in 0_u64..1000,
            b_order in 0_u32..64,
            b_block in 0_u64..1000,
        ) {
            let bitmap_blocks = 1000;
            let a = SummaryCoordinate { order: a_order, bitmap_block: a_block };
            let b = SummaryCoordinate { order: b_order, bitmap_block: b_block };
            let same_offset = a.offset(bitmap_blocks) == b.offset(bitmap_blocks);
            prop_assert_eq!(same_offset, a == b);
        }

        #[test]
        fn order_brackets_count(start in 0_u64..(1 << 30), count in 1_u64..(1 << 40)) {
            let cfg = legacy_4k();
            let coord = SummaryCoordinate::for_record(&cfg, &FreeExtentRecord::new(start, count))
                .expect("non-empty");
            prop_assert!(1_u64 << coord.order <= count);
            prop_assert!(count < 1_u64 << (coord.order + 1));
            prop_assert_eq!(coord.bitmap_block, start / 32_768);
        }
    }
}
