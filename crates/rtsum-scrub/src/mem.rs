//! In-memory collaborators.
//!
//! [`MemSummaryFile`] stands in for the summary inode (fork map plus buffer
//! cache) and [`RecordList`] for a bitmap scan that yields a fixed list of
//! records, valid or not. Both count how often they are used so callers can
//! assert how far a check got.

use parking_lot::RwLock;
use rtsum_bitmap::{FreeExtentIter, FreeExtentRecord, FreeExtentSource};
use rtsum_error::{Result, RtError};
use rtsum_types::{FileBlock, SummaryOffset, WORD_SIZE, u64_to_usize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::compare::{Mapping, MappingState, SummaryBlockReader, SummaryBuf, SummaryForkMap};
use crate::config::RtSummaryConfig;
use crate::scratch::ScratchIndex;

// ── Summary file ────────────────────────────────────────────────────────────

/// Failure injected into [`MemSummaryFile::read_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFault {
    /// The device returned an error.
    Io,
    /// The block failed its verifier.
    Corrupt,
}

/// Summary file held in memory.
///
/// Starts as `disk_size` bytes of zeroed, fully written blocks. Blocks
/// carry a zeroed header on grouped filesystems.
#[derive(Debug)]
pub struct MemSummaryFile {
    config: RtSummaryConfig,
    disk_size: u64,
    blocks: RwLock<BTreeMap<u64, Vec<u8>>>,
    mappings: RwLock<Vec<Mapping>>,
    faults: RwLock<HashMap<u64, ReadFault>>,
    reads: AtomicU64,
}

impl MemSummaryFile {
    #[must_use]
    pub fn new(config: RtSummaryConfig, disk_size: u64) -> Self {
        let eof = config.block_size.bytes_to_blocks(disk_size);
        let mappings = if eof == 0 {
            Vec::new()
        } else {
            vec![Mapping::written(0, eof)]
        };
        Self {
            config,
            disk_size,
            blocks: RwLock::new(BTreeMap::new()),
            mappings: RwLock::new(mappings),
            faults: RwLock::new(HashMap::new()),
            reads: AtomicU64::new(0),
        }
    }

    /// A file whose words equal the first words of `scratch`.
    pub fn from_scratch(
        config: RtSummaryConfig,
        scratch: &ScratchIndex,
        disk_size: u64,
    ) -> Result<Self> {
        let file = Self::new(config, disk_size);
        let block_words = u64::from(config.block_words());
        let words = (file.eof_blocks() * block_words).min(scratch.word_count());
        let mut offset = 0;
        while offset < words {
            let raw = scratch.load_raw(SummaryOffset(offset))?;
            if raw != [0; WORD_SIZE] {
                file.set_raw(SummaryOffset(offset), raw)?;
            }
            offset += 1;
        }
        Ok(file)
    }

    #[must_use]
    pub fn eof_blocks(&self) -> u64 {
        self.config.block_size.bytes_to_blocks(self.disk_size)
    }

    /// Store `value` at word `offset` in the file's encoding.
    pub fn set_word(&self, offset: SummaryOffset, value: u32) -> Result<()> {
        self.set_raw(offset, self.config.encoding().encode(value))
    }

    /// Decoded word at `offset`.
    pub fn word(&self, offset: SummaryOffset) -> Result<u32> {
        let (block, start) = self.locate(offset)?;
        let blocks = self.blocks.read();
        let raw = blocks
            .get(&block)
            .and_then(|data| data.get(start..start + WORD_SIZE))
            .map_or([0; WORD_SIZE], |bytes| {
                let mut raw = [0; WORD_SIZE];
                raw.copy_from_slice(bytes);
                raw
            });
        Ok(self.config.encoding().decode(raw))
    }

    /// Replace the fork map.
    pub fn set_mappings(&self, mappings: Vec<Mapping>) {
        let mut mappings = mappings;
        mappings.sort_by_key(|map| map.start);
        *self.mappings.write() = mappings;
    }

    pub fn inject_read_fault(&self, block: FileBlock, fault: ReadFault) {
        self.faults.write().insert(block.0, fault);
    }

    /// Number of `read_block` calls so far.
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn set_raw(&self, offset: SummaryOffset, raw: [u8; WORD_SIZE]) -> Result<()> {
        let (block, start) = self.locate(offset)?;
        let block_len = self.block_len()?;
        let mut blocks = self.blocks.write();
        let data = blocks.entry(block).or_insert_with(|| vec![0; block_len]);
        data[start..start + WORD_SIZE].copy_from_slice(&raw);
        Ok(())
    }

    /// Block number and byte offset inside the block of a summary word.
    fn locate(&self, offset: SummaryOffset) -> Result<(u64, usize)> {
        let block_words = u64::from(self.config.block_words());
        let block = offset.0 / block_words;
        if block >= self.eof_blocks() {
            return Err(RtError::OutOfBounds {
                offset: offset.0,
                len: 1,
                limit: self.eof_blocks() * block_words,
            });
        }
        let word = u64_to_usize(offset.0 % block_words, "word")
            .map_err(|e| RtError::Format(e.to_string()))?;
        Ok((block, self.config.format.header_len() + word * WORD_SIZE))
    }

    fn block_len(&self) -> Result<usize> {
        u64_to_usize(u64::from(self.config.block_size.get()), "block_size")
            .map_err(|e| RtError::Format(e.to_string()))
    }
}

impl SummaryForkMap for MemSummaryFile {
    fn disk_size(&self) -> u64 {
        self.disk_size
    }

    fn lookup_mapping(&self, offset: FileBlock, max_len: u64) -> Result<Mapping> {
        let mappings = self.mappings.read();
        if let Some(map) = mappings.iter().find(|map| map.contains(offset)) {
            return Ok(Mapping {
                state: map.state,
                start: offset,
                length: (map.end() - offset.0).min(max_len),
            });
        }
        let next = mappings
            .iter()
            .find(|map| map.start > offset)
            .map_or(u64::MAX, |map| map.start.0);
        Ok(Mapping {
            state: MappingState::Hole,
            start: offset,
            length: (next - offset.0).min(max_len),
        })
    }

    fn first_mapping_at_or_after(&self, offset: FileBlock) -> Result<Option<Mapping>> {
        let mappings = self.mappings.read();
        Ok(mappings
            .iter()
            .find(|map| map.contains(offset) || map.start > offset)
            .copied())
    }
}

impl SummaryBlockReader for MemSummaryFile {
    fn read_block(&self, block: FileBlock) -> Result<SummaryBuf> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        match self.faults.read().get(&block.0) {
            Some(ReadFault::Io) => {
                return Err(RtError::Io(std::io::Error::other(format!(
                    "injected read error at block {}",
                    block.0
                ))));
            }
            Some(ReadFault::Corrupt) => {
                return Err(RtError::Corruption {
                    block: block.0,
                    detail: "summary block failed verification".to_owned(),
                });
            }
            None => {}
        }
        if block.0 >= self.eof_blocks() {
            return Err(RtError::OutOfBounds {
                offset: block.0,
                len: 1,
                limit: self.eof_blocks(),
            });
        }
        let data = match self.blocks.read().get(&block.0) {
            Some(data) => data.clone(),
            None => vec![0; self.block_len()?],
        };
        Ok(SummaryBuf::new(data, self.config.format.header_len()))
    }
}

// ── Extent records ──────────────────────────────────────────────────────────

/// A bitmap scan that replays a fixed list of records.
///
/// Unlike [`rtsum_bitmap::RtBitmap`] it can produce records no real bitmap
/// would, such as runs past the end of the device.
#[derive(Debug)]
pub struct RecordList {
    disk_size: u64,
    records: Vec<FreeExtentRecord>,
    yielded: AtomicU64,
}

impl RecordList {
    #[must_use]
    pub fn new(disk_size: u64, records: Vec<FreeExtentRecord>) -> Self {
        Self {
            disk_size,
            records,
            yielded: AtomicU64::new(0),
        }
    }

    /// Records handed out across all scans.
    #[must_use]
    pub fn yielded(&self) -> u64 {
        self.yielded.load(Ordering::Relaxed)
    }
}

impl FreeExtentSource for RecordList {
    fn disk_size(&self) -> u64 {
        self.disk_size
    }

    fn free_extents(&self) -> Result<FreeExtentIter<'_>> {
        Ok(Box::new(self.records.iter().map(|record| {
            self.yielded.fetch_add(1, Ordering::Relaxed);
            Ok(*record)
        })))
    }
}
