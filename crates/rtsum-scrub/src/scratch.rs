//! Scratch copy of the recomputed summary.

use rtsum_error::{Result, RtError};
use rtsum_types::{SummaryOffset, WORD_SIZE};
use rtsum_xfile::XFile;

use crate::sumword::CounterEncoding;

/// Word-addressed view of an [`XFile`] holding recomputed summary counters.
///
/// Words are stored in the on-disk encoding so whole blocks can be compared
/// byte for byte. The index starts zero-filled.
#[derive(Debug)]
pub struct ScratchIndex {
    file: XFile,
    encoding: CounterEncoding,
    words: u64,
}

impl ScratchIndex {
    pub fn new(words: u64, encoding: CounterEncoding) -> Result<Self> {
        let bytes = SummaryOffset(words).to_byte_offset().ok_or_else(|| {
            RtError::InvalidGeometry(format!("scratch index of {words} words overflows"))
        })?;
        Ok(Self {
            file: XFile::create("realtime summary file", bytes)?,
            encoding,
            words,
        })
    }

    /// Capacity in summary words.
    #[must_use]
    pub fn word_count(&self) -> u64 {
        self.words
    }

    #[must_use]
    pub fn encoding(&self) -> CounterEncoding {
        self.encoding
    }

    /// Backing memory actually allocated, in bytes.
    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.file.resident_bytes()
    }

    pub fn load_raw(&self, offset: SummaryOffset) -> Result<[u8; WORD_SIZE]> {
        let mut raw = [0_u8; WORD_SIZE];
        self.file.load(&mut raw, byte_offset(offset)?)?;
        Ok(raw)
    }

    pub fn store_raw(&mut self, offset: SummaryOffset, raw: [u8; WORD_SIZE]) -> Result<()> {
        self.file.store(&raw, byte_offset(offset)?)
    }

    /// Decoded counter at `offset`.
    pub fn load(&self, offset: SummaryOffset) -> Result<u32> {
        Ok(self.encoding.decode(self.load_raw(offset)?))
    }

    /// Encoded bytes of `nr_words` words starting at `offset`.
    pub fn copy_out(&self, offset: SummaryOffset, nr_words: usize) -> Result<Vec<u8>> {
        let len = nr_words
            .checked_mul(WORD_SIZE)
            .ok_or(RtError::NoMemory { bytes: usize::MAX })?;
        self.file.copy_out(byte_offset(offset)?, len)
    }

    /// Fill `buf` with the encoded words starting at `offset`.
    ///
    /// `buf.len()` must be a whole number of words.
    pub fn copy_into(&self, offset: SummaryOffset, buf: &mut [u8]) -> Result<()> {
        if buf.len() % WORD_SIZE != 0 {
            return Err(RtError::Format(format!(
                "copy of {} bytes is not word aligned",
                buf.len()
            )));
        }
        self.file.load(buf, byte_offset(offset)?)
    }
}

fn byte_offset(offset: SummaryOffset) -> Result<u64> {
    offset.to_byte_offset().ok_or(RtError::OutOfBounds {
        offset: offset.0,
        len: 1,
        limit: u64::MAX / WORD_SIZE as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_zeroed_and_unbacked() {
        let scratch = ScratchIndex::new(1 << 20, CounterEncoding::Legacy).expect("scratch");
        assert_eq!(scratch.load(SummaryOffset(12_345)).expect("load"), 0);
        assert_eq!(scratch.resident_bytes(), 0);
    }

    #[test]
    fn copy_out_returns_encoded_words() {
        let enc = CounterEncoding::Grouped;
        let mut scratch = ScratchIndex::new(8, enc).expect("scratch");
        scratch
            .store_raw(SummaryOffset(2), enc.encode(0xA0B0_C0D0))
            .expect("store");
        let bytes = scratch.copy_out(SummaryOffset(1), 3).expect("copy");
        assert_eq!(bytes, [0, 0, 0, 0, 0xA0, 0xB0, 0xC0, 0xD0, 0, 0, 0, 0]);

        let mut buf = [0xFF_u8; 8];
        scratch.copy_into(SummaryOffset(2), &mut buf).expect("copy");
        assert_eq!(buf, [0xA0, 0xB0, 0xC0, 0xD0, 0, 0, 0, 0]);
        assert!(scratch.copy_into(SummaryOffset(0), &mut [0_u8; 3]).is_err());
    }

    #[test]
    fn access_past_capacity_fails() {
        let mut scratch = ScratchIndex::new(4, CounterEncoding::Legacy).expect("scratch");
        assert!(matches!(
            scratch.store_raw(SummaryOffset(4), [1, 0, 0, 0]),
            Err(RtError::OutOfBounds { .. })
        ));
        assert!(scratch.copy_out(SummaryOffset(2), 3).is_err());
    }
}
