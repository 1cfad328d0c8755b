#![forbid(unsafe_code)]
//! Pageable scratch memory for recomputed metadata.
//!
//! An [`XFile`] is a sparse, byte-addressed buffer with pread/pwrite
//! semantics. Pages are materialised on first non-zero store; unbacked
//! ranges read back as zeros. This keeps a scratch copy of a large metadata
//! file cheap when most of it is empty, which is the common case for a
//! free-space summary.

use rtsum_error::{Result, RtError};
use std::collections::BTreeMap;
use tracing::debug;

/// Granularity of backing allocations.
pub const XFILE_PAGE_SIZE: usize = 4096;

const PAGE_SIZE_U64: u64 = XFILE_PAGE_SIZE as u64;

/// Sparse byte-addressed scratch file.
///
/// Invariant: every key in `pages` is `< size.div_ceil(XFILE_PAGE_SIZE)` and
/// every page is exactly `XFILE_PAGE_SIZE` bytes long.
#[derive(Debug)]
pub struct XFile {
    description: String,
    size: u64,
    pages: BTreeMap<u64, Box<[u8]>>,
}

impl XFile {
    /// Create an empty (all-zero) scratch file of `size` bytes.
    pub fn create(description: impl Into<String>, size: u64) -> Result<Self> {
        let description = description.into();
        debug!(description = %description, size, "xfile_create");
        Ok(Self {
            description,
            size,
            pages: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Logical size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes of backing memory currently allocated.
    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.pages.len() as u64 * PAGE_SIZE_U64
    }

    /// Extend the logical size. Shrinking is not supported.
    pub fn grow(&mut self, new_size: u64) -> Result<()> {
        if new_size < self.size {
            return Err(RtError::Format(format!(
                "xfile cannot shrink: size={} requested={new_size}",
                self.size
            )));
        }
        self.size = new_size;
        Ok(())
    }

    /// Read exactly `buf.len()` bytes starting at `offset`.
    pub fn load(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.check_range(offset, buf.len())?;

        let mut pos = offset;
        let mut done = 0_usize;
        while done < buf.len() {
            let (page, in_page) = split_offset(pos);
            let chunk = (XFILE_PAGE_SIZE - in_page).min(buf.len() - done);
            let dst = &mut buf[done..done + chunk];
            match self.pages.get(&page) {
                Some(data) => dst.copy_from_slice(&data[in_page..in_page + chunk]),
                None => dst.fill(0),
            }
            done += chunk;
            pos += chunk as u64;
        }
        Ok(())
    }

    /// Write all of `data` starting at `offset`.
    ///
    /// All-zero chunks aimed at unbacked pages are dropped without
    /// allocating.
    pub fn store(&mut self, data: &[u8], offset: u64) -> Result<()> {
        self.check_range(offset, data.len())?;

        let mut pos = offset;
        let mut done = 0_usize;
        while done < data.len() {
            let (page, in_page) = split_offset(pos);
            let chunk = (XFILE_PAGE_SIZE - in_page).min(data.len() - done);
            let src = &data[done..done + chunk];
            if let Some(backing) = self.pages.get_mut(&page) {
                backing[in_page..in_page + chunk].copy_from_slice(src);
            } else if src.iter().any(|&b| b != 0) {
                let mut backing = alloc_page()?;
                backing[in_page..in_page + chunk].copy_from_slice(src);
                self.pages.insert(page, backing);
            }
            done += chunk;
            pos += chunk as u64;
        }
        Ok(())
    }

    /// Read `len` bytes at `offset` into a fresh buffer.
    pub fn copy_out(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.try_reserve_exact(len)
            .map_err(|_| RtError::NoMemory { bytes: len })?;
        out.resize(len, 0);
        self.load(&mut out, offset)?;
        Ok(out)
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let len_u64 = len as u64;
        let end = offset.checked_add(len_u64);
        if end.is_none_or(|end| end > self.size) {
            return Err(RtError::OutOfBounds {
                offset,
                len: len_u64,
                limit: self.size,
            });
        }
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)] // remainder of a page-size division
fn split_offset(pos: u64) -> (u64, usize) {
    (pos / PAGE_SIZE_U64, (pos % PAGE_SIZE_U64) as usize)
}

fn alloc_page() -> Result<Box<[u8]>> {
    let mut page = Vec::new();
    page.try_reserve_exact(XFILE_PAGE_SIZE)
        .map_err(|_| RtError::NoMemory {
            bytes: XFILE_PAGE_SIZE,
        })?;
    page.resize(XFILE_PAGE_SIZE, 0);
    Ok(page.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fresh_xfile_reads_zeros() {
        let xf = XFile::create("test", 3 * PAGE_SIZE_U64).expect("create");
        let data = xf.copy_out(100, 5000).expect("load");
        assert!(data.iter().all(|&b| b == 0));
        assert_eq!(xf.resident_bytes(), 0);
        assert_eq!(xf.description(), "test");
    }

    #[test]
    fn store_spanning_pages_reads_back() {
        let mut xf = XFile::create("span", 3 * PAGE_SIZE_U64).expect("create");
        let payload: Vec<u8> = (0..=255).cycle().take(6000).collect();
        xf.store(&payload, 4000).expect("store");
        assert_eq!(xf.copy_out(4000, 6000).expect("load"), payload);
        // 4000..10000 touches pages 0, 1 and 2.
        assert_eq!(xf.resident_bytes(), 3 * PAGE_SIZE_U64);
    }

    #[test]
    fn zero_store_does_not_allocate() {
        let mut xf = XFile::create("sparse", 2 * PAGE_SIZE_U64).expect("create");
        xf.store(&[0_u8; 512], 1024).expect("store");
        assert_eq!(xf.resident_bytes(), 0);
    }

    #[test]
    fn zero_store_overwrites_backed_page() {
        let mut xf = XFile::create("overwrite", PAGE_SIZE_U64).expect("create");
        xf.store(&[0xAA; 8], 16).expect("store");
        xf.store(&[0; 4], 16).expect("store");
        assert_eq!(
            xf.copy_out(16, 8).expect("load"),
            vec![0, 0, 0, 0, 0xAA, 0xAA, 0xAA, 0xAA]
        );
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mut xf = XFile::create("bounds", 64).expect("create");
        let mut buf = [0_u8; 8];
        assert!(matches!(
            xf.load(&mut buf, 60),
            Err(RtError::OutOfBounds {
                offset: 60,
                len: 8,
                limit: 64
            })
        ));
        assert!(xf.store(&[1], 64).is_err());
        assert!(xf.store(&[1], u64::MAX).is_err());
        xf.store(&[1], 63).expect("last byte is addressable");
    }

    #[test]
    fn grow_extends_addressable_range() {
        let mut xf = XFile::create("grow", 16).expect("create");
        assert!(xf.store(&[1; 4], 16).is_err());
        xf.grow(32).expect("grow");
        xf.store(&[1; 4], 16).expect("store after grow");
        assert!(xf.grow(8).is_err());
        assert_eq!(xf.size(), 32);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn matches_flat_buffer_model(
            writes in proptest::collection::vec((0_u64..12_000, proptest::collection::vec(any::<u8>(), 1..600)), 0..20),
        ) {
            let size = 3 * PAGE_SIZE_U64 + 1000;
            let mut xf = XFile::create("model", size).expect("create");
            let mut model = vec![0_u8; usize::try_from(size).expect("fits")];
            for (offset, data) in writes {
                let start = usize::try_from(offset).expect("fits");
                let fits = start + data.len() <= model.len();
                let result = xf.store(&data, offset);
                prop_assert_eq!(result.is_ok(), fits);
                if fits {
                    model[start..start + data.len()].copy_from_slice(&data);
                }
            }
            prop_assert_eq!(xf.copy_out(0, model.len()).expect("load"), model);
        }
    }
}
