#![forbid(unsafe_code)]
//! Error types for the realtime summary checker.
//!
//! # Error Taxonomy
//!
//! A summary check ends in one of three ways:
//!
//! | Outcome | Representation | Meaning |
//! |---------|----------------|---------|
//! | Clean | `Ok(report)` with no finding | Summary matches the bitmap |
//! | Corrupt | `Ok(report)` with a finding | The check completed; a structure is damaged |
//! | Failed | `Err(RtError)` | The check could not complete |
//!
//! Corruption is an expected, reportable outcome and is carried inside the
//! report, never as an `Err`. The one exception is
//! [`RtError::Corruption`]: stages that are invoked on behalf of another
//! structure (computing the summary from the bitmap) raise it so that the
//! orchestrator can attribute the damage to the right inode.
//!
//! ## errno Mapping
//!
//! Every `RtError` variant maps to exactly one POSIX errno via
//! [`RtError::to_errno`]. The mapping is exhaustive (no wildcard arms) so
//! adding a new variant is a compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `OutOfBounds` | `EINVAL` |
//! | `NoMemory` | `ENOMEM` |
//! | `Cancelled` | `EINTR` |
//!
//! ## Design Constraints
//!
//! - `rtsum-error` MUST NOT depend on `rtsum-types` (no cyclic deps).
//! - All string payloads are owned (`String`).

use thiserror::Error;

/// Unified error type for all summary-check operations.
#[derive(Debug, Error)]
pub enum RtError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata corruption detected while working on behalf of another
    /// structure.
    ///
    /// `block` is the file block (or realtime extent, for bitmap records)
    /// where the damage was observed.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Malformed input that is not on-disk metadata (bad fixture, bad
    /// caller arguments).
    #[error("invalid format: {0}")]
    Format(String),

    /// Configuration values that cannot describe any realtime volume.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Access outside the bounds of a scratch buffer.
    #[error("access out of bounds: offset={offset} len={len} limit={limit}")]
    OutOfBounds { offset: u64, len: u64, limit: u64 },

    /// Scratch memory could not be allocated.
    #[error("out of memory allocating {bytes} bytes")]
    NoMemory { bytes: usize },

    /// The caller asked the check to stop.
    #[error("operation cancelled")]
    Cancelled,
}

impl RtError {
    /// Convert this error into a POSIX errno.
    ///
    /// Policy notes:
    /// - `Cancelled` → `EINTR`: the check was interrupted, not failed.
    /// - `Corruption` → `EIO`: same as every other metadata read failure.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidGeometry(_) | Self::OutOfBounds { .. } => libc::EINVAL,
            Self::NoMemory { .. } => libc::ENOMEM,
            Self::Cancelled => libc::EINTR,
        }
    }

    /// True for the corruption variant.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Result alias using `RtError`.
pub type Result<T> = std::result::Result<T, RtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(RtError, libc::c_int)> = vec![
            (RtError::Io(std::io::Error::other("test")), libc::EIO),
            (
                RtError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (RtError::Format("test".into()), libc::EINVAL),
            (RtError::InvalidGeometry("rextsize=0".into()), libc::EINVAL),
            (
                RtError::OutOfBounds {
                    offset: 8,
                    len: 4,
                    limit: 8,
                },
                libc::EINVAL,
            ),
            (RtError::NoMemory { bytes: 4096 }, libc::ENOMEM),
            (RtError::Cancelled, libc::EINTR),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(RtError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = RtError::Corruption {
            block: 42,
            detail: "extent beyond end of volume".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 42: extent beyond end of volume"
        );
        assert!(err.is_corruption());
        assert!(!RtError::Cancelled.is_corruption());

        let oob = RtError::OutOfBounds {
            offset: 100,
            len: 8,
            limit: 64,
        };
        assert_eq!(
            oob.to_string(),
            "access out of bounds: offset=100 len=8 limit=64"
        );
    }
}
