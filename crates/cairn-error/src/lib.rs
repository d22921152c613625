#![forbid(unsafe_code)]
//! Error types for cairn.
//!
//! # Error Taxonomy
//!
//! The cache distinguishes three failure classes:
//!
//! | Class | Representation | Example |
//! |-------|----------------|---------|
//! | Environment | `Result` with a `CairnError` | device I/O failure, block out of range |
//! | Capacity | `Result` with `PoolExhausted` | every buffer in the fixed pool is held |
//! | Contract violation | panic | unbalanced unpin, refcount underflow |
//!
//! Contract violations are programmer errors in the calling code; they are
//! not representable as recoverable values and the cache fails fast on them.
//! Everything the environment can cause travels through [`CairnError`].
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`CairnError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno | Constant |
//! |---------|-------|----------|
//! | `Io` | `EIO` | 5 |
//! | `Config` | `EINVAL` | 22 |
//! | `PoolExhausted` | `EAGAIN` | 11 |
//! | `OutOfRange` | `ENXIO` | 6 |
//! | `UnknownDevice` | `ENODEV` | 19 |
//! | `ReadOnly` | `EROFS` | 30 |
//!
//! ## Design Constraints
//!
//! - `cairn-error` does not depend on `cairn-types` (no cyclic deps); error
//!   fields carry raw integers and the boundary that raises them formats the
//!   typed ids into the message.
//! - String payloads are owned (`String`) so errors can cross thread
//!   boundaries freely.

use thiserror::Error;

/// Unified error type for all cairn operations.
#[derive(Debug, Error)]
pub enum CairnError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid cache or device configuration detected at construction.
    ///
    /// Raised before any buffer exists: zero-sized pool, zero buckets, a
    /// zero block size, or a device whose block size disagrees with the
    /// cache's.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Every buffer in the fixed pool is currently held.
    ///
    /// The pool never grows and the cache never waits for a free slot; the
    /// requesting operation fails and may be retried once holders release.
    #[error("buffer pool exhausted: all {capacity} buffers in use")]
    PoolExhausted { capacity: usize },

    /// A block number beyond the end of the addressed device.
    #[error("block {block} out of range on device {device}: device has {count} blocks")]
    OutOfRange { device: u32, block: u64, count: u64 },

    /// The addressed device is not served by this backend.
    #[error("unknown device {device}")]
    UnknownDevice { device: u32 },

    /// Write attempted through a device opened read-only.
    #[error("read-only device")]
    ReadOnly,
}

impl CairnError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm.
    ///
    /// Policy notes:
    /// - `PoolExhausted` → `EAGAIN`: the condition clears once holders
    ///   release, matching EAGAIN's try-again contract.
    /// - `OutOfRange` → `ENXIO`: POSIX "no such device or address" covers an
    ///   address past the end of an existing device.
    /// - `UnknownDevice` → `ENODEV`: the device id itself is not attached.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Config(_) => libc::EINVAL,
            Self::PoolExhausted { .. } => libc::EAGAIN,
            Self::OutOfRange { .. } => libc::ENXIO,
            Self::UnknownDevice { .. } => libc::ENODEV,
            Self::ReadOnly => libc::EROFS,
        }
    }
}

/// Result alias using `CairnError`.
pub type Result<T> = std::result::Result<T, CairnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(CairnError, libc::c_int)> = vec![
            (CairnError::Io(std::io::Error::other("test")), libc::EIO),
            (CairnError::Config("zero buckets".into()), libc::EINVAL),
            (CairnError::PoolExhausted { capacity: 30 }, libc::EAGAIN),
            (
                CairnError::OutOfRange {
                    device: 1,
                    block: 99,
                    count: 64,
                },
                libc::ENXIO,
            ),
            (CairnError::UnknownDevice { device: 7 }, libc::ENODEV),
            (CairnError::ReadOnly, libc::EROFS),
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
        let raw = std::io::Error::from_raw_os_error(libc::EACCES);
        let err = CairnError::Io(raw);
        assert_eq!(err.to_errno(), libc::EACCES);
    }

    #[test]
    fn display_formatting() {
        let full = CairnError::PoolExhausted { capacity: 4 };
        assert_eq!(full.to_string(), "buffer pool exhausted: all 4 buffers in use");

        let oob = CairnError::OutOfRange {
            device: 0,
            block: 128,
            count: 64,
        };
        assert_eq!(
            oob.to_string(),
            "block 128 out of range on device 0: device has 64 blocks"
        );

        let cfg = CairnError::Config("slots must be non-zero".into());
        assert_eq!(cfg.to_string(), "invalid configuration: slots must be non-zero");

        let nodev = CairnError::UnknownDevice { device: 9 };
        assert_eq!(nodev.to_string(), "unknown device 9");

        assert_eq!(CairnError::ReadOnly.to_string(), "read-only device");
    }
}
