#![forbid(unsafe_code)]

//! Identifier newtypes shared by every cairn crate.
//!
//! Block numbers and device ids travel together through the cache as a
//! [`BlockAddr`]; keeping them unit-carrying wrappers prevents mixing a
//! block index with a byte offset or a raw device number at call sites.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Device number as handed to the cache by filesystem code.
///
/// A small integer selecting one attached block device, not a stable
/// on-disk identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Index of one block on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Subtract a block count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, count: u64) -> Option<Self> {
        self.0.checked_sub(count).map(Self)
    }

    /// Byte offset of this block for a given block size, `None` on overflow.
    #[must_use]
    pub fn byte_offset(self, block_size: usize) -> Option<u64> {
        self.0.checked_mul(block_size as u64)
    }
}

/// Full identity of one cached block: which device, which block on it.
///
/// This is the key the cache's hash index deduplicates on. Equality covers
/// both fields; the index itself stripes on the block number alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockAddr {
    pub device: DeviceId,
    pub block: BlockNumber,
}

impl BlockAddr {
    #[must_use]
    pub fn new(device: DeviceId, block: BlockNumber) -> Self {
        Self { device, block }
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device, self.block)
    }
}
