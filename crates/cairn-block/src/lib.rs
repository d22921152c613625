#![forbid(unsafe_code)]
//! Block devices and the buffer cache that fronts them.
//!
//! Provides the [`BlockDevice`] trait plus two backends ([`MemDevice`],
//! [`FileDevice`]), and the [`BufCache`] engine: a fixed pool of buffer
//! slots indexed by a striped hash table, handing out per-buffer exclusive
//! guards that may be held across device I/O.

use cairn_error::{CairnError, Result};
use cairn_types::{BlockAddr, DeviceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub mod cache;
pub mod demo;

pub use cache::{BufCache, BufGuard, CacheAudit, CacheConfig, CacheMetrics};

/// Block-addressed I/O interface.
///
/// Implementations are synchronous and thread-safe; a call may block the
/// calling thread until the transfer completes. One implementation may serve
/// several device ids (see [`MemDevice`]) or exactly one ([`FileDevice`]).
pub trait BlockDevice: Send + Sync {
    /// Fill `buf` with the contents of the addressed block.
    ///
    /// `buf.len()` MUST equal `block_size()`.
    fn read_block(&self, addr: BlockAddr, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` to the addressed block. `buf.len()` MUST equal
    /// `block_size()`.
    fn write_block(&self, addr: BlockAddr, buf: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> usize;

    /// Number of addressable blocks per device id.
    fn block_count(&self) -> u64;
}

/// Sparse in-memory block store serving any device id.
///
/// Blocks never written read as zeroes. Cloning yields another handle to the
/// same storage, so tests can keep a handle while the cache owns one.
/// Public rather than test-only: benches and demos build on it too.
#[derive(Debug, Clone)]
pub struct MemDevice {
    inner: Arc<MemDeviceInner>,
}

#[derive(Debug)]
struct MemDeviceInner {
    blocks: Mutex<HashMap<BlockAddr, Box<[u8]>>>,
    block_size: usize,
    block_count: u64,
}

impl MemDevice {
    #[must_use]
    pub fn new(block_size: usize, block_count: u64) -> Self {
        Self {
            inner: Arc::new(MemDeviceInner {
                blocks: Mutex::new(HashMap::new()),
                block_size,
                block_count,
            }),
        }
    }

    /// Number of blocks that have been written at least once.
    #[must_use]
    pub fn written_blocks(&self) -> usize {
        self.inner.blocks.lock().len()
    }

    fn check_range(&self, addr: BlockAddr) -> Result<()> {
        if addr.block.0 >= self.inner.block_count {
            return Err(CairnError::OutOfRange {
                device: addr.device.0,
                block: addr.block.0,
                count: self.inner.block_count,
            });
        }
        Ok(())
    }
}

impl BlockDevice for MemDevice {
    fn read_block(&self, addr: BlockAddr, buf: &mut [u8]) -> Result<()> {
        assert_eq!(buf.len(), self.inner.block_size, "read buffer size");
        self.check_range(addr)?;
        let blocks = self.inner.blocks.lock();
        match blocks.get(&addr) {
            Some(bytes) => buf.copy_from_slice(bytes),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, addr: BlockAddr, buf: &[u8]) -> Result<()> {
        assert_eq!(buf.len(), self.inner.block_size, "write buffer size");
        self.check_range(addr)?;
        self.inner.blocks.lock().insert(addr, buf.into());
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.inner.block_size
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count
    }
}

/// File-backed device for a single device id, using positional I/O.
///
/// Built on `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// share a seek position. Cloning yields another handle to the same file.
#[derive(Debug, Clone)]
pub struct FileDevice {
    file: Arc<File>,
    device: DeviceId,
    block_size: usize,
    block_count: u64,
    writable: bool,
}

impl FileDevice {
    /// Open an existing image read-write, falling back to read-only.
    ///
    /// The file length must be a whole number of blocks.
    pub fn open(path: impl AsRef<Path>, device: DeviceId, block_size: usize) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        let dev = Self::from_file(file, device, block_size, len, writable)?;
        info!(
            target: "cairn::block",
            path = %path.as_ref().display(),
            device = device.0,
            block_count = dev.block_count,
            writable = dev.writable,
            "device_open"
        );
        Ok(dev)
    }

    /// Create (or truncate) an image sized to `block_count` blocks.
    pub fn create(
        path: impl AsRef<Path>,
        device: DeviceId,
        block_size: usize,
        block_count: u64,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let len = block_count
            .checked_mul(block_size as u64)
            .ok_or_else(|| CairnError::Config("image length overflows u64".to_owned()))?;
        file.set_len(len)?;
        let dev = Self::from_file(file, device, block_size, len, true)?;
        info!(
            target: "cairn::block",
            path = %path.as_ref().display(),
            device = device.0,
            block_count,
            "device_create"
        );
        Ok(dev)
    }

    fn from_file(
        file: File,
        device: DeviceId,
        block_size: usize,
        len: u64,
        writable: bool,
    ) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(CairnError::Config(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        let block_size_u64 = block_size as u64;
        if len % block_size_u64 != 0 {
            return Err(CairnError::Config(format!(
                "image length {len} is not a multiple of block_size {block_size}"
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            device,
            block_size,
            block_count: len / block_size_u64,
            writable,
        })
    }

    /// The one device id this backend serves.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    fn check_addr(&self, addr: BlockAddr) -> Result<u64> {
        if addr.device != self.device {
            return Err(CairnError::UnknownDevice {
                device: addr.device.0,
            });
        }
        if addr.block.0 >= self.block_count {
            return Err(CairnError::OutOfRange {
                device: addr.device.0,
                block: addr.block.0,
                count: self.block_count,
            });
        }
        addr.block
            .byte_offset(self.block_size)
            .ok_or_else(|| CairnError::Config("block offset overflows u64".to_owned()))
    }
}

impl BlockDevice for FileDevice {
    fn read_block(&self, addr: BlockAddr, buf: &mut [u8]) -> Result<()> {
        assert_eq!(buf.len(), self.block_size, "read buffer size");
        let offset = self.check_addr(addr)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_block(&self, addr: BlockAddr, buf: &[u8]) -> Result<()> {
        assert_eq!(buf.len(), self.block_size, "write buffer size");
        if !self.writable {
            return Err(CairnError::ReadOnly);
        }
        let offset = self.check_addr(addr)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_types::BlockNumber;

    fn addr(device: u32, block: u64) -> BlockAddr {
        BlockAddr::new(DeviceId(device), BlockNumber(block))
    }

    #[test]
    fn mem_device_reads_zeroes_before_first_write() {
        let dev = MemDevice::new(512, 8);
        let mut buf = vec![0xAA_u8; 512];
        dev.read_block(addr(0, 3), &mut buf).expect("read");
        assert!(buf.iter().all(|b| *b == 0));
        assert_eq!(dev.written_blocks(), 0);
    }

    #[test]
    fn mem_device_round_trips_any_device_id() {
        let dev = MemDevice::new(512, 8);
        dev.write_block(addr(0, 2), &[7_u8; 512]).expect("write d0");
        dev.write_block(addr(9, 2), &[9_u8; 512]).expect("write d9");

        let mut buf = vec![0_u8; 512];
        dev.read_block(addr(0, 2), &mut buf).expect("read d0");
        assert_eq!(buf, vec![7_u8; 512]);
        dev.read_block(addr(9, 2), &mut buf).expect("read d9");
        assert_eq!(buf, vec![9_u8; 512]);
        assert_eq!(dev.written_blocks(), 2);
    }

    #[test]
    fn mem_device_rejects_out_of_range_block() {
        let dev = MemDevice::new(512, 8);
        let mut buf = vec![0_u8; 512];
        let err = dev.read_block(addr(0, 8), &mut buf).unwrap_err();
        assert!(matches!(
            err,
            CairnError::OutOfRange {
                block: 8,
                count: 8,
                ..
            }
        ));
    }

    #[test]
    fn file_device_round_trips_through_the_filesystem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image.bin");
        let dev = FileDevice::create(&path, DeviceId(1), 1024, 16).expect("create");
        assert_eq!(dev.block_count(), 16);

        dev.write_block(addr(1, 5), &[0x5A_u8; 1024]).expect("write");

        let reopened = FileDevice::open(&path, DeviceId(1), 1024).expect("open");
        let mut buf = vec![0_u8; 1024];
        reopened.read_block(addr(1, 5), &mut buf).expect("read");
        assert_eq!(buf, vec![0x5A_u8; 1024]);
    }

    #[test]
    fn file_device_rejects_foreign_device_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image.bin");
        let dev = FileDevice::create(&path, DeviceId(1), 1024, 4).expect("create");

        let mut buf = vec![0_u8; 1024];
        let err = dev.read_block(addr(2, 0), &mut buf).unwrap_err();
        assert!(matches!(err, CairnError::UnknownDevice { device: 2 }));
    }

    #[test]
    fn file_device_rejects_unaligned_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ragged.bin");
        std::fs::write(&path, vec![0_u8; 1500]).expect("write file");

        let err = FileDevice::open(&path, DeviceId(0), 1024).unwrap_err();
        assert!(matches!(err, CairnError::Config(_)));
    }

    #[test]
    fn file_device_rejects_non_power_of_two_block_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image.bin");
        std::fs::write(&path, vec![0_u8; 3000]).expect("write file");

        let err = FileDevice::open(&path, DeviceId(0), 1500).unwrap_err();
        assert!(matches!(err, CairnError::Config(_)));
    }
}
