//! The buffer cache engine.
//!
//! [`BufCache`] owns a fixed pool of buffer slots and a striped hash index
//! mapping `(device, block)` to a slot. Callers check buffers out as
//! [`BufGuard`]s and the guard's lifetime is the exclusive hold on the
//! payload.
//!
//! Three kinds of lock, in a fixed hierarchy:
//!
//! - one **bucket lock** per hash bucket, protecting that bucket's entry
//!   list and the refcounts of the entries in it;
//! - a single **claim lock** serializing every cross-bucket scan for an
//!   idle slot, so two threads can never claim the same slot for two
//!   different identities;
//! - one **payload lock** per slot, blocking, held for the whole time a
//!   caller uses the bytes and across device I/O.
//!
//! Index locks are short-hold and are always released before the payload
//! lock is acquired. The claim scan holds at most one bucket lock at a
//! time; moving an entry between buckets removes it under the source lock,
//! rewrites it while it is reachable from neither bucket, and inserts it
//! under the target lock. Pin and release take a bucket lock while the
//! payload lock is held; that nesting cannot deadlock because no path
//! waits on a payload lock while holding an index lock.

use crate::BlockDevice;
use cairn_error::{CairnError, Result};
use cairn_types::{BlockAddr, BlockNumber};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

/// Pool geometry for a [`BufCache`].
///
/// Defaults: 30 slots striped over 13 buckets of 1 KiB blocks. A prime
/// bucket count spreads sequential block numbers evenly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheConfig {
    /// Number of buffer slots in the fixed pool.
    pub slots: usize,
    /// Number of hash buckets in the index.
    pub buckets: usize,
    /// Payload size of one slot, in bytes.
    pub block_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            slots: 30,
            buckets: 13,
            block_size: 1024,
        }
    }
}

/// Monotone operation counters, snapshot via [`BufCache::metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    /// Fetches answered by a resident entry.
    pub hits: u64,
    /// Fetches that claimed a slot.
    pub misses: u64,
    /// Claims that recycled a slot with a previous identity.
    pub evictions: u64,
    /// Claims that moved an entry between buckets.
    pub relocations: u64,
}

/// Index census from [`BufCache::audit`].
///
/// `entries` always equals the pool size and `duplicate_slots` and
/// `misplaced` are always zero in a consistent cache; `resident` and
/// `in_use` are advisory because holders keep operating during the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheAudit {
    /// Entries across all buckets.
    pub entries: usize,
    /// Entries with an assigned identity.
    pub resident: usize,
    /// Entries with refcount > 0.
    pub in_use: usize,
    /// Slot indices appearing in more than one bucket.
    pub duplicate_slots: usize,
    /// Resident entries outside their key's bucket.
    pub misplaced: usize,
}

#[derive(Debug, Default)]
struct Metrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    relocations: AtomicU64,
}

/// One index entry. Entries are created once at construction, one per
/// slot, and only ever move between buckets by value.
#[derive(Debug)]
struct Entry {
    key: Option<BlockAddr>,
    refcount: u32,
    slot: usize,
}

/// One pool slot: the payload and its validity flag.
///
/// `valid` is ordered by the bucket and payload locks; it is atomic so a
/// claim can clear staleness without taking the payload lock (an idle
/// slot's payload lock is always free, because holders release it before
/// the refcount can reach zero).
#[derive(Debug)]
struct Slot {
    payload: Mutex<Box<[u8]>>,
    valid: AtomicBool,
}

/// Fixed-pool block buffer cache over a [`BlockDevice`].
///
/// Reads and writes go through [`BufGuard`]s obtained from
/// [`fetch`](Self::fetch) or [`fetch_and_read`](Self::fetch_and_read).
/// The pool never grows: when every slot is held, fetches fail with
/// [`CairnError::PoolExhausted`] instead of waiting.
#[derive(Debug)]
pub struct BufCache<D: BlockDevice> {
    device: D,
    block_size: usize,
    slots: Box<[Slot]>,
    buckets: Box<[Mutex<Vec<Entry>>]>,
    claim_lock: Mutex<()>,
    metrics: Metrics,
}

impl<D: BlockDevice> BufCache<D> {
    /// Build a cache over `device` with the given geometry.
    ///
    /// Fails with [`CairnError::Config`] on a zero-sized pool, zero
    /// buckets, a zero block size, or a device whose block size disagrees
    /// with the cache's.
    pub fn new(device: D, config: CacheConfig) -> Result<Self> {
        if config.slots == 0 {
            return Err(CairnError::Config("slots must be non-zero".to_owned()));
        }
        if config.buckets == 0 {
            return Err(CairnError::Config("buckets must be non-zero".to_owned()));
        }
        if config.block_size == 0 {
            return Err(CairnError::Config("block_size must be non-zero".to_owned()));
        }
        if device.block_size() != config.block_size {
            return Err(CairnError::Config(format!(
                "device block size {} does not match cache block size {}",
                device.block_size(),
                config.block_size
            )));
        }

        let slots: Box<[Slot]> = (0..config.slots)
            .map(|_| Slot {
                payload: Mutex::new(vec![0_u8; config.block_size].into_boxed_slice()),
                valid: AtomicBool::new(false),
            })
            .collect();

        // Fresh entries all start in bucket zero; the first claim scans
        // redistribute them to their keys' buckets.
        let mut buckets: Vec<Vec<Entry>> = (0..config.buckets).map(|_| Vec::new()).collect();
        buckets[0] = (0..config.slots)
            .map(|slot| Entry {
                key: None,
                refcount: 0,
                slot,
            })
            .collect();

        info!(
            target: "cairn::cache",
            slots = config.slots,
            buckets = config.buckets,
            block_size = config.block_size,
            "cache_init"
        );

        Ok(Self {
            device,
            block_size: config.block_size,
            slots,
            buckets: buckets.into_iter().map(Mutex::new).collect(),
            claim_lock: Mutex::new(()),
            metrics: Metrics::default(),
        })
    }

    /// Number of buffer slots in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of hash buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Payload size of one slot, in bytes.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The underlying device.
    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Snapshot of the operation counters.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            relocations: self.metrics.relocations.load(Ordering::Relaxed),
        }
    }

    /// Bucket index for a block.
    ///
    /// Stripes on the block number alone; device ids are compared inside
    /// the bucket, so two devices caching the same block number share a
    /// bucket.
    #[inline]
    #[allow(clippy::cast_possible_truncation)] // remainder < bucket count, which fits usize
    fn bucket_of(&self, block: BlockNumber) -> usize {
        (block.0 % self.buckets.len() as u64) as usize
    }

    /// Fetch the addressed block, claiming a slot on a miss.
    ///
    /// The returned guard holds the buffer's payload lock; the call blocks
    /// while another holder has it. The payload may be stale unless
    /// [`BufGuard::is_valid`] reports true — use
    /// [`fetch_and_read`](Self::fetch_and_read) for read access, or fully
    /// overwrite the bytes before [`BufGuard::write`].
    pub fn fetch(&self, addr: BlockAddr) -> Result<BufGuard<'_, D>> {
        let target = self.bucket_of(addr.block);

        if let Some(slot) = self.lookup_and_ref(target, addr) {
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
            trace!(target: "cairn::cache", addr = %addr, slot, "cache_hit");
            return Ok(self.lock_payload(addr, slot));
        }

        let slot = {
            let _claim = self.claim_lock.lock();
            // The same identity may have been installed while this thread
            // waited for the claim lock; without the re-check two in-use
            // buffers could share one identity.
            if let Some(slot) = self.lookup_and_ref(target, addr) {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                trace!(target: "cairn::cache", addr = %addr, slot, "cache_hit");
                slot
            } else {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                self.claim_slot(target, addr)?
            }
        };

        Ok(self.lock_payload(addr, slot))
    }

    /// Fetch the addressed block and ensure its payload is valid.
    ///
    /// Reads the device at most once per claim: concurrent fetches of one
    /// block resolve to one slot and the payload lock serializes them, so
    /// every waiter after the first observes the filled payload.
    pub fn fetch_and_read(&self, addr: BlockAddr) -> Result<BufGuard<'_, D>> {
        let mut guard = self.fetch(addr)?;
        if !guard.is_valid() {
            // Payload lock held, no index lock: the device may block freely.
            self.device.read_block(addr, &mut guard)?;
            self.slots[guard.slot].valid.store(true, Ordering::Release);
            debug!(target: "cairn::cache", addr = %addr, slot = guard.slot, "cache_fill");
        }
        Ok(guard)
    }

    /// Drop a pin taken with [`BufGuard::pin`].
    ///
    /// Pins must be balanced: unpinning a block that is not resident, or
    /// whose refcount is zero, panics.
    pub fn unpin(&self, addr: BlockAddr) {
        let mut bucket = self.buckets[self.bucket_of(addr.block)].lock();
        let Some(entry) = bucket.iter_mut().find(|e| e.key == Some(addr)) else {
            panic!("unpin of uncached block {addr}");
        };
        assert!(entry.refcount > 0, "unpin of idle block {addr}");
        entry.refcount -= 1;
        trace!(target: "cairn::cache", addr = %addr, refcount = entry.refcount, "cache_unpin");
    }

    /// Current refcount of the addressed block, `None` if not resident.
    #[must_use]
    pub fn refcount(&self, addr: BlockAddr) -> Option<u32> {
        let bucket = self.buckets[self.bucket_of(addr.block)].lock();
        bucket
            .iter()
            .find(|e| e.key == Some(addr))
            .map(|e| e.refcount)
    }

    /// Sweep the index and report its census.
    ///
    /// Holds the claim lock for the sweep, so membership cannot change
    /// underneath it; buckets are visited one at a time and holders may
    /// still adjust refcounts, which only affects the advisory fields.
    #[must_use]
    pub fn audit(&self) -> CacheAudit {
        let _claim = self.claim_lock.lock();
        let mut seen = vec![0_u32; self.slots.len()];
        let mut audit = CacheAudit {
            entries: 0,
            resident: 0,
            in_use: 0,
            duplicate_slots: 0,
            misplaced: 0,
        };
        for (bucket_index, bucket) in self.buckets.iter().enumerate() {
            let bucket = bucket.lock();
            for entry in bucket.iter() {
                audit.entries += 1;
                seen[entry.slot] += 1;
                if let Some(key) = entry.key {
                    audit.resident += 1;
                    if entry.refcount > 0 {
                        audit.in_use += 1;
                    }
                    if self.bucket_of(key.block) != bucket_index {
                        audit.misplaced += 1;
                    }
                }
            }
        }
        audit.duplicate_slots = seen.iter().filter(|count| **count > 1).count();
        audit
    }

    /// Hit path: find `addr` in its bucket and take a reference.
    ///
    /// The increment happens under the bucket lock — never under the
    /// payload lock, which the caller acquires only after this returns.
    /// An idle resident entry is revived the same way.
    fn lookup_and_ref(&self, target: usize, addr: BlockAddr) -> Option<usize> {
        let mut bucket = self.buckets[target].lock();
        let entry = bucket.iter_mut().find(|e| e.key == Some(addr))?;
        entry.refcount += 1;
        Some(entry.slot)
    }

    /// Miss path: first-fit scan for an idle slot, wrapping from the
    /// target bucket. Caller holds the claim lock.
    ///
    /// At most one bucket lock is held at any point. A cross-bucket move
    /// removes the entry under the source lock, rewrites it while it is
    /// reachable from neither bucket, and publishes it under the target
    /// lock; the validity flag is cleared before publication so no thread
    /// can observe the new identity with the old payload marked valid.
    fn claim_slot(&self, target: usize, addr: BlockAddr) -> Result<usize> {
        let nbuckets = self.buckets.len();
        for step in 0..nbuckets {
            let index = (target + step) % nbuckets;
            let mut bucket = self.buckets[index].lock();
            let Some(pos) = bucket.iter().position(|e| e.refcount == 0) else {
                continue;
            };
            let slot = bucket[pos].slot;
            let evicted = bucket[pos].key.is_some();

            if index == target {
                self.slots[slot].valid.store(false, Ordering::Release);
                let entry = &mut bucket[pos];
                entry.key = Some(addr);
                entry.refcount = 1;
            } else {
                let mut entry = bucket.swap_remove(pos);
                drop(bucket);
                self.slots[slot].valid.store(false, Ordering::Release);
                entry.key = Some(addr);
                entry.refcount = 1;
                self.buckets[target].lock().push(entry);
                self.metrics.relocations.fetch_add(1, Ordering::Relaxed);
            }

            if evicted {
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
            }
            debug!(
                target: "cairn::cache",
                addr = %addr,
                slot,
                from_bucket = index,
                to_bucket = target,
                evicted,
                "cache_claim"
            );
            return Ok(slot);
        }

        warn!(
            target: "cairn::cache",
            addr = %addr,
            capacity = self.slots.len(),
            "pool_exhausted"
        );
        Err(CairnError::PoolExhausted {
            capacity: self.slots.len(),
        })
    }

    /// Block-acquire the slot's payload lock. No index lock may be held.
    fn lock_payload(&self, addr: BlockAddr, slot: usize) -> BufGuard<'_, D> {
        let data = self.slots[slot].payload.lock();
        BufGuard {
            cache: self,
            addr,
            slot,
            data: Some(data),
        }
    }

    /// Take an extra reference on a held buffer (pin path).
    fn pin_slot(&self, addr: BlockAddr, slot: usize) {
        let mut bucket = self.buckets[self.bucket_of(addr.block)].lock();
        let entry = bucket
            .iter_mut()
            .find(|e| e.slot == slot)
            .expect("held buffer stays in its key's bucket");
        entry.refcount += 1;
        trace!(target: "cairn::cache", addr = %addr, refcount = entry.refcount, "cache_pin");
    }

    /// Return one reference. Runs on guard drop, after the payload lock
    /// has been released, so the buffer never looks idle while its bytes
    /// are still being accessed.
    fn release_ref(&self, addr: BlockAddr, slot: usize) {
        let mut bucket = self.buckets[self.bucket_of(addr.block)].lock();
        let entry = bucket
            .iter_mut()
            .find(|e| e.slot == slot)
            .expect("held buffer stays in its key's bucket");
        entry.refcount -= 1;
        trace!(target: "cairn::cache", addr = %addr, refcount = entry.refcount, "cache_release");
    }
}

/// Exclusive hold on one cached block.
///
/// Dereferences to the payload bytes. Dropping the guard releases the
/// payload lock first and only then returns the reference, so the buffer
/// cannot be claimed while its bytes are still reachable.
#[derive(Debug)]
pub struct BufGuard<'a, D: BlockDevice> {
    cache: &'a BufCache<D>,
    addr: BlockAddr,
    slot: usize,
    data: Option<MutexGuard<'a, Box<[u8]>>>,
}

impl<D: BlockDevice> BufGuard<'_, D> {
    /// Identity of the held block.
    #[must_use]
    pub fn addr(&self) -> BlockAddr {
        self.addr
    }

    /// Whether the payload reflects the device's contents.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.cache.slots[self.slot].valid.load(Ordering::Acquire)
    }

    /// Write the payload through to the device.
    ///
    /// No refcount or validity change; the guard keeps the buffer locked
    /// across the device call.
    pub fn write(&self) -> Result<()> {
        trace!(target: "cairn::cache", addr = %self.addr, "cache_write_through");
        self.cache.device.write_block(self.addr, &self[..])
    }

    /// Keep the block resident after this guard drops.
    ///
    /// Takes one extra reference; the caller owes a matching
    /// [`BufCache::unpin`].
    pub fn pin(&self) {
        self.cache.pin_slot(self.addr, self.slot);
    }
}

impl<D: BlockDevice> Deref for BufGuard<'_, D> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().expect("payload lock held until drop")
    }
}

impl<D: BlockDevice> DerefMut for BufGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().expect("payload lock held until drop")
    }
}

impl<D: BlockDevice> Drop for BufGuard<'_, D> {
    fn drop(&mut self) {
        // Payload lock released before the refcount decrement.
        drop(self.data.take());
        self.cache.release_ref(self.addr, self.slot);
    }
}
