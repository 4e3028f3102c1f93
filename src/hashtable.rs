//! Partitioned chained hash table
//!
//! The table is split into up to four contiguous memory regions, each
//! allocated on a designated NUMA node. Bucket `i` lives in partition
//! `i & (P-1)` at slot `i >> log2(P)`, so consecutive bucket indices
//! round-robin across partitions. A bucket is a 16-byte header (spinlock,
//! used byte count, overflow pointer) followed by `bucket_size` payload
//! bytes of packed fixed-width tuples; when the primary region fills,
//! NUMA-local overflow buckets chain off the tail.
//!
//! The per-bucket spinlock is the only synchronization in the table.
//! Bytes past a bucket's `used` mark are unspecified; readers consult
//! `used` after taking the lock, or while the table is quiescent.

use std::fs::OpenOptions;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{Mmap, MmapMut};
use static_assertions::const_assert_eq;
use tracing::debug;

use crate::alloc::{self, NODE_LOCAL};
use crate::error::{Error, Result};
use crate::sync::Spinlock;

/// Maximum number of partitions.
pub const MAX_PARTITIONS: usize = 4;

const PRIMARY_TAG: alloc::Tag = *b"HTbS";
const OVERFLOW_TAG: alloc::Tag = *b"HTbO";

#[repr(C)]
struct BucketHeader {
    lock: Spinlock,
    /// Bytes used in this bucket's payload, `<= bucket_size` at rest.
    used: u16,
    _pad: u16,
    next: *mut BucketHeader,
}

const_assert_eq!(std::mem::size_of::<BucketHeader>(), 16);

const HEADER: usize = std::mem::size_of::<BucketHeader>();

impl BucketHeader {
    /// Resets the bucket and releases its overflow chain. Must not run
    /// concurrently with any other operation on the bucket.
    unsafe fn clear(&mut self) {
        self.lock.reset();
        self.used = 0;

        let mut next = self.next;
        while let Some(chained) = NonNull::new(next) {
            // SAFETY: chain nodes were produced by the allocator and are
            // not referenced anywhere else once unlinked.
            unsafe {
                next = chained.as_ref().next;
                alloc::deallocate(chained.cast::<u8>());
            }
        }
        self.next = std::ptr::null_mut();
    }
}

/// Partitioned, chained, spill-tracking hash table.
pub struct HashTable {
    partitions: [*mut u8; MAX_PARTITIONS],
    log2_partitions: u32,
    nbuckets: usize,
    bucket_size: usize,
    tuple_size: usize,
    spills: AtomicU64,
}

// SAFETY: shared mutation goes through per-bucket spinlocks; the
// not-thread-safe operations document their quiescence requirements.
unsafe impl Send for HashTable {}
unsafe impl Sync for HashTable {}

impl HashTable {
    /// Allocates a table of `nbuckets` buckets of `bucket_size` payload
    /// bytes holding tuples of `tuple_size` bytes.
    ///
    /// `partitions` names the NUMA node for each contiguous region
    /// ([`NODE_LOCAL`] for caller-local); its length must be a power of
    /// two, at most [`MAX_PARTITIONS`]. An empty slice means one locally
    /// allocated region. Call [`bucketclear`](Self::bucketclear) before
    /// first use.
    pub fn init(
        nbuckets: usize,
        bucket_size: usize,
        tuple_size: usize,
        partitions: &[i32],
        source: usize,
    ) -> Result<Self> {
        let local = [NODE_LOCAL];
        let partitions = if partitions.is_empty() { &local } else { partitions };

        if !partitions.len().is_power_of_two() || partitions.len() > MAX_PARTITIONS {
            return Err(Error::Config(
                format!(
                    "hash table partitions must be a power of two up to {MAX_PARTITIONS}, got {}",
                    partitions.len()
                )
                .into(),
            ));
        }
        if tuple_size == 0 || tuple_size > bucket_size {
            return Err(Error::Config(
                "hash table tuples must be non-empty and fit one bucket".into(),
            ));
        }
        if bucket_size > u16::MAX as usize {
            return Err(Error::Config("bucket size does not fit the used-bytes field".into()));
        }
        if nbuckets == 0 {
            return Err(Error::Config("hash table needs at least one bucket".into()));
        }

        let log2_partitions = partitions.len().trailing_zeros();
        let partsize = Self::partition_bytes(nbuckets, bucket_size, partitions.len());

        let mut bases = [std::ptr::null_mut(); MAX_PARTITIONS];
        for (i, &node) in partitions.iter().enumerate() {
            bases[i] = alloc::allocate_on_node(PRIMARY_TAG, partsize, node, source).as_ptr();
        }

        debug!(nbuckets, bucket_size, tuple_size, parts = partitions.len(), "hash table allocated");

        Ok(Self {
            partitions: bases,
            log2_partitions,
            nbuckets,
            bucket_size,
            tuple_size,
            spills: AtomicU64::new(0),
        })
    }

    fn partition_bytes(nbuckets: usize, bucket_size: usize, parts: usize) -> usize {
        (HEADER + bucket_size) * nbuckets.div_ceil(parts)
    }

    fn partition_count(&self) -> usize {
        1 << self.log2_partitions
    }

    #[inline]
    fn bucket_header(&self, bucket: usize) -> *mut BucketHeader {
        debug_assert!(bucket < self.nbuckets);
        let part = bucket & (self.partition_count() - 1);
        let idx = bucket >> self.log2_partitions;
        debug_assert!(!self.partitions[part].is_null());

        // SAFETY: idx addresses a slot inside the partition allocation.
        unsafe {
            self.partitions[part]
                .add(idx * (HEADER + self.bucket_size))
                .cast::<BucketHeader>()
        }
    }

    /// Total number of buckets.
    pub fn buckets(&self) -> usize {
        self.nbuckets
    }

    /// Resets shard `shard` of `total`: zeroes `used` and releases the
    /// overflow chains of buckets `[shard*n/total, (shard+1)*n/total)`.
    ///
    /// Must run after `init` and before the table is dropped; not safe
    /// against concurrent table operations (it bypasses bucket locks).
    pub fn bucketclear(&self, shard: usize, total: usize) {
        let start = shard * self.nbuckets / total;
        let end = (shard + 1) * self.nbuckets / total;

        for bucket in start..end {
            // SAFETY: quiescence is the caller's contract.
            unsafe { (*self.bucket_header(bucket)).clear() };
        }
    }

    /// Bump-allocates `tuple_size` bytes in `bucket`, chaining a
    /// NUMA-local overflow bucket when the chain is full. Not atomic;
    /// callers synchronize via [`atomic_allocate`](Self::atomic_allocate)
    /// or an explicit bucket lock.
    pub fn allocate(&self, bucket: usize, source: usize) -> NonNull<u8> {
        let mut last = self.bucket_header(bucket);

        // SAFETY: headers and payloads live inside the partition (or
        // chain) allocations; `used <= bucket_size` is the rest invariant.
        unsafe {
            let mut cur = last;
            while !cur.is_null() {
                debug_assert!(((*cur).used as usize) <= self.bucket_size);
                if (*cur).used as usize + self.tuple_size <= self.bucket_size {
                    let free = cur.cast::<u8>().add(HEADER + (*cur).used as usize);
                    (*cur).used += self.tuple_size as u16;
                    return NonNull::new_unchecked(free);
                }
                last = cur;
                cur = (*cur).next;
            }

            // Overflow: chain a fresh NUMA-local bucket after the tail.
            self.spills.fetch_add(1, Ordering::Relaxed);

            let chained = alloc::allocate_local(OVERFLOW_TAG, HEADER + self.bucket_size, source)
                .cast::<BucketHeader>();
            (*chained.as_ptr()).lock.reset();
            (*chained.as_ptr()).used = self.tuple_size as u16;
            (*chained.as_ptr()).next = std::ptr::null_mut();
            (*last).next = chained.as_ptr();

            NonNull::new_unchecked(chained.as_ptr().cast::<u8>().add(HEADER))
        }
    }

    /// Spinlock-protected [`allocate`](Self::allocate).
    pub fn atomic_allocate(&self, bucket: usize, source: usize) -> NonNull<u8> {
        let header = self.bucket_header(bucket);
        // SAFETY: the header is a valid bucket header for this table.
        unsafe {
            (*header).lock.lock();
            let ret = self.allocate(bucket, source);
            (*header).lock.unlock();
            ret
        }
    }

    /// Takes the bucket's spinlock. Blocks until held.
    pub fn lock_bucket(&self, bucket: usize) {
        // SAFETY: valid header for this table.
        unsafe { (*self.bucket_header(bucket)).lock.lock() }
    }

    /// Releases the bucket's spinlock.
    pub fn unlock_bucket(&self, bucket: usize) {
        // SAFETY: valid header for this table.
        unsafe { (*self.bucket_header(bucket)).lock.unlock() }
    }

    /// Issues a hardware prefetch for the bucket header.
    #[inline]
    pub fn prefetch(&self, bucket: usize) {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: prefetch is a hint; any address is acceptable.
        unsafe {
            std::arch::x86_64::_mm_prefetch::<{ std::arch::x86_64::_MM_HINT_T0 }>(
                self.bucket_header(bucket).cast::<i8>(),
            );
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = bucket;
        }
    }

    /// Creates an unpositioned iterator for this table's geometry.
    pub fn create_iterator(&self) -> Iterator {
        Iterator {
            cur: std::ptr::null(),
            free: std::ptr::null(),
            next: std::ptr::null(),
            tuple_size: self.tuple_size,
        }
    }

    /// Positions `it` at the start of `bucket`'s chain.
    ///
    /// The caller must keep the table stable while iterating, or hold
    /// the bucket lock.
    pub fn place_iterator(&self, it: &mut Iterator, bucket: usize) {
        let header = self.bucket_header(bucket);
        // SAFETY: valid header; the payload follows it in the partition.
        unsafe {
            it.cur = header.cast::<u8>().add(HEADER);
            it.free = it.cur.add((*header).used as usize);
            it.next = (*header).next;
        }
    }

    /// Number of overflow-bucket allocations so far. Approximate under
    /// concurrency, monotonically non-decreasing.
    pub fn stat_spills(&self) -> u64 {
        self.spills.load(Ordering::Relaxed)
    }

    /// Histogram of tuples per bucket: entry `k` counts the buckets
    /// holding exactly `k` tuples. Requires a quiescent table.
    pub fn stat_buckets(&self) -> Vec<u32> {
        let mut ret: Vec<u32> = Vec::new();
        let mut it = self.create_iterator();

        for bucket in 0..self.nbuckets {
            self.place_iterator(&mut it, bucket);
            let mut count = 0;
            while it.next().is_some() {
                count += 1;
            }
            if count >= ret.len() {
                ret.resize(count + 1, 0);
            }
            ret[count] += 1;
        }

        ret
    }

    /// Writes partition `part`'s primary region to `path` as a raw,
    /// host-native byte image. A `part` beyond the partition count is a
    /// no-op.
    ///
    /// The table must have no overflow chains and no concurrent users.
    pub fn serialize(&self, path: &Path, part: usize) -> Result<()> {
        if part >= self.partition_count() {
            return Ok(());
        }
        let spills = self.stat_spills();
        if spills != 0 {
            return Err(Error::SerializeWithSpills { spills });
        }

        let partsize =
            Self::partition_bytes(self.nbuckets, self.bucket_size, self.partition_count());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(partsize as u64)?;

        // SAFETY: the mapping is private to this call.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        // SAFETY: the partition allocation spans `partsize` bytes.
        let image = unsafe { std::slice::from_raw_parts(self.partitions[part], partsize) };
        map.copy_from_slice(image);
        map.flush()?;

        debug!(part, bytes = partsize, ?path, "hash table partition serialized");
        Ok(())
    }

    /// Restores partition `part`'s primary region from `path`,
    /// discarding existing data. A `part` beyond the partition count is
    /// a no-op. The table must have no concurrent users.
    pub fn deserialize(&self, path: &Path, part: usize) -> Result<()> {
        if part >= self.partition_count() {
            return Ok(());
        }

        let partsize =
            Self::partition_bytes(self.nbuckets, self.bucket_size, self.partition_count());

        let file = OpenOptions::new().read(true).open(path)?;
        // SAFETY: read-only mapping of the image file.
        let map = unsafe { Mmap::map(&file)? };
        if map.len() < partsize {
            return Err(Error::Io(format!(
                "serialized partition is {} bytes, expected {partsize}",
                map.len()
            )));
        }

        // SAFETY: the partition allocation spans `partsize` bytes; the
        // image carries null overflow pointers per the serialize
        // precondition.
        unsafe {
            std::ptr::copy_nonoverlapping(map.as_ptr(), self.partitions[part], partsize);
        }

        debug!(part, bytes = partsize, ?path, "hash table partition restored");
        Ok(())
    }
}

impl Drop for HashTable {
    fn drop(&mut self) {
        // Overflow chains are the callers' to release via bucketclear;
        // chain blocks come from the arenas, which never reclaim.
        for part in 0..self.partition_count() {
            if let Some(base) = NonNull::new(self.partitions[part]) {
                alloc::deallocate(base);
            }
            self.partitions[part] = std::ptr::null_mut();
        }
    }
}

impl std::fmt::Debug for HashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable")
            .field("nbuckets", &self.nbuckets)
            .field("bucket_size", &self.bucket_size)
            .field("tuple_size", &self.tuple_size)
            .field("partitions", &self.partition_count())
            .field("spills", &self.stat_spills())
            .finish()
    }
}

/// Tuple iterator over one bucket chain.
///
/// Yields tuples from the primary region, then follows the overflow
/// chain. A chain whose last chunk is empty terminates correctly; empty
/// chunks in the middle of a chain end iteration early (they do not
/// occur under the allocation discipline above).
pub struct Iterator {
    cur: *const u8,
    free: *const u8,
    next: *const BucketHeader,
    tuple_size: usize,
}

// SAFETY: the pointers only address memory owned by the arenas backing
// `HashTable`, which is itself `Send`/`Sync` under the same discipline.
unsafe impl Send for Iterator {}
unsafe impl Sync for Iterator {}

impl Iterator {
    /// Next tuple in the chain, or `None` when exhausted.
    #[inline]
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<NonNull<u8>> {
        debug_assert!(self.tuple_size != 0);

        if self.cur < self.free {
            let ret = self.cur;
            // SAFETY: `cur` advances within the chunk's used region.
            self.cur = unsafe { self.cur.add(self.tuple_size) };
            NonNull::new(ret.cast_mut())
        } else if !self.next.is_null() {
            // SAFETY: chain pointers reference live bucket headers.
            unsafe {
                let header = self.next;
                let ret = header.cast::<u8>().add(HEADER);
                self.cur = ret.add(self.tuple_size);
                self.free = ret.add((*header).used as usize);
                self.next = (*header).next;

                // A present-but-empty tail chunk ends the iteration.
                (ret < self.free).then(|| NonNull::new_unchecked(ret.cast_mut()))
            }
        } else {
            None
        }
    }
}
