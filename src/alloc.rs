//! NUMA-aware tagged allocation
//!
//! Two allocation paths, selected by size. Requests up to 16 MiB are
//! served from per-NUMA-node lookaside arenas (one 1 GiB anonymous
//! mapping per node, bound with a strict policy) via a lock-free bump
//! pointer. Larger requests, and requests that find their arena
//! exhausted, fall through to a fresh anonymous mapping bound to the
//! requested node.
//!
//! Every allocation is prefixed by a 32-byte accounting header so that
//! [`deallocate`] can tell arena blocks (never reclaimed) from mapped
//! blocks (unmapped in full), and so usage can be attributed to a caller
//! and a 4-byte tag.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use static_assertions::const_assert_eq;
use tracing::{debug, warn};

use crate::topology;

/// 4-byte allocation tag, e.g. `*b"HTbS"`.
pub type Tag = [u8; 4];

/// Requests above this size bypass the lookaside arenas.
pub const FAST_PATH_LIMIT: usize = 16 * 1024 * 1024;

/// Size of each per-node lookaside arena.
const ARENA_SIZE: usize = 1 << 30;

/// Number of times a memory-policy bind is retried. Works around
/// transient kernel failures when many threads bind concurrently.
const BIND_RETRIES: usize = 1024;

/// Local allocation: memory is placed on the calling thread's node.
pub const NODE_LOCAL: i32 = -1;

#[repr(C)]
struct AllocHeader {
    /// Caller-supplied attribution token (operator address or zero).
    source: usize,
    tag: Tag,
    mmap_origin: bool,
    _pad0: [u8; 3],
    /// Total size of the block, header included.
    allocsize: usize,
    _pad1: [u8; 8],
}

const_assert_eq!(std::mem::size_of::<AllocHeader>(), 32);

const HEADER_SIZE: usize = std::mem::size_of::<AllocHeader>();

static TOTAL_BYTES: AtomicUsize = AtomicUsize::new(0);

/// Total bytes handed out by both paths since process start.
pub fn total_bytes_allocated() -> usize {
    TOTAL_BYTES.load(Ordering::Relaxed)
}

#[cfg(feature = "alloc-stats")]
mod stats {
    use super::Tag;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Histogram key: who allocated, what for, where it was asked to go
    /// and where it landed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub struct AllocKey {
        /// Caller-supplied attribution token
        pub source: usize,
        /// 4-byte tag
        pub tag: Tag,
        /// Requested node, -1 for local
        pub numa_requested: i32,
        /// Node the memory was acquired on
        pub numa_acquired: i32,
    }

    static ALLOC_STATS: Mutex<BTreeMap<AllocKey, usize>> = Mutex::new(BTreeMap::new());

    pub(super) fn update(key: AllocKey, bytes: usize) {
        *ALLOC_STATS.lock().entry(key).or_insert(0) += bytes;
    }

    /// Snapshot of the per-(source, tag, node) allocation histogram.
    pub fn snapshot() -> BTreeMap<AllocKey, usize> {
        ALLOC_STATS.lock().clone()
    }
}

#[cfg(feature = "alloc-stats")]
pub use stats::{snapshot as allocation_stats, AllocKey};

fn update_stats(source: usize, tag: Tag, numa_requested: i32, numa_acquired: i32, bytes: usize) {
    #[cfg(feature = "alloc-stats")]
    stats::update(
        stats::AllocKey { source, tag, numa_requested, numa_acquired },
        bytes,
    );
    #[cfg(not(feature = "alloc-stats"))]
    {
        let _ = (source, tag, numa_requested, numa_acquired);
    }
    TOTAL_BYTES.fetch_add(bytes, Ordering::Relaxed);
}

// Memory-policy modes and flags from linux/mempolicy.h. The libc crate
// does not expose the mbind family on all targets, so the calls go
// through syscall(2) with the ABI constants spelled out here.
#[cfg(target_os = "linux")]
mod mempolicy {
    pub const MPOL_PREFERRED: usize = 1;
    pub const MPOL_BIND: usize = 2;

    pub const MPOL_MF_STRICT: usize = 1 << 0;
    pub const MPOL_MF_MOVE: usize = 1 << 1;

    pub const MPOL_F_NODE: usize = 1 << 0;
    pub const MPOL_F_ADDR: usize = 1 << 1;

    /// Binds `[addr, addr+len)` to `node`, or sets the preferred-local
    /// policy for `node == -1`. Retried by callers.
    pub unsafe fn mbind(addr: *mut u8, len: usize, node: i32) -> i32 {
        let mask: u64 = if node < 0 { 0 } else { 1u64 << node };
        let (mode, mask_ptr, maxnode) = if node < 0 {
            (MPOL_PREFERRED, std::ptr::null::<u64>(), 0usize)
        } else {
            (MPOL_BIND, &mask as *const u64, 64usize)
        };

        // SAFETY: caller passes a mapping it owns; the node mask is a
        // single word read by the kernel before the call returns.
        unsafe {
            libc::syscall(
                libc::SYS_mbind,
                addr,
                len,
                mode,
                mask_ptr,
                maxnode,
                MPOL_MF_STRICT | MPOL_MF_MOVE,
            ) as i32
        }
    }

    /// Asks the kernel which node backs `addr`.
    pub unsafe fn node_of(addr: *const u8) -> Option<i32> {
        let mut node: libc::c_int = -1;
        // SAFETY: MPOL_F_NODE | MPOL_F_ADDR writes the backing node of
        // addr into `node`; no mask is read.
        let res = unsafe {
            libc::syscall(
                libc::SYS_get_mempolicy,
                &mut node as *mut libc::c_int,
                std::ptr::null_mut::<u64>(),
                0usize,
                addr,
                MPOL_F_NODE | MPOL_F_ADDR,
            )
        };
        (res == 0).then_some(node)
    }
}

/// Anonymous read-write mapping of `len` bytes.
///
/// Allocation failure at this level is unrecoverable; the engine treats
/// it as a fatal assertion.
fn map_anonymous(len: usize) -> NonNull<u8> {
    #[cfg(unix)]
    {
        // SAFETY: anonymous private mapping, no fd, offset zero.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert!(addr != libc::MAP_FAILED, "anonymous mmap of {len} bytes failed");
        NonNull::new(addr.cast::<u8>()).expect("mmap returned null")
    }

    #[cfg(not(unix))]
    {
        let layout = std::alloc::Layout::from_size_align(len, 64).expect("invalid layout");
        // SAFETY: layout has non-zero size at every call site.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).expect("anonymous allocation failed")
    }
}

/// Binds a fresh mapping to `node`, retrying transient failures.
fn bind_to_node(addr: *mut u8, len: usize, node: i32) {
    #[cfg(target_os = "linux")]
    {
        if node >= 0 && topology::numa_node_count() <= 1 {
            return;
        }
        let mut res = 0;
        for _ in 0..BIND_RETRIES {
            // SAFETY: `addr..addr+len` is a mapping we just created.
            res = unsafe { mempolicy::mbind(addr, len, node) };
            if res == 0 {
                return;
            }
        }
        warn!("mbind to node {node} kept failing ({res}); leaving default placement");
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (addr, len, node);
    }
}

/// NUMA node backing `addr`, if the kernel can report it.
pub fn node_of_address(addr: *const u8) -> Option<i32> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: get_mempolicy only reads the mapping metadata.
        return unsafe { mempolicy::node_of(addr) };
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = addr;
        None
    }
}

/// Debug check that `addr` is homed on `node`.
pub fn assert_on_node(addr: *const u8, node: i32) {
    if cfg!(debug_assertions) && topology::numa_node_count() > 1 {
        if let Some(acquired) = node_of_address(addr) {
            debug_assert_eq!(acquired, node, "allocation landed on the wrong NUMA node");
        }
    }
}

/// Debug check that `addr` is local to the calling thread's node.
pub fn assert_local(addr: *const u8) {
    if cfg!(debug_assertions) && topology::numa_node_count() > 1 {
        if let Some(acquired) = node_of_address(addr) {
            debug_assert_eq!(
                acquired,
                topology::current_numa_node() as i32,
                "allocation is not local to the calling thread"
            );
        }
    }
}

/// Per-node lookaside arena: a bound mapping consumed by a bump pointer.
struct Arena {
    base: NonNull<u8>,
    /// Bump cursor, a byte offset from `base`.
    free: AtomicUsize,
    limit: usize,
}

// SAFETY: the arena hands out disjoint ranges via CAS on `free`.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    fn new(node: i32) -> Self {
        let base = map_anonymous(ARENA_SIZE);
        bind_to_node(base.as_ptr(), ARENA_SIZE, node);
        debug!(node, size = ARENA_SIZE, "lookaside arena mapped");
        Self { base, free: AtomicUsize::new(0), limit: ARENA_SIZE }
    }

    /// Bump-allocates `size` bytes, or `None` when exhausted.
    fn bump(&self, size: usize) -> Option<NonNull<u8>> {
        let mut cur = self.free.load(Ordering::Relaxed);
        loop {
            if cur + size > self.limit {
                return None;
            }
            match self.free.compare_exchange_weak(
                cur,
                cur + size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                // SAFETY: `cur` is within the arena mapping.
                Ok(_) => return Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(cur)) }),
                Err(seen) => cur = seen,
            }
        }
    }
}

static ARENAS: OnceLock<Vec<Arena>> = OnceLock::new();

fn arenas() -> &'static [Arena] {
    ARENAS.get_or_init(|| {
        let nodes = topology::numa_node_count().max(1);
        (0..nodes as i32).map(Arena::new).collect()
    })
}

/// Writes the accounting header at `block` and returns the payload
/// pointer just past it.
///
/// # Safety
/// `block` must point to at least `HEADER_SIZE + payload` writable bytes.
unsafe fn populate_header(
    block: NonNull<u8>,
    tag: Tag,
    mmap_origin: bool,
    allocsize: usize,
    source: usize,
) -> NonNull<u8> {
    let header = block.as_ptr().cast::<AllocHeader>();
    // SAFETY: per contract, the block holds a header.
    unsafe {
        (*header).source = source;
        (*header).tag = tag;
        (*header).mmap_origin = mmap_origin;
        (*header)._pad0 = [0; 3];
        (*header).allocsize = allocsize;
        (*header)._pad1 = [0; 8];
        NonNull::new_unchecked(block.as_ptr().add(HEADER_SIZE))
    }
}

/// Fast path: bump allocation out of the node's lookaside arena.
/// Returns `None` when the arena is exhausted.
fn fast_allocate(tag: Tag, size: usize, node: i32, source: usize) -> Option<NonNull<u8>> {
    // Round up to the next 64-byte multiple to maintain alignment, then
    // add 64 bytes to eliminate false sharing.
    let allocsize = ((size + HEADER_SIZE + 64) / 64) * 64 + 64;

    let acquired = if node == NODE_LOCAL {
        topology::current_numa_node()
    } else {
        node as usize
    };

    let arena = arenas().get(acquired)?;
    let block = arena.bump(allocsize)?;

    update_stats(source, tag, node, acquired as i32, allocsize);
    // SAFETY: the bump reserved `allocsize >= HEADER_SIZE + size` bytes.
    Some(unsafe { populate_header(block, tag, false, allocsize, source) })
}

/// Slow path: dedicated anonymous mapping bound to the requested node.
fn slow_allocate(tag: Tag, size: usize, node: i32, source: usize) -> NonNull<u8> {
    let unit = page_size::get();
    let allocsize = (size + HEADER_SIZE).div_ceil(unit) * unit;

    let block = map_anonymous(allocsize);
    bind_to_node(block.as_ptr(), allocsize, node);

    update_stats(source, tag, node, node, allocsize);
    // SAFETY: the mapping holds `allocsize >= HEADER_SIZE + size` bytes.
    unsafe { populate_header(block, tag, true, allocsize, source) }
}

/// Allocates `size` tagged bytes on NUMA node `node`, or local to the
/// calling thread for [`NODE_LOCAL`].
///
/// The returned pointer sits just past the accounting header and is at
/// least 8-byte aligned. OS-level failure is a fatal assertion.
pub fn allocate_on_node(tag: Tag, size: usize, node: i32, source: usize) -> NonNull<u8> {
    let memory = if size <= FAST_PATH_LIMIT {
        fast_allocate(tag, size, node, source)
    } else {
        None
    };

    let memory = memory.unwrap_or_else(|| slow_allocate(tag, size, node, source));
    debug_assert_eq!(memory.as_ptr() as usize & 0x7, 0);

    if node == NODE_LOCAL {
        assert_local(memory.as_ptr());
    } else {
        assert_on_node(memory.as_ptr(), node);
    }

    memory
}

/// Allocates `size` tagged bytes local to the calling thread.
pub fn allocate_local(tag: Tag, size: usize, source: usize) -> NonNull<u8> {
    allocate_on_node(tag, size, NODE_LOCAL, source)
}

/// Releases an allocation made by [`allocate_on_node`].
///
/// Mapped blocks are returned to the OS; arena blocks are left in place
/// for the lifetime of the process.
pub fn deallocate(ptr: NonNull<u8>) {
    // SAFETY: every allocation carries a header immediately before the
    // payload pointer handed to the caller.
    let header = unsafe { ptr.as_ptr().sub(HEADER_SIZE).cast::<AllocHeader>() };
    let (mmap_origin, allocsize) = unsafe { ((*header).mmap_origin, (*header).allocsize) };

    if mmap_origin {
        #[cfg(unix)]
        {
            // SAFETY: unmaps exactly the block created in slow_allocate.
            let res = unsafe { libc::munmap(header.cast::<libc::c_void>(), allocsize) };
            assert_eq!(res, 0, "munmap failed");
        }
        #[cfg(not(unix))]
        {
            let layout = std::alloc::Layout::from_size_align(allocsize, 64).expect("invalid layout");
            // SAFETY: matches the alloc_zeroed in map_anonymous.
            unsafe { std::alloc::dealloc(header.cast::<u8>(), layout) };
        }
    }
}
