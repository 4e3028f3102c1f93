//! Tuple pages
//!
//! A page is a fixed-capacity, contiguous buffer of fixed-width tuples,
//! backed by the NUMA allocator. Each page is owned by exactly one
//! operator instance on exactly one worker; parents receive pages by
//! reference for reading only, and a page stays valid until the next
//! call from that parent to the same operator on the same worker.

use std::ptr::NonNull;

use crate::alloc::{self, Tag, NODE_LOCAL};

const PAGE_TAG: Tag = *b"PgBf";

/// A producer-owned tuple buffer.
pub struct Page {
    data: NonNull<u8>,
    capacity: usize,
    used: usize,
    tuple_size: usize,
}

// SAFETY: a page is owned and mutated by a single worker; cross-thread
// hand-off only happens between lifecycle calls.
unsafe impl Send for Page {}

impl Page {
    /// Allocates a page of `capacity` bytes local to the calling thread.
    pub fn new(capacity: usize, tuple_size: usize, source: usize) -> Self {
        Self::on_node(capacity, tuple_size, NODE_LOCAL, source)
    }

    /// Allocates a page of `capacity` bytes on a specific NUMA node.
    pub fn on_node(capacity: usize, tuple_size: usize, node: i32, source: usize) -> Self {
        debug_assert!(tuple_size > 0);
        let data = alloc::allocate_on_node(PAGE_TAG, capacity.max(1), node, source);
        Self { data, capacity, used: 0, tuple_size }
    }

    /// Reserves `bytes` for a bulk write, returning the start of the
    /// reserved region, or `None` if the page cannot hold them.
    pub fn allocate(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        if self.used + bytes > self.capacity {
            return None;
        }
        // SAFETY: `used` stays within the capacity of the backing block.
        let ptr = unsafe { NonNull::new_unchecked(self.data.as_ptr().add(self.used)) };
        self.used += bytes;
        Some(ptr)
    }

    /// Copies one tuple into the page. Returns false when full.
    pub fn append(&mut self, tuple: &[u8]) -> bool {
        debug_assert_eq!(tuple.len(), self.tuple_size);
        match self.allocate(tuple.len()) {
            Some(dst) => {
                // SAFETY: `allocate` reserved exactly `tuple.len()` bytes.
                unsafe {
                    std::ptr::copy_nonoverlapping(tuple.as_ptr(), dst.as_ptr(), tuple.len());
                }
                true
            }
            None => false,
        }
    }

    /// Pointer to the `i`-th tuple, or `None` past the used region.
    #[inline]
    pub fn tuple_offset(&self, i: usize) -> Option<NonNull<u8>> {
        let start = i * self.tuple_size;
        if start + self.tuple_size > self.used {
            return None;
        }
        // SAFETY: the offset is within the used region.
        Some(unsafe { NonNull::new_unchecked(self.data.as_ptr().add(start)) })
    }

    /// The `i`-th tuple as a byte slice, or `None` past the used region.
    #[inline]
    pub fn tuple(&self, i: usize) -> Option<&[u8]> {
        self.tuple_offset(i)
            // SAFETY: `tuple_offset` bounds-checked the full tuple.
            .map(|ptr| unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.tuple_size) })
    }

    /// Number of complete tuples in the page.
    #[inline]
    pub fn num_tuples(&self) -> usize {
        self.used / self.tuple_size
    }

    /// Bytes written so far.
    #[inline]
    pub fn used_space(&self) -> usize {
        self.used
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Width of each tuple in bytes.
    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    /// Forgets all tuples; capacity is unchanged.
    pub fn clear(&mut self) {
        self.used = 0;
    }

    /// Iterates over the tuples currently in the page.
    pub fn tuples(&self) -> impl Iterator<Item = &[u8]> {
        (0..self.num_tuples()).filter_map(move |i| self.tuple(i))
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        alloc::deallocate(self.data);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .field("tuple_size", &self.tuple_size)
            .finish()
    }
}
