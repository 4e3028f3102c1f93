//! Operator protocol
//!
//! Every operator is a node in the execution tree and honors the same
//! three-phase lifecycle on every worker:
//!
//! ```text
//! init → thread_init → scan_start → get_next* → scan_stop → thread_close → destroy
//! ```
//!
//! `init`/`destroy` run once per operator and bracket object-level
//! resources; `thread_init`/`thread_close` run once per worker and
//! bracket per-worker scratch; `scan_start`/`get_next`/`scan_stop` drive
//! one scan. Calls are strictly ordered within a worker; operators
//! synchronize across workers only through explicit shared structures.
//!
//! Pages returned by `get_next` are owned by the producer and stay valid
//! until the same worker's next call on the same operator; consumers must
//! not mutate, retain, or cross-thread them.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::config::Node;
use crate::error::{Error, Result};
use crate::page::Page;
use crate::schema::Schema;

/// Worker thread identifier.
pub type ThreadId = u16;

/// Upper bound on workers participating in a query.
pub const MAX_THREADS: usize = 128;

/// Outcome of a data-plane call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// The call succeeded; for `get_next`, the page holds at least one
    /// tuple and the caller may ask for more.
    Ready,
    /// No more data on this scan. Repeated calls keep returning
    /// `Finished` with an empty page.
    Finished,
    /// Unrecoverable data-plane failure; propagated to the root.
    Error,
}

/// Result of a `get_next` call: a status code and the producer-owned
/// output page. The page is `None` only alongside [`ResultCode::Error`].
pub type GetNext<'a> = (ResultCode, Option<&'a Page>);

/// A relational operator in the execution tree.
pub trait Operator: Send + Sync {
    /// Output schema. Valid once `init` has succeeded.
    fn schema(&self) -> &Schema;

    /// Once-per-operator setup: builds the output schema, allocates
    /// object-level shared state, and transitions the object to
    /// Initialized. Calling `init` twice is a hard error.
    fn init(&self, root: &Node, cfg: &Node) -> Result<()>;

    /// Once-per-worker setup of scratch state (output pages, iterators).
    fn thread_init(&self, thread: ThreadId) -> Result<()>;

    /// Begins a scan on this worker. `index_page`/`index_schema` carry
    /// an optional driving key set; `None` means no key pushdown.
    fn scan_start(
        &self,
        thread: ThreadId,
        index_page: Option<&Page>,
        index_schema: &Schema,
    ) -> Result<ResultCode>;

    /// Produces one output page for this worker.
    fn get_next(&self, thread: ThreadId) -> GetNext<'_>;

    /// Ends the scan; releases per-scan resources.
    fn scan_stop(&self, thread: ThreadId) -> Result<ResultCode>;

    /// Releases per-worker scratch.
    fn thread_close(&self, thread: ThreadId);

    /// Releases object-level resources and returns the object to
    /// Uninitialized. All workers must have closed first.
    fn destroy(&self);
}

const OBJ_UNINITIALIZED: u64 = 0;
const OBJ_INITIALIZED: u64 = 1;

/// Object-level lifecycle state, flipped with CAS so that double
/// initialization and double destruction are caught even under races.
#[derive(Debug)]
pub struct ObjectState(AtomicU64);

impl ObjectState {
    /// A fresh, uninitialized object.
    pub const fn new() -> Self {
        Self(AtomicU64::new(OBJ_UNINITIALIZED))
    }

    /// Uninitialized → Initialized.
    pub fn initialize(&self) -> Result<()> {
        self.0
            .compare_exchange(
                OBJ_UNINITIALIZED,
                OBJ_INITIALIZED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| Error::IllegalStateTransition {
                expected: "ObjUninitialized",
                found: "ObjInitialized",
                target: "ObjInitialized",
            })
    }

    /// Initialized → Uninitialized.
    pub fn deinitialize(&self) -> Result<()> {
        self.0
            .compare_exchange(
                OBJ_INITIALIZED,
                OBJ_UNINITIALIZED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| Error::IllegalStateTransition {
                expected: "ObjInitialized",
                found: "ObjUninitialized",
                target: "ObjUninitialized",
            })
    }

    /// True once `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.0.load(Ordering::Acquire) == OBJ_INITIALIZED
    }
}

impl Default for ObjectState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker scratch slots, one cache line apart.
///
/// The operator protocol guarantees worker `t` is the only thread that
/// touches slot `t` between `thread_init(t)` and `thread_close(t)`;
/// that protocol is what makes the interior mutability here sound.
pub struct ThreadSlots<T> {
    slots: Box<[CachePadded<UnsafeCell<T>>]>,
}

// SAFETY: each slot is accessed by exactly one worker per the protocol.
unsafe impl<T: Send> Sync for ThreadSlots<T> {}
unsafe impl<T: Send> Send for ThreadSlots<T> {}

impl<T: Default> ThreadSlots<T> {
    /// Allocates [`MAX_THREADS`] default-initialized slots.
    pub fn new() -> Self {
        Self::with(|_| T::default())
    }
}

impl<T: Default> Default for ThreadSlots<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ThreadSlots<T> {
    /// Allocates [`MAX_THREADS`] slots built by `f`.
    pub fn with(f: impl Fn(usize) -> T) -> Self {
        let slots = (0..MAX_THREADS)
            .map(|i| CachePadded::new(UnsafeCell::new(f(i))))
            .collect();
        Self { slots }
    }

    /// Mutable access to worker `thread`'s slot.
    ///
    /// # Safety
    /// Only worker `thread` may hold the returned reference, and at most
    /// one such reference may exist at a time; both are guaranteed by
    /// the per-worker call ordering of the operator protocol.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self, thread: ThreadId) -> &mut T {
        // SAFETY: exclusive access per the caller's contract.
        unsafe { &mut *self.slots[thread as usize].get() }
    }
}

impl<T> std::fmt::Debug for ThreadSlots<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSlots").field("slots", &self.slots.len()).finish()
    }
}
