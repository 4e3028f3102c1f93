//! Lifecycle state checker
//!
//! A transparent wrapping operator that verifies every lifecycle call
//! against the two protocol state machines:
//!
//! - object: `Uninitialized → Initialized → Uninitialized`
//! - per worker: `Uninitialized → Initialized → ScanStarted →
//!   GetNextReturnedFinished → Initialized → Uninitialized`
//!
//! Transitions are checked with CAS on per-worker state words, so a call
//! arriving on the wrong worker or in the wrong order is caught even
//! when two threads race. Violations are fatal: the checker panics with
//! the expected, found, and target states.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::config::Node;
use crate::error::Result;
use crate::operator::{GetNext, ObjectState, Operator, ResultCode, ThreadId, MAX_THREADS};
use crate::page::Page;
use crate::schema::Schema;

const THREAD_UNINITIALIZED: u64 = 0;
const THREAD_INITIALIZED: u64 = 1;
const THREAD_SCAN_STARTED: u64 = 2;
const THREAD_GET_NEXT_RETURNED_FINISHED: u64 = 3;

fn state_name(state: u64) -> &'static str {
    match state {
        THREAD_UNINITIALIZED => "ThreadUninitialized",
        THREAD_INITIALIZED => "ThreadInitialized",
        THREAD_SCAN_STARTED => "ScanStarted",
        THREAD_GET_NEXT_RETURNED_FINISHED => "GetNextReturnedFinished",
        _ => "Unknown",
    }
}

/// How many extra `get_next` calls the checker issues after `Finished`
/// to verify the terminal state is idempotent.
const FINISHED_PROBES: usize = 10;

/// Transparent operator wrapper that enforces the lifecycle state
/// machines on every call.
pub struct CallStateChecker {
    child: Arc<dyn Operator>,
    objstate: ObjectState,
    threadstate: Box<[CachePadded<AtomicU64>]>,
}

impl CallStateChecker {
    /// Wraps `child`; the wrapper forwards every call after checking it.
    pub fn new(child: Arc<dyn Operator>) -> Self {
        let threadstate = (0..MAX_THREADS)
            .map(|_| CachePadded::new(AtomicU64::new(THREAD_UNINITIALIZED)))
            .collect();
        Self { child, objstate: ObjectState::new(), threadstate }
    }

    fn transition(&self, thread: ThreadId, old: u64, new: u64) {
        assert!(self.objstate.is_initialized(), "lifecycle call before init()");

        let slot = &self.threadstate[thread as usize];
        if let Err(found) = slot.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire) {
            panic!(
                "illegal state for thread {thread}: expected {}, found {}, target {}",
                state_name(old),
                state_name(found),
                state_name(new)
            );
        }
    }

    fn thread_state(&self, thread: ThreadId) -> u64 {
        self.threadstate[thread as usize].load(Ordering::Acquire)
    }
}

impl Operator for CallStateChecker {
    fn schema(&self) -> &Schema {
        self.child.schema()
    }

    fn init(&self, root: &Node, cfg: &Node) -> Result<()> {
        self.child.init(root, cfg)?;
        self.objstate.initialize()?;
        Ok(())
    }

    fn thread_init(&self, thread: ThreadId) -> Result<()> {
        self.transition(thread, THREAD_UNINITIALIZED, THREAD_INITIALIZED);
        self.child.thread_init(thread)
    }

    fn scan_start(
        &self,
        thread: ThreadId,
        index_page: Option<&Page>,
        index_schema: &Schema,
    ) -> Result<ResultCode> {
        self.transition(thread, THREAD_INITIALIZED, THREAD_SCAN_STARTED);
        self.child.scan_start(thread, index_page, index_schema)
    }

    fn get_next(&self, thread: ThreadId) -> GetNext<'_> {
        if self.thread_state(thread) == THREAD_GET_NEXT_RETURNED_FINISHED {
            // The terminal state must be idempotent: every further call
            // returns Finished with an empty page.
            let mut ret = (ResultCode::Finished, None);
            for _ in 0..FINISHED_PROBES {
                ret = self.child.get_next(thread);
                assert_eq!(ret.0, ResultCode::Finished, "get_next after Finished must stay Finished");
                let page = ret.1.expect("Finished must carry a page");
                assert!(
                    page.tuple_offset(0).is_none(),
                    "page returned after Finished must be empty"
                );
            }
            self.transition(
                thread,
                THREAD_GET_NEXT_RETURNED_FINISHED,
                THREAD_GET_NEXT_RETURNED_FINISHED,
            );
            return ret;
        }

        self.transition(thread, THREAD_SCAN_STARTED, THREAD_SCAN_STARTED);
        let ret = self.child.get_next(thread);
        if ret.0 != ResultCode::Error {
            assert!(ret.1.is_some(), "non-Error get_next must carry a page");
        }
        if ret.0 == ResultCode::Finished {
            self.transition(thread, THREAD_SCAN_STARTED, THREAD_GET_NEXT_RETURNED_FINISHED);
        }
        ret
    }

    fn scan_stop(&self, thread: ThreadId) -> Result<ResultCode> {
        if self.thread_state(thread) == THREAD_GET_NEXT_RETURNED_FINISHED {
            self.transition(thread, THREAD_GET_NEXT_RETURNED_FINISHED, THREAD_INITIALIZED);
        } else {
            self.transition(thread, THREAD_SCAN_STARTED, THREAD_INITIALIZED);
        }
        self.child.scan_stop(thread)
    }

    fn thread_close(&self, thread: ThreadId) {
        self.transition(thread, THREAD_INITIALIZED, THREAD_UNINITIALIZED);
        self.child.thread_close(thread);
    }

    fn destroy(&self) {
        for (thread, slot) in self.threadstate.iter().enumerate() {
            assert_eq!(
                slot.load(Ordering::Acquire),
                THREAD_UNINITIALIZED,
                "destroy() called before thread {thread} unregistered"
            );
        }
        self.child.destroy();
        self.objstate
            .deinitialize()
            .expect("destroy() called on an uninitialized operator");
    }
}

impl std::fmt::Debug for CallStateChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStateChecker").finish_non_exhaustive()
    }
}
