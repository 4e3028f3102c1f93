//! In-memory partitioned scan
//!
//! Leaf operator over pages that were staged in memory before the query
//! runs (by a loader, a previous query, or a test). Each worker owns one
//! partition of pages and hands them out one `get_next` at a time.

use parking_lot::Mutex;

use crate::config::Node;
use crate::error::{Error, Result};
use crate::operator::{GetNext, ObjectState, Operator, ResultCode, ThreadId, ThreadSlots};
use crate::page::Page;
use crate::schema::Schema;

#[derive(Default)]
struct ScanSlot {
    pages: Vec<Page>,
    cursor: usize,
    empty: Option<Page>,
}

/// Scan over staged in-memory pages, partitioned per worker.
pub struct MemScanOp {
    schema: Schema,
    objstate: ObjectState,
    /// Pages staged before execution, keyed by worker.
    staged: Mutex<Vec<(ThreadId, Vec<Page>)>>,
    slots: ThreadSlots<ScanSlot>,
}

impl MemScanOp {
    /// Creates a scan producing tuples of `schema`.
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            objstate: ObjectState::new(),
            staged: Mutex::new(Vec::new()),
            slots: ThreadSlots::new(),
        }
    }

    /// Stages `pages` as worker `thread`'s partition. Must happen before
    /// that worker's `thread_init`.
    pub fn stage(&self, thread: ThreadId, pages: Vec<Page>) {
        self.staged.lock().push((thread, pages));
    }
}

impl Operator for MemScanOp {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn init(&self, _root: &Node, _cfg: &Node) -> Result<()> {
        self.objstate.initialize()
    }

    fn thread_init(&self, thread: ThreadId) -> Result<()> {
        let mut staged = self.staged.lock();
        let pages = staged
            .iter()
            .position(|(t, _)| *t == thread)
            .map(|i| staged.swap_remove(i).1)
            .unwrap_or_default();
        drop(staged);

        for page in &pages {
            if page.tuple_size() != self.schema.tuple_size() {
                return Err(Error::IllegalSchema(
                    "staged page tuple size does not match the scan schema".into(),
                ));
            }
        }

        // SAFETY: worker-exclusive slot per the protocol.
        let slot = unsafe { self.slots.get(thread) };
        slot.pages = pages;
        slot.cursor = 0;
        slot.empty = Some(Page::new(
            self.schema.tuple_size(),
            self.schema.tuple_size(),
            self as *const _ as usize,
        ));
        Ok(())
    }

    fn scan_start(
        &self,
        thread: ThreadId,
        _index_page: Option<&Page>,
        _index_schema: &Schema,
    ) -> Result<ResultCode> {
        // SAFETY: worker-exclusive slot per the protocol.
        let slot = unsafe { self.slots.get(thread) };
        slot.cursor = 0;
        Ok(ResultCode::Ready)
    }

    fn get_next(&self, thread: ThreadId) -> GetNext<'_> {
        // SAFETY: worker-exclusive slot per the protocol.
        let slot = unsafe { self.slots.get(thread) };

        if slot.cursor < slot.pages.len() {
            let page = &slot.pages[slot.cursor];
            slot.cursor += 1;
            (ResultCode::Ready, Some(page))
        } else {
            (ResultCode::Finished, slot.empty.as_ref())
        }
    }

    fn scan_stop(&self, thread: ThreadId) -> Result<ResultCode> {
        // SAFETY: worker-exclusive slot per the protocol.
        let slot = unsafe { self.slots.get(thread) };
        slot.cursor = slot.pages.len();
        Ok(ResultCode::Ready)
    }

    fn thread_close(&self, thread: ThreadId) {
        // SAFETY: worker-exclusive slot per the protocol.
        let slot = unsafe { self.slots.get(thread) };
        slot.pages.clear();
        slot.empty = None;
    }

    fn destroy(&self) {
        self.staged.lock().clear();
        self.objstate
            .deinitialize()
            .expect("destroy() on an uninitialized scan");
    }
}

impl std::fmt::Debug for MemScanOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemScanOp").field("schema", &self.schema).finish_non_exhaustive()
    }
}
