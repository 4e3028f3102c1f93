//! Projection operator
//!
//! Narrows child tuples to a configured list of fields, stitching the
//! picked columns into densely packed output tuples.

use std::sync::Arc;

use crate::config::Node;
use crate::error::{Error, Result};
use crate::operator::{GetNext, ObjectState, Operator, ResultCode, ThreadId, ThreadSlots};
use crate::page::Page;
use crate::schema::Schema;

use super::DEFAULT_PAGE_BYTES;

#[derive(Default)]
struct ProjectSlot {
    output: Option<Page>,
    staging: Vec<u8>,
    depleted: bool,
}

/// Projects child tuples onto a subset of their fields.
pub struct ProjectOp {
    child: Arc<dyn Operator>,
    objstate: ObjectState,
    schema: Schema,
    /// (source offset, width) per output column.
    picks: Vec<(usize, usize)>,
    slots: ThreadSlots<ProjectSlot>,
}

impl ProjectOp {
    /// Binds a projection over `child` from a configuration group:
    ///
    /// ```text
    /// { fields = [<number>, ...]; }
    /// ```
    pub fn new(child: Arc<dyn Operator>, cfg: &Node) -> Result<Self> {
        let input = child.schema();

        let mut picks = Vec::new();
        let mut types = Vec::new();
        for field in cfg.require("fields")?.as_list()? {
            let field = field.as_int()? as usize;
            if field >= input.columns() {
                return Err(Error::IllegalSchema("projected field out of range".into()));
            }
            picks.push((input.offset(field), input.column(field).size));
            types.push(input.column(field).ctype);
        }
        if picks.is_empty() {
            return Err(Error::Config("projection needs at least one field".into()));
        }

        Ok(Self {
            child,
            objstate: ObjectState::new(),
            schema: Schema::new(&types),
            picks,
            slots: ThreadSlots::new(),
        })
    }
}

impl Operator for ProjectOp {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn init(&self, root: &Node, cfg: &Node) -> Result<()> {
        self.child.init(root, cfg)?;
        self.objstate.initialize()
    }

    fn thread_init(&self, thread: ThreadId) -> Result<()> {
        self.child.thread_init(thread)?;
        // SAFETY: worker-exclusive slot per the protocol.
        let slot = unsafe { self.slots.get(thread) };
        slot.output = Some(Page::new(
            DEFAULT_PAGE_BYTES,
            self.schema.tuple_size(),
            self as *const _ as usize,
        ));
        slot.staging = vec![0; self.schema.tuple_size()];
        Ok(())
    }

    fn scan_start(
        &self,
        thread: ThreadId,
        index_page: Option<&Page>,
        index_schema: &Schema,
    ) -> Result<ResultCode> {
        // SAFETY: worker-exclusive slot per the protocol.
        let slot = unsafe { self.slots.get(thread) };
        slot.depleted = false;
        self.child.scan_start(thread, index_page, index_schema)
    }

    fn get_next(&self, thread: ThreadId) -> GetNext<'_> {
        // SAFETY: worker-exclusive slot per the protocol.
        let slot = unsafe { self.slots.get(thread) };
        let output = slot.output.as_mut().expect("thread_init allocates the output page");
        output.clear();

        if slot.depleted {
            return (ResultCode::Finished, Some(output));
        }

        loop {
            let (code, page) = self.child.get_next(thread);
            let page = match (code, page) {
                (ResultCode::Error, _) => return (ResultCode::Error, None),
                (_, Some(page)) => page,
                (_, None) => return (ResultCode::Error, None),
            };

            // Projection shrinks tuples, but the child may batch more
            // tuples per page than the default output can hold.
            let needed = page.num_tuples() * self.schema.tuple_size();
            if output.capacity() < needed {
                *output = Page::new(needed, self.schema.tuple_size(), self as *const _ as usize);
            }

            for tuple in page.tuples() {
                let mut at = 0;
                for &(offset, width) in &self.picks {
                    slot.staging[at..at + width].copy_from_slice(&tuple[offset..offset + width]);
                    at += width;
                }
                if !output.append(&slot.staging) {
                    return (ResultCode::Error, None);
                }
            }

            if code == ResultCode::Finished {
                slot.depleted = true;
                return (ResultCode::Finished, Some(output));
            }
            if output.num_tuples() > 0 {
                return (ResultCode::Ready, Some(output));
            }
        }
    }

    fn scan_stop(&self, thread: ThreadId) -> Result<ResultCode> {
        self.child.scan_stop(thread)
    }

    fn thread_close(&self, thread: ThreadId) {
        // SAFETY: worker-exclusive slot per the protocol.
        let slot = unsafe { self.slots.get(thread) };
        slot.output = None;
        slot.staging = Vec::new();
        self.child.thread_close(thread);
    }

    fn destroy(&self) {
        self.child.destroy();
        self.objstate
            .deinitialize()
            .expect("destroy() on an uninitialized projection");
    }
}

impl std::fmt::Debug for ProjectOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectOp").field("schema", &self.schema).finish_non_exhaustive()
    }
}
