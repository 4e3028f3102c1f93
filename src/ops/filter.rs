//! Filter operator
//!
//! Pulls pages from its child and forwards the tuples for which a bound
//! comparison against a constant holds. The comparator is resolved once
//! at init; the data plane pays one indirect call per tuple.

use std::sync::Arc;

use crate::compare::{CompareOp, Comparator};
use crate::config::Node;
use crate::error::{Error, Result};
use crate::operator::{GetNext, ObjectState, Operator, ResultCode, ThreadId, ThreadSlots};
use crate::page::Page;
use crate::schema::{ColumnSpec, ColumnType, Schema};

use super::DEFAULT_PAGE_BYTES;

#[derive(Default)]
struct FilterSlot {
    output: Option<Page>,
    depleted: bool,
}

/// Forwards child tuples satisfying `field <op> value`.
pub struct FilterOp {
    child: Arc<dyn Operator>,
    objstate: ObjectState,
    comparator: Comparator,
    /// Constant operand, laid out as its column type.
    literal: Vec<u8>,
    slots: ThreadSlots<FilterSlot>,
}

impl FilterOp {
    /// Binds a filter over `child` from a configuration group:
    ///
    /// ```text
    /// { field = <number>; op = "<="; value = <scalar>; }
    /// ```
    pub fn new(child: Arc<dyn Operator>, cfg: &Node) -> Result<Self> {
        let schema = child.schema();
        let field = cfg.int("field")? as usize;
        if field >= schema.columns() {
            return Err(Error::IllegalSchema("filter field out of range".into()));
        }

        let op = CompareOp::parse(cfg.str("op")?)?;
        let (literal, literal_spec) = encode_literal(cfg.require("value")?, schema.column(field))?;

        let comparator = Comparator::init(
            schema.column(field),
            schema.offset(field),
            literal_spec,
            0,
            op,
        )?;

        Ok(Self {
            child,
            objstate: ObjectState::new(),
            comparator,
            literal,
            slots: ThreadSlots::new(),
        })
    }
}

/// Encodes a config scalar as a comparison operand matching `column`.
fn encode_literal(value: &Node, column: ColumnSpec) -> Result<(Vec<u8>, ColumnSpec)> {
    match (value, column.ctype) {
        (Node::Int(v), ColumnType::Int32 | ColumnType::Int64) => Ok((
            v.to_ne_bytes().to_vec(),
            ColumnSpec { ctype: ColumnType::Int64, size: 8 },
        )),
        (Node::Int(v), ColumnType::Date) => Ok((
            v.to_ne_bytes().to_vec(),
            ColumnSpec { ctype: ColumnType::Date, size: 8 },
        )),
        (Node::Int(v), ColumnType::Decimal) => Ok((
            (*v as f64).to_ne_bytes().to_vec(),
            ColumnSpec { ctype: ColumnType::Decimal, size: 8 },
        )),
        (Node::Float(v), ColumnType::Int32 | ColumnType::Int64 | ColumnType::Decimal) => Ok((
            v.to_ne_bytes().to_vec(),
            ColumnSpec { ctype: ColumnType::Decimal, size: 8 },
        )),
        (Node::Str(s), ColumnType::Char(n)) => {
            // Pad to the column width; comparison is bounded anyway.
            let mut bytes = s.as_bytes().to_vec();
            bytes.resize(n as usize, 0);
            Ok((bytes, ColumnSpec { ctype: ColumnType::Char(n), size: n as usize }))
        }
        _ => Err(Error::Config("filter value does not match the field type".into())),
    }
}

impl Operator for FilterOp {
    fn schema(&self) -> &Schema {
        self.child.schema()
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
            self.schema().tuple_size(),
            self as *const _ as usize,
        ));
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

            // Grow to the child's page size; filtering never adds tuples.
            if output.capacity() < page.used_space() {
                *output = Page::new(
                    page.used_space(),
                    self.schema().tuple_size(),
                    self as *const _ as usize,
                );
            }

            for tuple in page.tuples() {
                // SAFETY: the tuple lies in the child's page and the
                // literal buffer covers the bound width.
                let keep = unsafe {
                    self.comparator.eval(tuple.as_ptr(), self.literal.as_ptr())
                };
                if keep && !output.append(tuple) {
                    // The output page is at least as large as the input
                    // page, so a failed append means a size mismatch
                    // between parent and child pages.
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
            // Everything was filtered out; pull the next child page.
        }
    }

    fn scan_stop(&self, thread: ThreadId) -> Result<ResultCode> {
        self.child.scan_stop(thread)
    }

    fn thread_close(&self, thread: ThreadId) {
        // SAFETY: worker-exclusive slot per the protocol.
        let slot = unsafe { self.slots.get(thread) };
        slot.output = None;
        self.child.thread_close(thread);
    }

    fn destroy(&self) {
        self.child.destroy();
        self.objstate
            .deinitialize()
            .expect("destroy() on an uninitialized filter");
    }
}

impl std::fmt::Debug for FilterOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterOp").finish_non_exhaustive()
    }
}
