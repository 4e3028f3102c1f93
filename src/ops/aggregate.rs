//! Hash aggregate operator
//!
//! Groups child tuples by a hashed key and folds an accumulator per
//! group (COUNT, or SUM over a 64-bit column). All workers build one
//! shared hash table, with probe-and-insert running under the bucket
//! lock, and a barrier separates the build from the output phase.
//! Afterwards each worker drains its own shard of buckets, so output
//! needs no locks.
//!
//! Group tuples are laid out as the key bytes followed by the `i64`
//! accumulator, which is exactly the output tuple layout; the output
//! phase copies them out of the table verbatim.

use std::sync::{Arc, OnceLock};

use crate::compare::{CompareOp, Comparator};
use crate::config::Node;
use crate::error::{Error, Result};
use crate::hash::TupleHasher;
use crate::hashtable::{self, HashTable};
use crate::operator::{GetNext, ObjectState, Operator, ResultCode, ThreadId, ThreadSlots};
use crate::page::Page;
use crate::schema::{ColumnType, Schema};
use crate::sync::Barrier;

use super::DEFAULT_PAGE_BYTES;

/// Group tuples stored per bucket before chains start spilling.
const TUPLES_PER_BUCKET: usize = 4;

struct AggSlot {
    output: Option<Page>,
    built: bool,
    cursor: usize,
    in_bucket: bool,
    iter: Option<hashtable::Iterator>,
}

impl Default for AggSlot {
    fn default() -> Self {
        Self { output: None, built: false, cursor: 0, in_bucket: false, iter: None }
    }
}

/// Shared-hash-table aggregate: `SELECT key, SUM(field) ... GROUP BY key`.
pub struct HashAggregateOp {
    child: Arc<dyn Operator>,
    objstate: ObjectState,
    schema: Schema,
    hasher: TupleHasher,
    /// Key position in the child tuple; `None` for a keyless aggregate.
    key: Option<(usize, usize)>,
    keycmp: Option<Comparator>,
    /// Sum operand offset in the child tuple; `None` counts tuples.
    sum_offset: Option<usize>,
    /// Accumulator offset inside a group tuple (the key width).
    acc_offset: usize,
    threads: usize,
    table: OnceLock<HashTable>,
    barrier: OnceLock<Barrier>,
    slots: ThreadSlots<AggSlot>,
}

impl HashAggregateOp {
    /// Binds an aggregate over `child` from a configuration group:
    ///
    /// ```text
    /// {
    ///     threads = <number>;
    ///     hash = { fn = ...; buckets = ...; field = <key field>; };
    ///     sumfield = <number>;   # optional; omitted means COUNT(*)
    /// }
    /// ```
    ///
    /// Workers `0..threads` must all participate in the scan; a barrier
    /// separates the shared build from shard-local output.
    pub fn new(child: Arc<dyn Operator>, cfg: &Node) -> Result<Self> {
        let input = child.schema();
        let threads = cfg.int_or("threads", 1)? as usize;
        if threads == 0 {
            return Err(Error::Config("aggregate needs at least one thread".into()));
        }

        let hash_cfg = cfg.require("hash")?;
        let hasher = TupleHasher::create(input, hash_cfg)?;

        // A keyless aggregate (alwayszero) collapses to one group.
        let key_field = if hash_cfg.str("fn")? == "alwayszero" {
            None
        } else {
            Some(hash_cfg.int("field")? as usize)
        };

        let key = key_field.map(|f| (input.offset(f), input.column(f).size));
        let keycmp = match key_field {
            Some(f) => Some(Comparator::init(
                input.column(f),
                input.offset(f),
                input.column(f),
                0,
                CompareOp::Equal,
            )?),
            None => None,
        };

        let sum_offset = match cfg.child("sumfield") {
            Some(node) => {
                let field = node.as_int()? as usize;
                if field >= input.columns() {
                    return Err(Error::IllegalSchema("sum field out of range".into()));
                }
                if input.column(field).ctype != ColumnType::Int64 {
                    return Err(Error::IllegalSchema("sum field must be a 64-bit integer".into()));
                }
                Some(input.offset(field))
            }
            None => None,
        };

        let mut out_types = Vec::new();
        if let Some(f) = key_field {
            out_types.push(input.column(f).ctype);
        }
        out_types.push(ColumnType::Int64);

        let acc_offset = key.map_or(0, |(_, size)| size);

        Ok(Self {
            child,
            objstate: ObjectState::new(),
            schema: Schema::new(&out_types),
            hasher,
            key,
            keycmp,
            sum_offset,
            acc_offset,
            threads,
            table: OnceLock::new(),
            barrier: OnceLock::new(),
            slots: ThreadSlots::new(),
        })
    }

    fn group_tuple_size(&self) -> usize {
        self.acc_offset + 8
    }

    fn table(&self) -> &HashTable {
        self.table.get().expect("init builds the hash table")
    }

    /// Folds one child tuple into the shared table. The bucket lock
    /// brackets the probe-and-insert composite.
    fn absorb(&self, tuple: &[u8]) {
        let table = self.table();
        let bucket = self.hasher.hash(tuple) as usize;
        let operand: i64 = match self.sum_offset {
            Some(offset) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&tuple[offset..offset + 8]);
                i64::from_ne_bytes(buf)
            }
            None => 1,
        };

        table.lock_bucket(bucket);

        let mut it = table.create_iterator();
        table.place_iterator(&mut it, bucket);

        let mut group = None;
        while let Some(candidate) = it.next() {
            let matches = match &self.keycmp {
                // SAFETY: candidate points at a group tuple; the key
                // occupies its first bytes, per the layout above.
                Some(cmp) => unsafe { cmp.eval(tuple.as_ptr(), candidate.as_ptr()) },
                None => true,
            };
            if matches {
                group = Some(candidate);
                break;
            }
        }

        match group {
            Some(ptr) => {
                // SAFETY: the accumulator lies inside the group tuple;
                // the bucket lock is held.
                unsafe {
                    let acc = ptr.as_ptr().add(self.acc_offset).cast::<i64>();
                    acc.write_unaligned(acc.read_unaligned().wrapping_add(operand));
                }
            }
            None => {
                let ptr = table.allocate(bucket, self as *const _ as usize);
                // SAFETY: the table reserved a full group tuple.
                unsafe {
                    if let Some((offset, size)) = self.key {
                        std::ptr::copy_nonoverlapping(
                            tuple.as_ptr().add(offset),
                            ptr.as_ptr(),
                            size,
                        );
                    }
                    ptr.as_ptr().add(self.acc_offset).cast::<i64>().write_unaligned(operand);
                }
            }
        }

        table.unlock_bucket(bucket);
    }

    /// Pulls the child dry, folding every tuple into the table.
    fn build(&self, thread: ThreadId) -> Result<()> {
        loop {
            let (code, page) = self.child.get_next(thread);
            match (code, page) {
                (ResultCode::Error, _) => {
                    return Err(Error::Io("aggregate child failed during build".into()))
                }
                (_, Some(page)) => {
                    for tuple in page.tuples() {
                        self.absorb(tuple);
                    }
                }
                (_, None) => return Err(Error::Io("aggregate child returned no page".into())),
            }
            if code == ResultCode::Finished {
                return Ok(());
            }
        }
    }
}

impl Operator for HashAggregateOp {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn init(&self, root: &Node, cfg: &Node) -> Result<()> {
        self.child.init(root, cfg)?;

        let tuple_size = self.group_tuple_size();
        let table = HashTable::init(
            self.hasher.buckets() as usize,
            tuple_size * TUPLES_PER_BUCKET,
            tuple_size,
            &[],
            self as *const _ as usize,
        )?;
        table.bucketclear(0, 1);
        self.table
            .set(table)
            .map_err(|_| Error::Config("aggregate initialized twice".into()))?;

        self.barrier
            .set(Barrier::new(self.threads)?)
            .map_err(|_| Error::Config("aggregate initialized twice".into()))?;

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
        slot.built = false;
        Ok(())
    }

    fn scan_start(
        &self,
        thread: ThreadId,
        index_page: Option<&Page>,
        index_schema: &Schema,
    ) -> Result<ResultCode> {
        let nbuckets = self.table().buckets();
        // SAFETY: worker-exclusive slot per the protocol.
        let slot = unsafe { self.slots.get(thread) };
        slot.cursor = thread as usize * nbuckets / self.threads;
        slot.in_bucket = false;
        slot.iter = Some(self.table().create_iterator());
        self.child.scan_start(thread, index_page, index_schema)
    }

    fn get_next(&self, thread: ThreadId) -> GetNext<'_> {
        // SAFETY: worker-exclusive slot per the protocol.
        let slot = unsafe { self.slots.get(thread) };

        if !slot.built {
            if self.build(thread).is_err() {
                return (ResultCode::Error, None);
            }
            slot.built = true;
            // The table is complete only once every worker got here.
            self.barrier.get().expect("init creates the barrier").arrive();
        }

        let table = self.table();
        let tuple_size = self.group_tuple_size();
        let shard_end = (thread as usize + 1) * table.buckets() / self.threads;

        let output = slot.output.as_mut().expect("thread_init allocates the output page");
        output.clear();
        let iter = slot.iter.as_mut().expect("scan_start places the iterator");

        loop {
            if !slot.in_bucket {
                if slot.cursor >= shard_end {
                    return (ResultCode::Finished, Some(output));
                }
                table.place_iterator(iter, slot.cursor);
                slot.in_bucket = true;
            }

            loop {
                if output.used_space() + tuple_size > output.capacity() {
                    return (ResultCode::Ready, Some(output));
                }
                match iter.next() {
                    Some(ptr) => {
                        // SAFETY: group tuples span `tuple_size` bytes.
                        let tuple = unsafe {
                            std::slice::from_raw_parts(ptr.as_ptr(), tuple_size)
                        };
                        output.append(tuple);
                    }
                    None => break,
                }
            }

            slot.in_bucket = false;
            slot.cursor += 1;
        }
    }

    fn scan_stop(&self, thread: ThreadId) -> Result<ResultCode> {
        self.child.scan_stop(thread)
    }

    fn thread_close(&self, thread: ThreadId) {
        // SAFETY: worker-exclusive slot per the protocol.
        let slot = unsafe { self.slots.get(thread) };
        slot.output = None;
        slot.iter = None;
        slot.built = false;
        self.child.thread_close(thread);
    }

    fn destroy(&self) {
        if let Some(table) = self.table.get() {
            // Releases overflow chains before the partitions go away.
            table.bucketclear(0, 1);
        }
        self.child.destroy();
        self.objstate
            .deinitialize()
            .expect("destroy() on an uninitialized aggregate");
    }
}

impl std::fmt::Debug for HashAggregateOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashAggregateOp")
            .field("schema", &self.schema)
            .field("threads", &self.threads)
            .finish_non_exhaustive()
    }
}
