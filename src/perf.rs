//! Hardware performance counter instrumentation
//!
//! Reads the processor's general-purpose performance counters around a
//! delegated call and accumulates the per-call difference, per worker
//! and per call site. The number of readable counters is discovered once
//! from the processor's capability leaf and capped at a compile-time
//! maximum; which counter each slot reads can be overridden with the
//! `MORSEL_PERF_EVENT{n}` environment variables.
//!
//! Counter reads are only real on x86-64 with the `perfcount` feature
//! enabled (rdpmc requires the counters to be programmed and exposed by
//! the platform); everywhere else the reads are zero and the wrapper is
//! inert.

use std::sync::Arc;

use crate::config::Node;
use crate::error::Result;
use crate::operator::{GetNext, Operator, ResultCode, ThreadId, ThreadSlots};
use crate::page::Page;
use crate::schema::Schema;

/// Compile-time cap on sampled counters.
pub const MAX_COUNTERS: usize = 4;

/// One sampled snapshot of all counter slots.
pub type CounterSnapshot = [u64; MAX_COUNTERS];

#[cfg(all(target_arch = "x86_64", feature = "perfcount"))]
#[inline]
fn rdpmc(counter: u32) -> u64 {
    let hi: u32;
    let lo: u32;
    // SAFETY: rdpmc with CR4.PCE set is unprivileged; the platform
    // exposes it when the perfcount feature is meaningful.
    unsafe {
        std::arch::asm!(
            "rdpmc",
            in("ecx") counter,
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack, preserves_flags)
        );
    }
    ((hi as u64) << 32) | lo as u64
}

/// Number of general-purpose counters the processor exposes.
fn discover_counters() -> usize {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: cpuid is unprivileged.
        let leaf0 = unsafe { std::arch::x86_64::__cpuid(0) };
        if leaf0.eax >= 0xA {
            // SAFETY: as above.
            let caps = unsafe { std::arch::x86_64::__cpuid(0xA) };
            let gp = ((caps.eax >> 8) & 0xFF) as usize;
            return gp.min(MAX_COUNTERS);
        }
    }
    0
}

/// Performance counter reader bound to a fixed set of counter slots.
#[derive(Debug, Clone)]
pub struct PerfCounters {
    /// rdpmc counter id per slot.
    events: [u32; MAX_COUNTERS],
    active: usize,
}

impl PerfCounters {
    /// Discovers the processor's counters and the per-slot event
    /// overrides from the environment.
    pub fn init() -> Self {
        let active = discover_counters();
        let mut events = [0u32; MAX_COUNTERS];
        for (i, event) in events.iter_mut().enumerate() {
            *event = std::env::var(format!("MORSEL_PERF_EVENT{i}"))
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(i as u32);
        }
        Self { events, active }
    }

    /// Number of counter slots that produce real readings.
    pub fn active(&self) -> usize {
        self.active
    }

    /// rdpmc counter id read by `slot`.
    pub fn event(&self, slot: usize) -> u32 {
        self.events[slot]
    }

    /// Reads every active counter slot.
    #[inline]
    pub fn read(&self) -> CounterSnapshot {
        let mut out = [0u64; MAX_COUNTERS];
        #[cfg(all(target_arch = "x86_64", feature = "perfcount"))]
        for slot in 0..self.active {
            out[slot] = rdpmc(self.events[slot]);
        }
        out
    }
}

/// Instrumented call sites of the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSite {
    /// `scan_start` delegate
    ScanStart,
    /// `get_next` delegate
    GetNext,
    /// `scan_stop` delegate
    ScanStop,
}

const CALL_SITES: usize = 3;

/// Accumulated counter deltas for one worker and one call site.
#[derive(Debug, Clone, Copy, Default)]
pub struct SiteStats {
    /// Delegated calls sampled
    pub calls: u64,
    /// Summed counter deltas per slot
    pub deltas: CounterSnapshot,
}

#[derive(Default)]
struct WorkerStats {
    sites: [SiteStats; CALL_SITES],
}

/// Transparent wrapper that samples hardware counters around each
/// delegated data-plane call.
pub struct PerfCountOp {
    child: Arc<dyn Operator>,
    counters: PerfCounters,
    stats: ThreadSlots<WorkerStats>,
}

impl PerfCountOp {
    /// Wraps `child` with counter sampling.
    pub fn new(child: Arc<dyn Operator>) -> Self {
        Self { child, counters: PerfCounters::init(), stats: ThreadSlots::new() }
    }

    #[inline]
    fn sample<R>(&self, thread: ThreadId, site: CallSite, call: impl FnOnce() -> R) -> R {
        let before = self.counters.read();
        let ret = call();
        let after = self.counters.read();

        // SAFETY: the operator protocol gives this worker exclusive
        // access to its slot.
        let stats = unsafe { self.stats.get(thread) };
        let entry = &mut stats.sites[site as usize];
        entry.calls += 1;
        for slot in 0..MAX_COUNTERS {
            entry.deltas[slot] += after[slot].wrapping_sub(before[slot]);
        }
        ret
    }

    /// Accumulated statistics for one worker and call site.
    ///
    /// Meaningful between that worker's `thread_init` and
    /// `thread_close`, or after all workers have closed.
    pub fn stats(&self, thread: ThreadId, site: CallSite) -> SiteStats {
        // SAFETY: read-only snapshot under the protocol's exclusivity.
        unsafe { self.stats.get(thread) }.sites[site as usize]
    }
}

impl Operator for PerfCountOp {
    fn schema(&self) -> &Schema {
        self.child.schema()
    }

    fn init(&self, root: &Node, cfg: &Node) -> Result<()> {
        self.child.init(root, cfg)
    }

    fn thread_init(&self, thread: ThreadId) -> Result<()> {
        // SAFETY: per-worker exclusivity per the protocol.
        *unsafe { self.stats.get(thread) } = WorkerStats::default();
        self.child.thread_init(thread)
    }

    fn scan_start(
        &self,
        thread: ThreadId,
        index_page: Option<&Page>,
        index_schema: &Schema,
    ) -> Result<ResultCode> {
        self.sample(thread, CallSite::ScanStart, || {
            self.child.scan_start(thread, index_page, index_schema)
        })
    }

    fn get_next(&self, thread: ThreadId) -> GetNext<'_> {
        self.sample(thread, CallSite::GetNext, || self.child.get_next(thread))
    }

    fn scan_stop(&self, thread: ThreadId) -> Result<ResultCode> {
        self.sample(thread, CallSite::ScanStop, || self.child.scan_stop(thread))
    }

    fn thread_close(&self, thread: ThreadId) {
        self.child.thread_close(thread);
    }

    fn destroy(&self) {
        self.child.destroy();
    }
}

impl std::fmt::Debug for PerfCountOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfCountOp")
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}
