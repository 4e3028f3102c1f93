//! Compute and memory topology discovery
//!
//! Compute topology (socket → core → hardware context → logical CPU) is
//! probed by pinning the caller to each CPU allowed by the current
//! affinity mask and reading the processor's topology identifiers; memory
//! topology (NUMA node → logical CPUs) comes from sysfs. The two are
//! folded into a single `numa → socket → core → context` mapping used to
//! pin workers and place allocations.

use std::collections::BTreeMap;

use tracing::warn;

use crate::error::{Error, Result};

/// Mapping from (socket, core, context) to logical CPU id.
pub type ComputeTopology = Vec<Vec<Vec<u16>>>;

/// Mapping from NUMA node to the logical CPUs residing on it.
pub type MemoryTopology = Vec<Vec<u16>>;

/// Combined mapping from (numa, socket, core, context) to logical CPU id.
pub type CombinedTopology = Vec<ComputeTopology>;

/// Parse CPU list from /sys format (e.g., "0-3,8-11")
#[cfg(target_os = "linux")]
fn parse_cpu_list(cpulist: &str) -> Vec<u16> {
    let mut cpus = Vec::new();
    for part in cpulist.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<u16>(), end.parse::<u16>()) {
                for cpu in start..=end {
                    cpus.push(cpu);
                }
            }
        } else if let Ok(cpu) = part.parse::<u16>() {
            cpus.push(cpu);
        }
    }
    cpus
}

/// Logical CPUs the process is currently allowed to run on.
pub fn affinity_mask() -> Vec<u16> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: cpu_set_t is plain data; sched_getaffinity writes it.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) == 0 {
                let mut cpus = Vec::new();
                for cpu in 0..libc::CPU_SETSIZE as usize {
                    if libc::CPU_ISSET(cpu, &set) {
                        cpus.push(cpu as u16);
                    }
                }
                return cpus;
            }
        }
    }

    (0..num_cpus::get() as u16).collect()
}

/// Pins the calling thread to a single logical CPU.
pub fn pin_to_cpu(cpu: u16) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: builds a single-CPU mask and hands it to the scheduler.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu as usize, &mut set);
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                return Err(Error::Topology(
                    format!("failed to pin thread to CPU {cpu}").into(),
                ));
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = cpu;
        Err(Error::Topology("thread pinning is only supported on Linux".into()))
    }
}

#[cfg(target_os = "linux")]
fn restore_affinity(cpus: &[u16]) -> Result<()> {
    // SAFETY: rebuilds the saved mask and hands it to the scheduler.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            libc::CPU_SET(cpu as usize, &mut set);
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(Error::Topology("failed to restore affinity mask".into()));
        }
    }
    Ok(())
}

/// NUMA node the calling thread is currently executing on.
pub fn current_numa_node() -> usize {
    #[cfg(target_os = "linux")]
    {
        let mut cpu: libc::c_uint = 0;
        let mut node: libc::c_uint = 0;
        // SAFETY: getcpu fills two integers; the third argument is unused.
        let res = unsafe {
            libc::syscall(
                libc::SYS_getcpu,
                &mut cpu as *mut libc::c_uint,
                &mut node as *mut libc::c_uint,
                std::ptr::null_mut::<libc::c_void>(),
            )
        };
        if res == 0 {
            return node as usize;
        }
    }

    0
}

/// Source of per-CPU topology identifiers.
///
/// The native probe reads the processor directly; systems without it fall
/// back to [`FlatProbe`], which reports every visible CPU as a
/// single-context core on one socket.
pub trait CpuProbe {
    /// Enumerates the socket → core → context tree for the CPUs in the
    /// current affinity mask.
    fn compute_topology(&self) -> Result<ComputeTopology>;
}

/// CPUID-based probe for x86-64 processors with the extended topology leaf.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[derive(Debug, Default)]
pub struct CpuidProbe;

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
impl CpuidProbe {
    /// Reads (socket, core, context) identifiers for the current CPU.
    ///
    /// Must be called while pinned to that CPU.
    fn read_ids(&self) -> Result<(u32, u32, u32)> {
        use std::arch::x86_64::{__cpuid, __cpuid_count};

        // SAFETY: cpuid is unprivileged on x86-64.
        let max_leaf = unsafe { __cpuid(0) }.eax;
        if max_leaf < 0xB {
            return Err(Error::Topology(
                "extended topology CPUID leaf not supported; CPU too old".into(),
            ));
        }

        // SAFETY: as above.
        let smt = unsafe { __cpuid_count(0xB, 0) };
        let core = unsafe { __cpuid_count(0xB, 1) };

        let smt_level_type = (smt.ecx >> 8) & 0xFF;
        let core_level_type = (core.ecx >> 8) & 0xFF;
        if smt_level_type != 1 || core_level_type != 2 {
            return Err(Error::Topology(
                "extended topology leaf reports unexpected level types".into(),
            ));
        }

        let apic = smt.edx;
        let smt_shift = smt.eax & 0x1F;
        let core_shift = core.eax & 0x1F;

        let context = apic & ((1 << smt_shift) - 1);
        let core_id = (apic >> smt_shift) & ((1 << (core_shift - smt_shift)) - 1);
        let socket = apic >> core_shift;

        Ok((socket, core_id, context))
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
impl CpuProbe for CpuidProbe {
    fn compute_topology(&self) -> Result<ComputeTopology> {
        let mask = affinity_mask();
        if mask.is_empty() {
            return Err(Error::Topology("empty affinity mask".into()));
        }

        // socket id -> core id -> [(context id, logical cpu)]
        let mut tree: BTreeMap<u32, BTreeMap<u32, Vec<(u32, u16)>>> = BTreeMap::new();

        let mut probe_result = Ok(());
        for &cpu in &mask {
            pin_to_cpu(cpu)?;
            match self.read_ids() {
                Ok((socket, core, context)) => {
                    tree.entry(socket)
                        .or_default()
                        .entry(core)
                        .or_default()
                        .push((context, cpu));
                }
                Err(e) => {
                    probe_result = Err(e);
                    break;
                }
            }
        }
        restore_affinity(&mask)?;
        probe_result?;

        let mut ret = Vec::with_capacity(tree.len());
        for cores in tree.into_values() {
            let mut socket_entry = Vec::with_capacity(cores.len());
            for mut contexts in cores.into_values() {
                contexts.sort_unstable();
                socket_entry.push(contexts.into_iter().map(|(_, cpu)| cpu).collect());
            }
            ret.push(socket_entry);
        }
        Ok(ret)
    }
}

/// Fallback probe: one socket, every visible CPU a single-context core.
#[derive(Debug, Default)]
pub struct FlatProbe;

impl CpuProbe for FlatProbe {
    fn compute_topology(&self) -> Result<ComputeTopology> {
        let mask = affinity_mask();
        if mask.is_empty() {
            return Err(Error::Topology("empty affinity mask".into()));
        }
        Ok(vec![mask.into_iter().map(|cpu| vec![cpu]).collect()])
    }
}

/// Best-effort compute topology enumeration: the native probe when it
/// works, otherwise the flat fallback.
pub fn enumerate_compute() -> ComputeTopology {
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    {
        match CpuidProbe.compute_topology() {
            Ok(ctop) => return ctop,
            Err(e) => {
                warn!("compute topology probe failed: {e}; assuming all CPUs are cores on one socket");
            }
        }
    }

    match FlatProbe.compute_topology() {
        Ok(ctop) => ctop,
        Err(e) => {
            warn!("affinity mask unavailable: {e}; assuming a single CPU");
            vec![vec![vec![0]]]
        }
    }
}

/// Enumerates NUMA nodes and the visible CPUs residing on each.
pub fn enumerate_memory() -> MemoryTopology {
    #[cfg(target_os = "linux")]
    {
        use std::collections::BTreeSet;

        let visible: BTreeSet<u16> = affinity_mask().into_iter().collect();
        let mut nodes: BTreeMap<usize, Vec<u16>> = BTreeMap::new();

        if let Ok(entries) = std::fs::read_dir("/sys/devices/system/node/") {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(id) = name.strip_prefix("node").and_then(|s| s.parse::<usize>().ok())
                else {
                    continue;
                };
                if let Ok(cpulist) = std::fs::read_to_string(entry.path().join("cpulist")) {
                    let cpus: Vec<u16> = parse_cpu_list(&cpulist)
                        .into_iter()
                        .filter(|cpu| visible.contains(cpu))
                        .collect();
                    nodes.insert(id, cpus);
                }
            }
        }

        if nodes.len() > 1 {
            let max_node = *nodes.keys().max().unwrap_or(&0);
            let mut ret = vec![Vec::new(); max_node + 1];
            for (id, cpus) in nodes {
                ret[id] = cpus;
            }
            return ret;
        }
    }

    vec![affinity_mask()]
}

/// Number of NUMA nodes visible to the process.
pub fn numa_node_count() -> usize {
    enumerate_memory().len()
}

fn cpu_to_socket(ctop: &ComputeTopology) -> Result<BTreeMap<u16, usize>> {
    let mut ret = BTreeMap::new();
    for (socket, cores) in ctop.iter().enumerate() {
        for contexts in cores {
            for &cpu in contexts {
                if ret.insert(cpu, socket).is_some() {
                    return Err(Error::Topology(
                        format!("logical CPU {cpu} appears more than once in the topology").into(),
                    ));
                }
            }
        }
    }
    Ok(ret)
}

fn same_logical_cpus(ctop: &ComputeTopology, mtop: &MemoryTopology) -> bool {
    let mut compute: Vec<u16> = ctop
        .iter()
        .flat_map(|cores| cores.iter().flat_map(|ctx| ctx.iter().copied()))
        .collect();
    let mut memory: Vec<u16> = mtop.iter().flat_map(|cpus| cpus.iter().copied()).collect();
    compute.sort_unstable();
    memory.sort_unstable();
    compute == memory
}

fn socket_to_numa(ctop: &ComputeTopology, mtop: &MemoryTopology) -> Result<Vec<usize>> {
    const INVALID: usize = usize::MAX;

    let cpu2socket = cpu_to_socket(ctop)?;
    let mut ret = vec![INVALID; ctop.len()];

    for (numa, cpus) in mtop.iter().enumerate() {
        for cpu in cpus {
            let &socket = cpu2socket.get(cpu).ok_or_else(|| {
                Error::Topology(
                    format!("CPU {cpu} is in the memory topology but not the compute topology")
                        .into(),
                )
            })?;

            if ret[socket] == INVALID {
                ret[socket] = numa;
            } else if ret[socket] != numa {
                return Err(Error::Topology(
                    format!("socket {socket} maps to more than one NUMA node").into(),
                ));
            }
        }
    }

    Ok(ret)
}

/// Folds compute and memory topologies into the combined
/// `numa → socket → core → context` mapping.
pub fn combine(ctop: ComputeTopology, mtop: &MemoryTopology) -> Result<CombinedTopology> {
    if !same_logical_cpus(&ctop, mtop) {
        return Err(Error::Topology(
            "compute and memory topologies returned different logical CPUs".into(),
        ));
    }

    let socket2numa = socket_to_numa(&ctop, mtop)?;
    let mut ret: CombinedTopology = vec![ComputeTopology::new(); mtop.len()];
    for (socket, entry) in ctop.into_iter().enumerate() {
        ret[socket2numa[socket]].push(entry);
    }
    Ok(ret)
}

/// Best-effort enumeration of the full combined topology.
pub fn enumerate() -> Result<CombinedTopology> {
    let ctop = enumerate_compute();
    let mtop = enumerate_memory();
    combine(ctop, &mtop)
}
