//! Worker thread affinitization
//!
//! Pins each worker thread to the logical CPU named by its configured
//! `(numa, socket, core, context)` binding, resolved against the combined
//! topology. Affinitization must succeed before a worker issues any
//! NUMA-local allocation; it is an error to leave a thread unbound and
//! call [`Affinitizer::affinitize`].

use tracing::debug;

use crate::config::Node;
use crate::error::{Error, Result};
use crate::operator::MAX_THREADS;
use crate::topology::{self, CombinedTopology};

/// Location of one logical CPU in the combined topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// NUMA node index
    pub numa: u16,
    /// Socket index within the node
    pub socket: u16,
    /// Core index within the socket
    pub core: u16,
    /// Hardware context index within the core
    pub context: u16,
}

impl Binding {
    /// Sentinel for an unbound index.
    pub const INVALID: u16 = u16::MAX;

    /// An unbound binding.
    pub const fn unbound() -> Self {
        Self {
            numa: Self::INVALID,
            socket: Self::INVALID,
            core: Self::INVALID,
            context: Self::INVALID,
        }
    }

    fn is_unbound(&self) -> bool {
        self.numa == Self::INVALID
            || self.socket == Self::INVALID
            || self.core == Self::INVALID
            || self.context == Self::INVALID
    }
}

/// Resolves configured thread bindings against the discovered topology
/// and pins callers to their logical CPU.
///
/// Configuration shape:
///
/// ```text
/// affinitize = [ { threadid = 0, bindto = [numa, socket, core, context] }, ... ]
/// ```
#[derive(Debug)]
pub struct Affinitizer {
    mapping: Vec<Binding>,
    topology: CombinedTopology,
}

impl Affinitizer {
    /// Parses the `affinitize` list under `node` and enumerates the
    /// machine topology. A configuration without an `affinitize` entry
    /// yields an affinitizer that rejects every thread.
    pub fn init(node: &Node) -> Result<Self> {
        let mut mapping = vec![Binding::unbound(); MAX_THREADS];

        let Some(mapnode) = node.child("affinitize") else {
            return Ok(Self { mapping, topology: CombinedTopology::new() });
        };

        let topology = topology::enumerate()?;

        for threadspec in mapnode.as_list()? {
            let threadid = threadspec.int("threadid")?;
            let bindto = threadspec.int_list("bindto", 4)?;

            let slot = usize::try_from(threadid)
                .ok()
                .filter(|&t| t < MAX_THREADS)
                .ok_or_else(|| Error::Config(format!("thread id {threadid} out of range").into()))?;

            mapping[slot] = Binding {
                numa: bindto[0] as u16,
                socket: bindto[1] as u16,
                core: bindto[2] as u16,
                context: bindto[3] as u16,
            };
        }

        Ok(Self { mapping, topology })
    }

    /// Builds an affinitizer over an explicit topology and mapping.
    /// Used by tests and by loaders that resolve bindings themselves.
    pub fn with_topology(topology: CombinedTopology, bindings: &[(usize, Binding)]) -> Self {
        let mut mapping = vec![Binding::unbound(); MAX_THREADS];
        for &(threadid, binding) in bindings {
            mapping[threadid] = binding;
        }
        Self { mapping, topology }
    }

    /// Looks up the logical CPU for `threadid`, validating every index
    /// of the binding against the topology.
    pub fn resolve(&self, threadid: u16) -> Result<u16> {
        let err = |details: String| Error::Affinitization {
            thread: threadid,
            details: details.into(),
        };

        let binding = self
            .mapping
            .get(threadid as usize)
            .ok_or_else(|| err(format!("thread id {threadid} out of range")))?;

        if binding.is_unbound() {
            return Err(err("undefined mapping".to_string()));
        }

        let numa = self
            .topology
            .get(binding.numa as usize)
            .ok_or_else(|| err(format!("NUMA node {} does not exist", binding.numa)))?;
        let socket = numa
            .get(binding.socket as usize)
            .ok_or_else(|| err(format!("socket {} does not exist", binding.socket)))?;
        let core = socket
            .get(binding.core as usize)
            .ok_or_else(|| err(format!("core {} does not exist", binding.core)))?;
        let cpu = core
            .get(binding.context as usize)
            .ok_or_else(|| err(format!("context {} does not exist", binding.context)))?;

        Ok(*cpu)
    }

    /// Pins the calling thread to the logical CPU configured for
    /// `threadid`.
    pub fn affinitize(&self, threadid: u16) -> Result<()> {
        let cpu = self.resolve(threadid)?;
        topology::pin_to_cpu(cpu).map_err(|_| Error::Affinitization {
            thread: threadid,
            details: format!("failed to pin to CPU {cpu}").into(),
        })?;
        debug!(threadid, cpu, "worker affinitized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Node;

    fn fixture_topology() -> CombinedTopology {
        // Two NUMA nodes, one socket each, two single-context cores.
        vec![
            vec![vec![vec![0], vec![2]]],
            vec![vec![vec![1], vec![3]]],
        ]
    }

    #[test]
    fn test_resolve_valid_binding() {
        let aff = Affinitizer::with_topology(
            fixture_topology(),
            &[
                (0, Binding { numa: 0, socket: 0, core: 0, context: 0 }),
                (1, Binding { numa: 1, socket: 0, core: 1, context: 0 }),
            ],
        );

        assert_eq!(aff.resolve(0).unwrap(), 0);
        assert_eq!(aff.resolve(1).unwrap(), 3);
    }

    #[test]
    fn test_resolve_rejects_unbound_thread() {
        let aff = Affinitizer::with_topology(fixture_topology(), &[]);
        let err = aff.resolve(0).unwrap_err();
        assert!(matches!(err, Error::Affinitization { thread: 0, .. }));
    }

    #[test]
    fn test_resolve_rejects_out_of_range_indices() {
        let cases = [
            Binding { numa: 2, socket: 0, core: 0, context: 0 },
            Binding { numa: 0, socket: 1, core: 0, context: 0 },
            Binding { numa: 0, socket: 0, core: 5, context: 0 },
            Binding { numa: 0, socket: 0, core: 0, context: 1 },
        ];

        for binding in cases {
            let aff = Affinitizer::with_topology(fixture_topology(), &[(7, binding)]);
            let err = aff.resolve(7).unwrap_err();
            assert!(matches!(err, Error::Affinitization { thread: 7, .. }));
        }
    }

    #[test]
    fn test_init_without_affinitize_rejects_all() {
        let aff = Affinitizer::init(&Node::group()).unwrap();
        assert!(aff.resolve(0).is_err());
    }

    #[test]
    fn test_init_parses_thread_specs() {
        let spec = Node::group()
            .with("threadid", 3)
            .with("bindto", vec![0i64, 0, 0, 0]);
        let root = Node::group().with("affinitize", vec![spec]);

        let aff = Affinitizer::init(&root).unwrap();
        // Thread 3 is bound; whether resolution succeeds depends on the
        // machine, but the binding itself must be recorded.
        assert!(!aff.mapping[3].is_unbound());
        assert!(aff.mapping[0].is_unbound());
    }

    #[test]
    fn test_init_rejects_giant_thread_id() {
        let spec = Node::group()
            .with("threadid", 100_000)
            .with("bindto", vec![0i64, 0, 0, 0]);
        let root = Node::group().with("affinitize", vec![spec]);
        assert!(Affinitizer::init(&root).is_err());
    }
}
