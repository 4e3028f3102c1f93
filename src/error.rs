//! Error types for morsel

use std::borrow::Cow;
use std::io;
use thiserror::Error;

/// The main error type for engine operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid or missing configuration
    #[error("Invalid configuration: {0}")]
    Config(Cow<'static, str>),

    /// A thread requested a binding outside the discovered topology
    #[error("Affinitization failed for thread {thread}: {details}")]
    Affinitization {
        /// Thread whose binding could not be applied
        thread: u16,
        /// Which index was invalid or unbound
        details: Cow<'static, str>,
    },

    /// Compute and memory topologies could not be folded
    #[error("Topology error: {0}")]
    Topology(Cow<'static, str>),

    /// The operating system refused an allocation or binding
    #[error("Allocation failed: {0}")]
    AllocFailed(Cow<'static, str>),

    /// Unknown hash function name, or illegal hash parameters
    #[error("Unknown hash function: {0}")]
    UnknownHash(Cow<'static, str>),

    /// Comparison requested over an unsupported type pair or operator
    #[error("Unknown comparison: {0}")]
    UnknownComparison(Cow<'static, str>),

    /// A schema declaration does not fit the requested operation
    #[error("Illegal schema declaration: {0}")]
    IllegalSchema(Cow<'static, str>),

    /// A field's byte width cannot be read as a numeric value
    #[error("Illegal conversion of a {width}-byte field to a numeric value")]
    IllegalConversion {
        /// Width of the offending field
        width: usize,
    },

    /// Hash table cannot be serialized while overflow chains exist
    #[error("Cannot serialize hash table: {spills} overflow buckets are chained")]
    SerializeWithSpills {
        /// Spill count observed at serialize time
        spills: u64,
    },

    /// An operator lifecycle call arrived in the wrong state
    #[error("Illegal state transition: expected {expected}, found {found}, target {target}")]
    IllegalStateTransition {
        /// State the caller was required to be in
        expected: &'static str,
        /// State actually observed
        found: &'static str,
        /// State the call was trying to reach
        target: &'static str,
    },
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
