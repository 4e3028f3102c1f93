//! Parallel, NUMA-aware query execution engine for analytical workloads.
//!
//! This crate executes a tree of relational operators across many worker
//! threads, each pinned to a specific hardware context and operating on
//! tuple pages allocated on a specific NUMA node. Parents pull pages from
//! their children one call at a time; workers synchronize only through
//! explicit shared structures (hash tables, barriers).

#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod affinity;
pub mod alloc;
pub mod checker;
pub mod compare;
pub mod config;
pub mod error;
pub mod hash;
pub mod hashtable;
pub mod operator;
pub mod ops;
pub mod page;
pub mod perf;
pub mod schema;
pub mod sync;
pub mod topology;

// Re-exports
pub use config::Node;
pub use error::{Error, Result};
pub use operator::{Operator, ResultCode, ThreadId, MAX_THREADS};
pub use page::Page;
pub use schema::{ColumnType, Schema};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
