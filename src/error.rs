//! Error types surfaced by the learner.

use std::collections::TryReserveError;
use thiserror::Error;

/// Errors that can escape a learner operation.
///
/// Transaction conflicts and stale tasks never appear here: conflicts are
/// retried by the transactional runtime and stale tasks are discarded by the
/// search workers.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum LearnError {
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A node id does not name a variable of the model.
    #[error("node {id} is out of range (model has {num_variable} variables)")]
    NodeOutOfRange {
        /// The offending id.
        id: usize,
        /// Number of variables in the model.
        num_variable: usize,
    },

    /// The initial edge list repeats an edge.
    #[error("initial graph lists edge {from} -> {to} more than once")]
    DuplicateEdge {
        /// Source of the repeated edge.
        from: usize,
        /// Destination of the repeated edge.
        to: usize,
    },

    /// Inserting the given initial edge would close a cycle.
    #[error("initial graph is cyclic: edge {from} -> {to} closes a cycle")]
    InitialGraphCyclic {
        /// Source of the rejected edge.
        from: usize,
        /// Destination of the rejected edge.
        to: usize,
    },

    /// An ancestor or descendant traversal reached its own start node.
    #[error("internal consistency violation: node {id} is reachable from itself")]
    SelfReachable {
        /// The node found on a cycle.
        id: usize,
    },

    /// Post-run verification found a directed cycle.
    #[error("internal consistency violation: learned graph contains a cycle")]
    CycleDetected,

    /// The cached totals disagree with the per-node values.
    #[error("internal consistency violation: {0}")]
    AccountingDrift(String),

    /// An allocation for a growing collection failed.
    #[error("out of memory while growing {what}")]
    OutOfMemory {
        /// Which collection was being grown.
        what: &'static str,
        /// The allocator's report.
        #[source]
        source: TryReserveError,
    },

    /// The worker thread pool could not be created.
    #[error("failed to build worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// A record set does not match the declared shape.
    #[error("invalid dataset: {0}")]
    InvalidDataset(String),
}

impl LearnError {
    pub(crate) fn out_of_memory(what: &'static str) -> impl FnOnce(TryReserveError) -> Self {
        move |source| Self::OutOfMemory { what, source }
    }
}
