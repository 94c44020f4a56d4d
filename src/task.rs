//! Candidate edits and the shared priority-ordered task list.

use crate::error::LearnError;
use crate::graph::EditOperation;
use crate::stm::{TVar, Transaction, TxResult};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;

// ============================================================================
// CandidateTask
// ============================================================================

/// Parent-set generations of a task's endpoints at the time it was computed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskBasis {
    /// Generation of the destination node.
    pub to: u64,
    /// Generation of the source node (checked for reversals only).
    pub from: u64,
}

/// A proposed single-edge edit and the absolute network score the graph would
/// have after it.
///
/// Tasks are plain values: created by a worker, moved into the [`TaskList`]
/// and moved out again by whichever worker pops them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CandidateTask {
    /// What to do with the edge.
    pub operation: EditOperation,
    /// Edge source.
    pub from: usize,
    /// Edge destination; the node this task was generated for.
    pub to: usize,
    /// Network score after the edit.
    pub score: f64,
    /// Snapshot the task was computed against.
    pub basis: TaskBasis,
}

impl CandidateTask {
    /// Creates a task computed against the initial generation of both
    /// endpoints.
    pub const fn new(operation: EditOperation, from: usize, to: usize, score: f64) -> Self {
        Self {
            operation,
            from,
            to,
            score,
            basis: TaskBasis { to: 0, from: 0 },
        }
    }

    /// Returns the task stamped with `basis`.
    #[must_use]
    pub const fn with_basis(mut self, basis: TaskBasis) -> Self {
        self.basis = basis;
        self
    }

    /// List order: higher score first, then lower destination, then lower
    /// source, then operation kind. `Less` means `self` is popped first.
    pub fn priority_cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.to.cmp(&other.to))
            .then_with(|| self.from.cmp(&other.from))
            .then_with(|| self.operation.cmp(&other.operation))
    }
}

impl fmt::Display for CandidateTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {} (score {:.4})", self.operation, self.from, self.to, self.score)
    }
}

// ============================================================================
// TaskList
// ============================================================================

/// Shared ordered collection of pending tasks. Every access is transactional.
#[derive(Debug)]
pub struct TaskList {
    tasks: TVar<VecDeque<CandidateTask>>,
}

impl Default for TaskList {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self {
            tasks: TVar::new(VecDeque::new()),
        }
    }

    /// Inserts `task` at its priority position.
    ///
    /// # Errors
    /// [`LearnError::OutOfMemory`] if the list cannot grow.
    pub fn push<'a>(&'a self, tx: &mut Transaction<'a>, task: CandidateTask) -> TxResult<()> {
        let current = self.tasks.read(tx)?;
        let mut next = VecDeque::new();
        next.try_reserve_exact(current.len() + 1)
            .map_err(LearnError::out_of_memory("task list"))?;
        next.extend(current.iter().copied());
        let pos = next
            .binary_search_by(|probe| probe.priority_cmp(&task))
            .unwrap_or_else(|p| p);
        next.insert(pos, task);
        self.tasks.write(tx, next);
        Ok(())
    }

    /// Removes and returns the best task, or `None` if the list is empty.
    pub fn pop<'a>(&'a self, tx: &mut Transaction<'a>) -> TxResult<Option<CandidateTask>> {
        let current = self.tasks.read(tx)?;
        let Some(&head) = current.front() else {
            return Ok(None);
        };
        let mut next = VecDeque::new();
        next.try_reserve_exact(current.len() - 1)
            .map_err(LearnError::out_of_memory("task list"))?;
        next.extend(current.iter().skip(1).copied());
        self.tasks.write(tx, next);
        Ok(Some(head))
    }

    /// Number of pending tasks.
    pub fn len<'a>(&'a self, tx: &mut Transaction<'a>) -> TxResult<usize> {
        Ok(self.tasks.read(tx)?.len())
    }

    /// Returns true if no task is pending.
    pub fn is_empty<'a>(&'a self, tx: &mut Transaction<'a>) -> TxResult<bool> {
        Ok(self.len(tx)? == 0)
    }
}

// ============================================================================
// Tests
// ============================================================================
