//! Likelihood scoring and the shared score accounting.
//!
//! Network score:
//! \[ \mathrm{score} = -\tfrac12 \cdot \mathrm{numTotalParent} \cdot \ln R + R \cdot \mathrm{base} \]
//! where `R` is the record count and `base` is the sum of the per-node local
//! log-likelihoods. [`ScoreState`] caches every local term in its own
//! [`TVar`] and keeps `base` and the parent-edge total as running sums that
//! are updated in the same transaction as the graph edit they describe.

use crate::error::LearnError;
use crate::graph::Dag;
use crate::oracle::{Constraint, CountOracle};
use crate::stm::{TVar, Transaction, TxResult};

/// Hard limit on the parent-set size a local log-likelihood is computed for
/// (`2^limit` assignments are enumerated).
pub const MAX_PARENT_LIMIT: usize = 30;

/// Relative tolerance used when comparing cached sums with recomputed ones.
const DRIFT_TOLERANCE: f64 = 1e-6;

/// Structural penalty per parent edge: `-0.5 * ln(num_record)`.
#[inline]
pub fn base_penalty(num_record: usize) -> f64 {
    -0.5 * (num_record as f64).ln()
}

/// Whole-network score from its two running totals.
#[inline]
pub fn network_score(num_total_parent: i64, base_log_likelihood: f64, num_record: usize) -> f64 {
    num_total_parent as f64 * base_penalty(num_record) + num_record as f64 * base_log_likelihood
}

// ============================================================================
// Local log-likelihood
// ============================================================================

/// Reusable buffers for local log-likelihood evaluation.
#[derive(Debug, Default)]
pub struct LikelihoodScratch {
    constraints: Vec<Constraint>,
    parents: Vec<usize>,
}

impl LikelihoodScratch {
    /// Creates empty scratch space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Local log-likelihood of `id` given exactly `parents`.
    pub fn local_log_likelihood<O: CountOracle + ?Sized>(
        &mut self,
        oracle: &O,
        id: usize,
        parents: &[usize],
    ) -> f64 {
        compute_local_log_likelihood(oracle, id, parents, &mut self.constraints)
    }

    /// Local log-likelihood of `id` for `parents` with `added` inserted and
    /// `removed` taken out.
    pub fn local_log_likelihood_edited<O: CountOracle + ?Sized>(
        &mut self,
        oracle: &O,
        id: usize,
        parents: &[usize],
        added: Option<usize>,
        removed: Option<usize>,
    ) -> f64 {
        self.parents.clear();
        self.parents
            .extend(parents.iter().copied().filter(|&p| Some(p) != removed));
        if let Some(extra) = added {
            self.parents.push(extra);
        }
        compute_local_log_likelihood(oracle, id, &self.parents, &mut self.constraints)
    }
}

/// Sums `(joint / R) * ln(joint / parent_count)` over every assignment of
/// `parents` and both values of `id`. Terms with `joint == 0` contribute 0.
///
/// Cost is `2^|parents|` oracle round trips; callers bound the parent count.
pub fn compute_local_log_likelihood<O: CountOracle + ?Sized>(
    oracle: &O,
    id: usize,
    parents: &[usize],
    constraints: &mut Vec<Constraint>,
) -> f64 {
    debug_assert!(parents.len() <= MAX_PARENT_LIMIT, "parent set too large to enumerate");
    debug_assert!(!parents.contains(&id), "node {id} listed as its own parent");

    let num_record = oracle.num_record() as f64;
    if num_record == 0.0 {
        return 0.0;
    }

    let mut log_likelihood = 0.0;
    for assignment in 0..(1usize << parents.len()) {
        constraints.clear();
        constraints.extend(
            parents
                .iter()
                .enumerate()
                .map(|(bit, &p)| Constraint::new(p, ((assignment >> bit) & 1) as u8)),
        );
        let parent_count = oracle.count(constraints);
        if parent_count == 0 {
            continue;
        }

        constraints.push(Constraint::new(id, 0));
        let last = constraints.len() - 1;
        for value in 0..2u8 {
            constraints[last].value = value;
            let joint = oracle.count(constraints);
            if joint == 0 {
                continue;
            }
            let joint = joint as f64;
            log_likelihood += (joint / num_record) * (joint / parent_count as f64).ln();
        }
    }
    log_likelihood
}

// ============================================================================
// Shared accounting
// ============================================================================

/// Cached local term of one node.
///
/// `generation` counts the changes to the node's parent set; a task records
/// the generation it was computed against so stale tasks can be recognised.
#[derive(Clone, Copy, Debug, PartialEq)]
struct LocalTerm {
    value: f64,
    generation: u64,
}

/// Shared per-node likelihood cache plus the two running totals.
///
/// At every transaction boundary `base_log_likelihood == Σ local` and
/// `num_total_parent == Σ |parents(n)|`.
#[derive(Debug)]
pub struct ScoreState {
    local: Vec<TVar<LocalTerm>>,
    base_log_likelihood: TVar<f64>,
    num_total_parent: TVar<i64>,
    num_record: usize,
}

impl ScoreState {
    /// Seeds the accounting from precomputed local values.
    pub fn new(locals: &[f64], num_total_parent: i64, num_record: usize) -> Self {
        Self {
            local: locals
                .iter()
                .map(|&value| TVar::new(LocalTerm { value, generation: 0 }))
                .collect(),
            base_log_likelihood: TVar::new(locals.iter().sum()),
            num_total_parent: TVar::new(num_total_parent),
            num_record,
        }
    }

    /// Record count the scores are scaled by.
    #[inline]
    pub fn num_record(&self) -> usize {
        self.num_record
    }

    /// Cached local log-likelihood of `id`.
    pub fn local<'a>(&'a self, tx: &mut Transaction<'a>, id: usize) -> TxResult<f64> {
        Ok(self.local[id].read(tx)?.value)
    }

    /// Number of parent-set changes recorded for `id`.
    pub fn generation<'a>(&'a self, tx: &mut Transaction<'a>, id: usize) -> TxResult<u64> {
        Ok(self.local[id].read(tx)?.generation)
    }

    /// Running sum of the local terms.
    pub fn base_log_likelihood<'a>(&'a self, tx: &mut Transaction<'a>) -> TxResult<f64> {
        Ok(*self.base_log_likelihood.read(tx)?)
    }

    /// Running count of parent edges.
    pub fn num_total_parent<'a>(&'a self, tx: &mut Transaction<'a>) -> TxResult<i64> {
        Ok(*self.num_total_parent.read(tx)?)
    }

    /// Current network score.
    pub fn score<'a>(&'a self, tx: &mut Transaction<'a>) -> TxResult<f64> {
        let parents = self.num_total_parent(tx)?;
        let base = self.base_log_likelihood(tx)?;
        Ok(network_score(parents, base, self.num_record))
    }

    /// Replaces the local term of `id` after a change of its parent set,
    /// folds the difference into the base total and adjusts the parent-edge
    /// count by `parent_delta`.
    pub fn record_change<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        id: usize,
        new_local: f64,
        parent_delta: i64,
    ) -> TxResult<()> {
        let old = *self.local[id].read(tx)?;
        let old_local = old.value;
        self.local[id].write(
            tx,
            LocalTerm {
                value: new_local,
                generation: old.generation + 1,
            },
        );
        let base = self.base_log_likelihood(tx)?;
        self.base_log_likelihood.write(tx, base + new_local - old_local);
        if parent_delta != 0 {
            let total = self.num_total_parent(tx)?;
            self.num_total_parent.write(tx, total + parent_delta);
        }
        Ok(())
    }

    /// Recomputes both totals and compares them with the running values.
    ///
    /// # Errors
    /// [`LearnError::AccountingDrift`] if either total disagrees.
    pub fn check_consistency<'a>(&'a self, tx: &mut Transaction<'a>, dag: &'a Dag) -> TxResult<()> {
        let mut sum = 0.0;
        for id in 0..self.local.len() {
            sum += self.local(tx, id)?;
        }
        let base = self.base_log_likelihood(tx)?;
        if (sum - base).abs() > DRIFT_TOLERANCE * base.abs().max(1.0) {
            return Err(LearnError::AccountingDrift(format!(
                "base log-likelihood {base} differs from local sum {sum}"
            ))
            .into());
        }

        let edges = dag.edge_count(tx)?;
        let total = self.num_total_parent(tx)?;
        if i64::try_from(edges).ok() != Some(total) {
            return Err(LearnError::AccountingDrift(format!(
                "parent total {total} differs from edge count {edges}"
            ))
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
