//! Best-edit search for a single destination node.
//!
//! For a node `to` the search scores every single-edge edit that touches one
//! of `to`'s incoming edges and keeps the best one per edit kind:
//!
//! | kind    | candidates                                | penalty term                                   |
//! |---------|-------------------------------------------|------------------------------------------------|
//! | insert  | non-parents `from` with no path `to ⇝ from` | `(P + (p + 1) · insertEdgeCost) · basePenalty` |
//! | remove  | current parents                           | `(P - 1) · basePenalty`                        |
//! | reverse | parents with no other path `from ⇝ to`     | `P · basePenalty`                              |
//!
//! `P` is the network's parent-edge total and `p` the parent count of `to`.
//! A candidate's score is the penalty plus `R · (base + Δlocal)`.

use crate::graph::{Dag, EditOperation, Traversal};
use crate::learner::LearnerConfig;
use crate::oracle::CountOracle;
use crate::score::{LikelihoodScratch, ScoreState, base_penalty};
use crate::stm::{Transaction, TxResult};
use crate::task::{CandidateTask, TaskBasis};

/// Thread-private buffers for candidate search and task validation.
#[derive(Debug, Default)]
pub struct SearchScratch {
    /// Reachability buffers.
    pub traversal: Traversal,
    /// Likelihood buffers.
    pub likelihood: LikelihoodScratch,
}

impl SearchScratch {
    /// Creates scratch space for a graph of `num_node` nodes.
    pub fn new(num_node: usize) -> Self {
        Self {
            traversal: Traversal::new(num_node),
            likelihood: LikelihoodScratch::new(),
        }
    }
}

/// Read-only view of the shared search state used to propose edits.
#[derive(Debug)]
pub struct CandidateSearch<'e, O: ?Sized> {
    oracle: &'e O,
    dag: &'e Dag,
    score: &'e ScoreState,
    config: &'e LearnerConfig,
}

impl<'e, O: CountOracle + ?Sized> CandidateSearch<'e, O> {
    /// Bundles the shared state a search reads.
    pub fn new(oracle: &'e O, dag: &'e Dag, score: &'e ScoreState, config: &'e LearnerConfig) -> Self {
        Self {
            oracle,
            dag,
            score,
            config,
        }
    }

    /// Best insert into `to`, if any raises `to`'s local log-likelihood.
    pub fn find_best_insert(
        &self,
        tx: &mut Transaction<'e>,
        to: usize,
        scratch: &mut SearchScratch,
    ) -> TxResult<Option<CandidateTask>> {
        let parents = self.dag.parents(tx, to)?;
        if !self.config.has_parent_room(parents.len()) {
            return Ok(None);
        }
        let old_local = self.score.local(tx, to)?;

        let mut best_local = old_local;
        let mut best_from = None;
        for from in 0..self.dag.num_node() {
            if from == to || parents.binary_search(&from).is_ok() {
                continue;
            }
            if self.dag.is_path(tx, to, from, &mut scratch.traversal)? {
                continue;
            }
            let local = scratch
                .likelihood
                .local_log_likelihood_edited(self.oracle, to, &parents, Some(from), None);
            if local > best_local {
                best_local = local;
                best_from = Some(from);
            }
        }
        let Some(from) = best_from else {
            return Ok(None);
        };

        let num_record = self.score.num_record();
        let num_total_parent = self.score.num_total_parent(tx)? as f64;
        let base = self.score.base_log_likelihood(tx)?;
        let edge_weight = (parents.len() + 1) as f64 * self.config.insert_edge_cost;
        let penalty = (num_total_parent + edge_weight) * base_penalty(num_record);
        let score = penalty + num_record as f64 * (base + best_local - old_local);
        Ok(Some(CandidateTask::new(EditOperation::Insert, from, to, score)))
    }

    /// Best removal of one of `to`'s parents.
    pub fn find_best_remove(
        &self,
        tx: &mut Transaction<'e>,
        to: usize,
        scratch: &mut SearchScratch,
    ) -> TxResult<Option<CandidateTask>> {
        let parents = self.dag.parents(tx, to)?;
        if parents.is_empty() {
            return Ok(None);
        }
        let old_local = self.score.local(tx, to)?;

        let mut best: Option<(usize, f64)> = None;
        for &from in parents.iter() {
            let local = scratch
                .likelihood
                .local_log_likelihood_edited(self.oracle, to, &parents, None, Some(from));
            if best.is_none_or(|(_, b)| local > b) {
                best = Some((from, local));
            }
        }
        let Some((from, best_local)) = best else {
            return Ok(None);
        };

        let num_record = self.score.num_record();
        let num_total_parent = self.score.num_total_parent(tx)?;
        let base = self.score.base_log_likelihood(tx)?;
        let penalty = (num_total_parent - 1) as f64 * base_penalty(num_record);
        let score = penalty + num_record as f64 * (base + best_local - old_local);
        Ok(Some(CandidateTask::new(EditOperation::Remove, from, to, score)))
    }

    /// Best reversal of one of `to`'s incoming edges.
    pub fn find_best_reverse(
        &self,
        tx: &mut Transaction<'e>,
        to: usize,
        scratch: &mut SearchScratch,
    ) -> TxResult<Option<CandidateTask>> {
        let parents = self.dag.parents(tx, to)?;
        if parents.is_empty() {
            return Ok(None);
        }
        let old_to_local = self.score.local(tx, to)?;

        let mut best: Option<(usize, f64)> = None;
        for &from in parents.iter() {
            let from_parents = self.dag.parents(tx, from)?;
            if !self.config.has_parent_room(from_parents.len()) {
                continue;
            }
            if self
                .dag
                .is_path_without_edge(tx, from, to, &mut scratch.traversal)?
            {
                continue;
            }
            let old_from_local = self.score.local(tx, from)?;
            let new_to_local = scratch
                .likelihood
                .local_log_likelihood_edited(self.oracle, to, &parents, None, Some(from));
            let new_from_local = scratch
                .likelihood
                .local_log_likelihood_edited(self.oracle, from, &from_parents, Some(to), None);
            let delta = (new_to_local - old_to_local) + (new_from_local - old_from_local);
            if best.is_none_or(|(_, b)| delta > b) {
                best = Some((from, delta));
            }
        }
        let Some((from, delta)) = best else {
            return Ok(None);
        };

        let num_record = self.score.num_record();
        let num_total_parent = self.score.num_total_parent(tx)?;
        let base = self.score.base_log_likelihood(tx)?;
        let penalty = num_total_parent as f64 * base_penalty(num_record);
        let score = penalty + num_record as f64 * (base + delta);
        Ok(Some(CandidateTask::new(EditOperation::Reverse, from, to, score)))
    }

    /// Best edit over the enabled kinds, stamped with the generations of its
    /// endpoints. On equal scores insert wins over remove and remove over
    /// reverse.
    pub fn find_best_task(
        &self,
        tx: &mut Transaction<'e>,
        to: usize,
        scratch: &mut SearchScratch,
    ) -> TxResult<Option<CandidateTask>> {
        let mut best = self.find_best_insert(tx, to, scratch)?;
        if self.config.enable_remove {
            best = better(best, self.find_best_remove(tx, to, scratch)?);
        }
        if self.config.enable_reverse {
            best = better(best, self.find_best_reverse(tx, to, scratch)?);
        }
        let Some(task) = best else {
            return Ok(None);
        };
        let basis = TaskBasis {
            to: self.score.generation(tx, task.to)?,
            from: self.score.generation(tx, task.from)?,
        };
        Ok(Some(task.with_basis(basis)))
    }

    /// Best edit for `to` that also clears the quality bar
    /// `score > current_score / quality_factor`.
    ///
    /// The bar is applied literally: when scores are negative a quality factor
    /// above 1 makes it stricter, not looser.
    pub fn propose(
        &self,
        tx: &mut Transaction<'e>,
        to: usize,
        scratch: &mut SearchScratch,
    ) -> TxResult<Option<CandidateTask>> {
        let Some(task) = self.find_best_task(tx, to, scratch)? else {
            return Ok(None);
        };
        let bar = self.score.score(tx)? / self.config.quality_factor;
        Ok((task.score > bar).then_some(task))
    }
}

#[inline]
fn better(current: Option<CandidateTask>, challenger: Option<CandidateTask>) -> Option<CandidateTask> {
    match (current, challenger) {
        (Some(c), Some(n)) if n.score > c.score => Some(n),
        (None, n) => n,
        (c, _) => c,
    }
}

// ============================================================================
// Tests
// ============================================================================
