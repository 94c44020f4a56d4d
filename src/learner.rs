//! Parallel transactional hill-climbing driver.
//!
//! A run has two passes:
//!
//! 1. every node proposes its best edit and, if it clears the quality bar,
//!    pushes it onto the shared [`TaskList`];
//! 2. a pool of workers repeatedly pops the best task, re-validates it against
//!    the current graph, applies it together with the score accounting in one
//!    transaction and regenerates the candidates of the nodes it touched.
//!
//! The run ends when the list is empty. The graph is acyclic and the cached
//! totals are consistent at every transaction boundary.

use crate::candidate::{CandidateSearch, SearchScratch};
use crate::error::LearnError;
use crate::graph::{Dag, EditOperation, Traversal};
use crate::oracle::CountOracle;
use crate::score::{LikelihoodScratch, MAX_PARENT_LIMIT, ScoreState, network_score};
use crate::stm::{Stm, Transaction, TxCounts, TxResult};
use crate::task::{CandidateTask, TaskList};
use crossbeam::utils::CachePadded;
use rayon::prelude::*;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Learner configuration parameters.
#[derive(Clone, Debug)]
pub struct LearnerConfig {
    /// Number of search workers (and rayon threads).
    pub num_threads: usize,
    /// Maximum parents per node; `None` means only the hard enumeration
    /// limit applies.
    pub max_parents: Option<usize>,
    /// Weight of one parent edge in the insert penalty.
    pub insert_edge_cost: f64,
    /// Candidates must score above `current_score / quality_factor`.
    pub quality_factor: f64,
    /// Also consider removing edges.
    pub enable_remove: bool,
    /// Also consider reversing edges.
    pub enable_reverse: bool,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        let num_threads = std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(1);

        Self {
            num_threads,
            max_parents: None,
            insert_edge_cost: 1.0,
            quality_factor: 1.0,
            enable_remove: false,
            enable_reverse: false,
        }
    }
}

impl LearnerConfig {
    /// Checks that every field is in range.
    ///
    /// # Errors
    /// [`LearnError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), LearnError> {
        if self.num_threads == 0 {
            return Err(LearnError::InvalidConfig("num_threads must be positive".into()));
        }
        if !self.insert_edge_cost.is_finite() || self.insert_edge_cost < 0.0 {
            return Err(LearnError::InvalidConfig(format!(
                "insert_edge_cost must be finite and non-negative, got {}",
                self.insert_edge_cost
            )));
        }
        if !self.quality_factor.is_finite() || self.quality_factor < 1.0 {
            return Err(LearnError::InvalidConfig(format!(
                "quality_factor must be finite and at least 1, got {}",
                self.quality_factor
            )));
        }
        Ok(())
    }

    /// Effective parent cap.
    #[inline]
    pub fn parent_limit(&self) -> usize {
        self.max_parents
            .map_or(MAX_PARENT_LIMIT, |cap| cap.min(MAX_PARENT_LIMIT))
    }

    /// Returns true if a node with `count` parents may gain another one.
    #[inline]
    pub fn has_parent_room(&self, count: usize) -> bool {
        count < self.parent_limit()
    }
}

// ============================================================================
// Outcomes and statistics
// ============================================================================

/// Why a popped task was discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaleReason {
    /// The parent set of an endpoint changed since the task was computed.
    Superseded,
    /// Insert of an edge that is already present.
    EdgePresent,
    /// Remove or reverse of an edge that is absent.
    EdgeMissing,
    /// The edit would close a directed cycle.
    WouldCycle,
    /// The receiving node already has the maximum number of parents.
    ParentCap,
    /// The edit no longer raises the network score.
    NotImproving,
}

/// Result of re-validating a task without applying it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Verdict {
    /// The task may be applied; `score` is the network score it would give.
    Valid {
        /// Network score after the edit.
        score: f64,
    },
    /// The task must be discarded.
    Stale(StaleReason),
}

/// Result of validating and applying a task.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TaskOutcome {
    /// The edit was committed.
    Applied {
        /// Network score before the edit.
        before: f64,
        /// Network score after the edit.
        after: f64,
    },
    /// The task was discarded.
    Stale(StaleReason),
}

/// Worker counters of one learner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchStats {
    /// Tasks pushed onto the list.
    pub pushed: u64,
    /// Tasks popped from the list.
    pub popped: u64,
    /// Tasks applied.
    pub applied: u64,
    /// Tasks discarded as stale.
    pub discarded: u64,
}

#[derive(Debug, Default)]
struct AtomicStats {
    pushed: CachePadded<AtomicU64>,
    popped: CachePadded<AtomicU64>,
    applied: CachePadded<AtomicU64>,
    discarded: CachePadded<AtomicU64>,
}

impl AtomicStats {
    fn snapshot(&self) -> SearchStats {
        SearchStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Summary of a completed [`Learner::run`].
#[derive(Clone, Debug)]
pub struct RunReport {
    /// Network score before the run.
    pub initial_score: f64,
    /// Network score after the run.
    pub final_score: f64,
    /// Number of edges in the learned graph.
    pub num_edge: usize,
    /// Worker counters accumulated over the learner's lifetime.
    pub search: SearchStats,
    /// Transaction counters accumulated over the learner's lifetime.
    pub transactions: TxCounts,
    /// Wall-clock time of the run.
    pub elapsed: Duration,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "score: {:.4} -> {:.4}", self.initial_score, self.final_score)?;
        writeln!(f, "edges: {}", self.num_edge)?;
        writeln!(
            f,
            "tasks: {} pushed, {} applied, {} discarded",
            self.search.pushed, self.search.applied, self.search.discarded
        )?;
        writeln!(
            f,
            "transactions: {} commits, {} aborts",
            self.transactions.commits, self.transactions.aborts
        )?;
        write!(f, "elapsed: {:.3}s", self.elapsed.as_secs_f64())
    }
}

/// Everything a validated task needs to be applied.
#[derive(Clone, Copy, Debug)]
struct Plan {
    parent_delta: i64,
    new_to_local: f64,
    new_from_local: Option<f64>,
    before: f64,
    after: f64,
}

// ============================================================================
// Learner
// ============================================================================

/// Structure learner over a [`CountOracle`].
pub struct Learner<'o, O: ?Sized> {
    oracle: &'o O,
    config: LearnerConfig,
    dag: Dag,
    score: ScoreState,
    tasks: TaskList,
    stm: Stm,
    stats: AtomicStats,
    pool: rayon::ThreadPool,
}

impl<O: ?Sized> fmt::Debug for Learner<'_, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Learner")
            .field("config", &self.config)
            .field("num_node", &self.dag.num_node())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl<'o, O: CountOracle + ?Sized> Learner<'o, O> {
    /// Creates a learner starting from the empty graph.
    ///
    /// # Errors
    /// [`LearnError::InvalidConfig`] or [`LearnError::InvalidDataset`] for bad
    /// inputs, [`LearnError::ThreadPool`] if the worker pool cannot start.
    pub fn new(oracle: &'o O, config: LearnerConfig) -> Result<Self, LearnError> {
        Self::with_initial_edges(oracle, config, &[])
    }

    /// Creates a learner starting from `edges` (`(from, to)` pairs).
    ///
    /// # Errors
    /// As [`Learner::new`], plus [`LearnError::NodeOutOfRange`],
    /// [`LearnError::DuplicateEdge`] and [`LearnError::InitialGraphCyclic`]
    /// for a bad edge list.
    pub fn with_initial_edges(
        oracle: &'o O,
        config: LearnerConfig,
        edges: &[(usize, usize)],
    ) -> Result<Self, LearnError> {
        config.validate()?;
        let num_node = oracle.num_variable();
        let num_record = oracle.num_record();
        if num_record == 0 {
            return Err(LearnError::InvalidDataset("oracle has no records".into()));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .thread_name(|i| format!("learner-{i}"))
            .build()?;

        let dag = Dag::new(num_node);
        let stm = Stm::new();
        let mut traversal = Traversal::new(num_node);
        for &(from, to) in edges {
            dag.check_node(from)?;
            dag.check_node(to)?;
            stm.atomically(|tx| {
                if dag.has_edge(tx, from, to)? {
                    return Err(LearnError::DuplicateEdge { from, to }.into());
                }
                if dag.is_path(tx, to, from, &mut traversal)? {
                    return Err(LearnError::InitialGraphCyclic { from, to }.into());
                }
                dag.apply_operation(tx, EditOperation::Insert, from, to)
            })?;
        }

        let locals: Vec<f64> = pool.install(|| {
            (0..num_node)
                .into_par_iter()
                .map_init(LikelihoodScratch::new, |scratch, id| {
                    let parents = stm.atomically(|tx| dag.parents(tx, id))?;
                    if parents.len() > MAX_PARENT_LIMIT {
                        return Err(LearnError::InvalidConfig(format!(
                            "initial graph gives node {id} {} parents (limit {MAX_PARENT_LIMIT})",
                            parents.len()
                        )));
                    }
                    Ok(scratch.local_log_likelihood(oracle, id, &parents))
                })
                .collect::<Result<_, LearnError>>()
        })?;

        let score = ScoreState::new(&locals, edges.len() as i64, num_record);
        debug!(num_node, num_record, num_edge = edges.len(), "learner initialised");

        Ok(Self {
            oracle,
            config,
            dag,
            score,
            tasks: TaskList::new(),
            stm,
            stats: AtomicStats::default(),
            pool,
        })
    }

    /// The configuration the learner runs with.
    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    /// Number of nodes.
    pub fn num_node(&self) -> usize {
        self.dag.num_node()
    }

    /// Current network score.
    ///
    /// # Errors
    /// Only fatal transactional errors, which reads do not raise.
    pub fn score(&self) -> Result<f64, LearnError> {
        self.stm.atomically(|tx| self.score.score(tx))
    }

    /// Current edges as `(from, to)`, sorted.
    ///
    /// # Errors
    /// Only fatal transactional errors, which reads do not raise.
    pub fn edges(&self) -> Result<Vec<(usize, usize)>, LearnError> {
        self.stm.atomically(|tx| self.dag.edges(tx))
    }

    /// Number of tasks waiting in the list.
    ///
    /// # Errors
    /// Only fatal transactional errors, which reads do not raise.
    pub fn pending_tasks(&self) -> Result<usize, LearnError> {
        self.stm.atomically(|tx| self.tasks.len(tx))
    }

    /// Worker counters so far.
    pub fn stats(&self) -> SearchStats {
        self.stats.snapshot()
    }

    /// Transaction counters so far.
    pub fn transaction_counts(&self) -> TxCounts {
        self.stm.counts()
    }

    /// Checks the graph for cycles and the cached totals for drift.
    ///
    /// Every node with a parent is first walked down to its descendants so a
    /// cycle is reported against a node on it.
    ///
    /// # Errors
    /// [`LearnError::SelfReachable`], [`LearnError::CycleDetected`] or
    /// [`LearnError::AccountingDrift`].
    pub fn verify(&self) -> Result<(), LearnError> {
        let mut traversal = Traversal::new(self.dag.num_node());
        self.stm.atomically(|tx| {
            for id in 0..self.dag.num_node() {
                if !self.dag.parents(tx, id)?.is_empty() {
                    self.dag.find_descendants(tx, id, &mut traversal)?;
                }
            }
            if self.dag.is_cycle(tx, &mut traversal)? {
                return Err(LearnError::CycleDetected.into());
            }
            self.score.check_consistency(tx, &self.dag)
        })
    }

    /// Runs the search until no improving task remains.
    ///
    /// # Errors
    /// Any internal-consistency violation or allocation failure raised by a
    /// worker; the first one aborts the run.
    pub fn run(&mut self) -> Result<RunReport, LearnError> {
        let start = Instant::now();
        let this = &*self;
        let initial_score = this.score()?;
        info!(
            num_node = this.dag.num_node(),
            threads = this.config.num_threads,
            initial_score,
            "starting structure search"
        );

        this.pool.install(|| this.seed_tasks())?;
        info!(pending = this.pending_tasks()?, "initial candidates queued");

        let halt = AtomicBool::new(false);
        this.pool.install(|| {
            (0..this.config.num_threads)
                .into_par_iter()
                .try_for_each(|worker_id| {
                    this.search_worker(worker_id, &halt).inspect_err(|err| {
                        warn!(worker_id, %err, "worker failed");
                        halt.store(true, Ordering::Relaxed);
                    })
                })
        })?;

        this.verify()?;
        let report = RunReport {
            initial_score,
            final_score: this.score()?,
            num_edge: this.edges()?.len(),
            search: this.stats(),
            transactions: this.transaction_counts(),
            elapsed: start.elapsed(),
        };
        info!(
            final_score = report.final_score,
            num_edge = report.num_edge,
            applied = report.search.applied,
            discarded = report.search.discarded,
            aborts = report.transactions.aborts,
            "structure search finished"
        );
        Ok(report)
    }

    /// Best edit for `to` that clears the quality bar, computed against one
    /// consistent snapshot.
    ///
    /// # Errors
    /// [`LearnError::NodeOutOfRange`] for a bad id.
    pub fn propose(&self, to: usize) -> Result<Option<CandidateTask>, LearnError> {
        self.dag.check_node(to)?;
        let search = self.search();
        let mut scratch = SearchScratch::new(self.dag.num_node());
        self.stm.atomically(|tx| search.propose(tx, to, &mut scratch))
    }

    /// Re-validates `task` against the current graph without changing it.
    ///
    /// # Errors
    /// [`LearnError::NodeOutOfRange`] for a bad endpoint.
    pub fn validate(&self, task: &CandidateTask) -> Result<Verdict, LearnError> {
        self.dag.check_node(task.from)?;
        self.dag.check_node(task.to)?;
        let mut scratch = SearchScratch::new(self.dag.num_node());
        let checked = self
            .stm
            .atomically(|tx| self.check_task(tx, task, &mut scratch))?;
        Ok(match checked {
            Ok(plan) => Verdict::Valid { score: plan.after },
            Err(reason) => Verdict::Stale(reason),
        })
    }

    /// Validates `task` and, if it is still valid, applies it together with
    /// the score accounting in one transaction.
    ///
    /// # Errors
    /// [`LearnError::NodeOutOfRange`] for a bad endpoint,
    /// [`LearnError::OutOfMemory`] if an adjacency set cannot grow.
    pub fn apply(&self, task: &CandidateTask) -> Result<TaskOutcome, LearnError> {
        self.dag.check_node(task.from)?;
        self.dag.check_node(task.to)?;
        let mut scratch = SearchScratch::new(self.dag.num_node());
        self.stm
            .atomically(|tx| self.validate_and_apply(tx, task, &mut scratch))
    }

    // ------------------------------------------------------------------------
    // Passes
    // ------------------------------------------------------------------------

    fn search(&self) -> CandidateSearch<'_, O> {
        CandidateSearch::new(self.oracle, &self.dag, &self.score, &self.config)
    }

    fn seed_tasks(&self) -> Result<(), LearnError> {
        let num_node = self.dag.num_node();
        let search = self.search();
        (0..num_node).into_par_iter().try_for_each_init(
            || SearchScratch::new(num_node),
            |scratch, to| self.propose_and_push(&search, to, scratch),
        )
    }

    fn propose_and_push(
        &self,
        search: &CandidateSearch<'_, O>,
        to: usize,
        scratch: &mut SearchScratch,
    ) -> Result<(), LearnError> {
        let proposal = self.stm.atomically(|tx| search.propose(tx, to, scratch))?;
        if let Some(task) = proposal {
            self.stm.atomically(|tx| self.tasks.push(tx, task))?;
            self.stats.pushed.fetch_add(1, Ordering::Relaxed);
            trace!(%task, "queued candidate");
        }
        Ok(())
    }

    fn search_worker(&self, worker_id: usize, halt: &AtomicBool) -> Result<(), LearnError> {
        let search = self.search();
        let mut scratch = SearchScratch::new(self.dag.num_node());
        let mut applied = 0u64;
        let mut discarded = 0u64;

        while !halt.load(Ordering::Relaxed) {
            let Some(task) = self.stm.atomically(|tx| self.tasks.pop(tx))? else {
                break;
            };
            self.stats.popped.fetch_add(1, Ordering::Relaxed);

            match self
                .stm
                .atomically(|tx| self.validate_and_apply(tx, &task, &mut scratch))?
            {
                TaskOutcome::Applied { before, after } => {
                    applied += 1;
                    self.stats.applied.fetch_add(1, Ordering::Relaxed);
                    debug!(worker_id, %task, before, after, "applied edit");

                    self.propose_and_push(&search, task.to, &mut scratch)?;
                    if task.operation == EditOperation::Reverse {
                        self.propose_and_push(&search, task.from, &mut scratch)?;
                    }
                }
                TaskOutcome::Stale(reason) => {
                    discarded += 1;
                    self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                    debug!(worker_id, %task, ?reason, "discarded stale task");
                }
            }
        }

        debug!(worker_id, applied, discarded, "worker finished");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    fn validate_and_apply<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        task: &CandidateTask,
        scratch: &mut SearchScratch,
    ) -> TxResult<TaskOutcome> {
        let plan = match self.check_task(tx, task, scratch)? {
            Ok(plan) => plan,
            Err(reason) => return Ok(TaskOutcome::Stale(reason)),
        };
        self.dag.apply_operation(tx, task.operation, task.from, task.to)?;
        self.score
            .record_change(tx, task.to, plan.new_to_local, plan.parent_delta)?;
        if let Some(new_from_local) = plan.new_from_local {
            self.score.record_change(tx, task.from, new_from_local, 0)?;
        }
        Ok(TaskOutcome::Applied {
            before: plan.before,
            after: plan.after,
        })
    }

    /// Structural checks followed by a recomputation of the true score the
    /// edit gives on the current snapshot.
    fn check_task<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        task: &CandidateTask,
        scratch: &mut SearchScratch,
    ) -> TxResult<Result<Plan, StaleReason>> {
        let CandidateTask {
            operation,
            from,
            to,
            basis,
            ..
        } = *task;

        if self.score.generation(tx, to)? != basis.to {
            return Ok(Err(StaleReason::Superseded));
        }
        if operation == EditOperation::Reverse && self.score.generation(tx, from)? != basis.from {
            return Ok(Err(StaleReason::Superseded));
        }

        let to_parents = self.dag.parents(tx, to)?;
        let has_edge = to_parents.binary_search(&from).is_ok();
        let mut from_parents = None;
        match operation {
            EditOperation::Insert => {
                if has_edge {
                    return Ok(Err(StaleReason::EdgePresent));
                }
                if !self.config.has_parent_room(to_parents.len()) {
                    return Ok(Err(StaleReason::ParentCap));
                }
                if self.dag.is_path(tx, to, from, &mut scratch.traversal)? {
                    return Ok(Err(StaleReason::WouldCycle));
                }
            }
            EditOperation::Remove => {
                if !has_edge {
                    return Ok(Err(StaleReason::EdgeMissing));
                }
            }
            EditOperation::Reverse => {
                if !has_edge {
                    return Ok(Err(StaleReason::EdgeMissing));
                }
                let parents = self.dag.parents(tx, from)?;
                if !self.config.has_parent_room(parents.len()) {
                    return Ok(Err(StaleReason::ParentCap));
                }
                if self
                    .dag
                    .is_path_without_edge(tx, from, to, &mut scratch.traversal)?
                {
                    return Ok(Err(StaleReason::WouldCycle));
                }
                from_parents = Some(parents);
            }
        }

        let (added, removed, parent_delta) = match operation {
            EditOperation::Insert => (Some(from), None, 1),
            EditOperation::Remove => (None, Some(from), -1),
            EditOperation::Reverse => (None, Some(from), 0),
        };
        let likelihood = &mut scratch.likelihood;
        let new_to_local =
            likelihood.local_log_likelihood_edited(self.oracle, to, &to_parents, added, removed);
        let mut delta = new_to_local - self.score.local(tx, to)?;
        let new_from_local = match from_parents {
            Some(parents) => {
                let local =
                    likelihood.local_log_likelihood_edited(self.oracle, from, &parents, Some(to), None);
                delta += local - self.score.local(tx, from)?;
                Some(local)
            }
            None => None,
        };

        let num_record = self.score.num_record();
        let num_total_parent = self.score.num_total_parent(tx)?;
        let base = self.score.base_log_likelihood(tx)?;
        let before = network_score(num_total_parent, base, num_record);
        let after = network_score(num_total_parent + parent_delta, base + delta, num_record);
        if after.is_nan() || after <= before {
            return Ok(Err(StaleReason::NotImproving));
        }

        Ok(Ok(Plan {
            parent_delta,
            new_to_local,
            new_from_local,
            before,
            after,
        }))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Dataset, GeneratorConfig};
    use crate::oracle::RecordIndex;
    use crate::score::compute_local_log_likelihood;
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;
    use std::sync::Barrier;
    use std::thread;

    fn config(num_threads: usize) -> LearnerConfig {
        LearnerConfig {
            num_threads,
            ..LearnerConfig::default()
        }
    }

    /// Four variables, 16 records: variable 1 copies variable 0 while 2 and 3
    /// are balanced and independent of everything.
    fn copy_pair_data() -> Dataset {
        let mut values = Vec::new();
        for _ in 0..2 {
            for bits in 0..8u8 {
                let (a, c, d) = (bits & 1, (bits >> 1) & 1, (bits >> 2) & 1);
                values.extend_from_slice(&[a, a, c, d]);
            }
        }
        Dataset::from_records(4, values).unwrap()
    }

    /// Six variables: 2, 3 and 5 all copy the same fair coin; the rest are
    /// independent noise.
    fn shared_cause_data() -> Dataset {
        let mut values = Vec::new();
        for _ in 0..4 {
            for bits in 0..8u8 {
                let (a, b, c) = (bits & 1, (bits >> 1) & 1, (bits >> 2) & 1);
                values.extend_from_slice(&[b, c, a, a, b ^ c, a]);
            }
        }
        Dataset::from_records(6, values).unwrap()
    }

    fn random_index(seed: u64, num_variable: usize) -> RecordIndex {
        let mut rng = XorShiftRng::seed_from_u64(seed);
        let cfg = GeneratorConfig {
            num_variable,
            num_record: 512,
            max_num_parent: 3,
            percent_parent: 40,
        };
        let (data, _) = Dataset::generate(&mut rng, &cfg).unwrap();
        RecordIndex::new(&data)
    }

    /// Score of `edges` recomputed from scratch.
    fn recomputed_score<O: CountOracle>(oracle: &O, edges: &[(usize, usize)]) -> f64 {
        let mut constraints = Vec::new();
        let base: f64 = (0..oracle.num_variable())
            .map(|id| {
                let parents: Vec<usize> = edges.iter().filter(|e| e.1 == id).map(|e| e.0).collect();
                compute_local_log_likelihood(oracle, id, &parents, &mut constraints)
            })
            .sum();
        network_score(edges.len() as i64, base, oracle.num_record())
    }

    #[test]
    fn config_validation() {
        assert!(LearnerConfig::default().validate().is_ok());
        for bad in [
            LearnerConfig {
                num_threads: 0,
                ..LearnerConfig::default()
            },
            LearnerConfig {
                quality_factor: 0.5,
                ..LearnerConfig::default()
            },
            LearnerConfig {
                insert_edge_cost: f64::NAN,
                ..LearnerConfig::default()
            },
        ] {
            assert!(matches!(bad.validate(), Err(LearnError::InvalidConfig(_))));
        }
    }

    #[test]
    fn parent_limit_is_clamped() {
        let cfg = LearnerConfig {
            max_parents: Some(100),
            ..LearnerConfig::default()
        };
        assert_eq!(cfg.parent_limit(), MAX_PARENT_LIMIT);
        let cfg = LearnerConfig {
            max_parents: Some(2),
            ..LearnerConfig::default()
        };
        assert!(cfg.has_parent_room(1));
        assert!(!cfg.has_parent_room(2));
    }

    #[test]
    fn rejects_bad_initial_graphs() {
        let data = copy_pair_data();
        let index = RecordIndex::new(&data);

        let err = Learner::with_initial_edges(&index, config(1), &[(0, 9)]).unwrap_err();
        assert!(matches!(err, LearnError::NodeOutOfRange { id: 9, .. }));

        let err = Learner::with_initial_edges(&index, config(1), &[(0, 1), (0, 1)]).unwrap_err();
        assert!(matches!(err, LearnError::DuplicateEdge { from: 0, to: 1 }));

        let err = Learner::with_initial_edges(&index, config(1), &[(0, 1), (1, 2), (2, 0)]).unwrap_err();
        assert!(matches!(err, LearnError::InitialGraphCyclic { from: 2, to: 0 }));

        let err = Learner::with_initial_edges(&index, config(1), &[(3, 3)]).unwrap_err();
        assert!(matches!(err, LearnError::InitialGraphCyclic { from: 3, to: 3 }));
    }

    #[test]
    fn initial_graph_is_scored() {
        let data = copy_pair_data();
        let index = RecordIndex::new(&data);
        let edges = [(0, 1), (2, 3)];
        let learner = Learner::with_initial_edges(&index, config(2), &edges).unwrap();

        assert_eq!(learner.edges().unwrap(), edges.to_vec());
        let expected = recomputed_score(&index, &edges);
        assert!((learner.score().unwrap() - expected).abs() < 1e-9);
        learner.verify().unwrap();
    }

    #[test]
    fn single_thread_finds_the_copy_edge() {
        let data = copy_pair_data();
        let index = RecordIndex::new(&data);
        let mut learner = Learner::new(&index, config(1)).unwrap();

        let report = learner.run().unwrap();
        let edges = learner.edges().unwrap();

        // Tied scores resolve to the lower destination: 1 -> 0.
        assert_eq!(edges, vec![(1, 0)]);
        assert!(report.final_score > report.initial_score);
        assert_eq!(report.search.applied, 1);
        assert!((report.final_score - recomputed_score(&index, &edges)).abs() < 1e-9);
        assert_eq!(learner.pending_tasks().unwrap(), 0);
    }

    #[test]
    fn racing_inserts_into_one_node_apply_once() {
        let data = shared_cause_data();
        let index = RecordIndex::new(&data);

        for _ in 0..20 {
            let learner = Learner::new(&index, config(2)).unwrap();
            let tasks = [
                CandidateTask::new(EditOperation::Insert, 2, 5, 0.0),
                CandidateTask::new(EditOperation::Insert, 3, 5, 0.0),
            ];
            let barrier = Barrier::new(2);
            let outcomes: Vec<TaskOutcome> = thread::scope(|s| {
                let handles: Vec<_> = tasks
                    .iter()
                    .map(|task| {
                        let (learner, barrier) = (&learner, &barrier);
                        s.spawn(move || {
                            barrier.wait();
                            learner.apply(task).unwrap()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            let applied = outcomes
                .iter()
                .filter(|o| matches!(o, TaskOutcome::Applied { .. }))
                .count();
            assert_eq!(applied, 1, "{outcomes:?}");
            assert!(outcomes.contains(&TaskOutcome::Stale(StaleReason::Superseded)));

            let parents_of_five = learner.edges().unwrap().iter().filter(|e| e.1 == 5).count();
            assert_eq!(parents_of_five, 1);
            learner.verify().unwrap();
        }
    }

    #[test]
    fn insert_from_descendant_to_ancestor_is_rejected() {
        let data = shared_cause_data();
        let index = RecordIndex::new(&data);
        let chain = [(2, 3), (3, 5)];

        for num_threads in [1, 2, 4, 8] {
            let learner = Learner::with_initial_edges(&index, config(num_threads), &chain).unwrap();
            let task = CandidateTask::new(EditOperation::Insert, 5, 2, 0.0);
            let outcomes: Vec<TaskOutcome> = thread::scope(|s| {
                let handles: Vec<_> = (0..num_threads)
                    .map(|_| {
                        let learner = &learner;
                        s.spawn(move || learner.apply(&task).unwrap())
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            assert!(
                outcomes
                    .iter()
                    .all(|o| *o == TaskOutcome::Stale(StaleReason::WouldCycle)),
                "{num_threads} threads: {outcomes:?}"
            );
            assert_eq!(learner.edges().unwrap(), chain.to_vec());
        }
    }

    #[test]
    fn revalidation_is_idempotent() {
        let data = shared_cause_data();
        let index = RecordIndex::new(&data);
        let learner = Learner::with_initial_edges(&index, config(1), &[(2, 3)]).unwrap();
        let before_edges = learner.edges().unwrap();
        let before_score = learner.score().unwrap();

        let tasks = [
            CandidateTask::new(EditOperation::Insert, 3, 5, 0.0),
            CandidateTask::new(EditOperation::Insert, 3, 2, 0.0),
            CandidateTask::new(EditOperation::Remove, 0, 1, 0.0),
            CandidateTask::new(EditOperation::Reverse, 2, 3, 0.0),
        ];
        for task in &tasks {
            let first = learner.validate(task).unwrap();
            let second = learner.validate(task).unwrap();
            assert_eq!(first, second, "{task}");
        }
        assert!(matches!(learner.validate(&tasks[0]).unwrap(), Verdict::Valid { .. }));
        assert_eq!(
            learner.validate(&tasks[2]).unwrap(),
            Verdict::Stale(StaleReason::EdgeMissing)
        );
        assert_eq!(learner.edges().unwrap(), before_edges);
        assert_eq!(learner.score().unwrap(), before_score);
    }

    #[test]
    fn applied_edits_strictly_improve() {
        let data = shared_cause_data();
        let index = RecordIndex::new(&data);
        let learner = Learner::new(&index, config(1)).unwrap();

        // 4 is the XOR of 0 and 1: a single parent explains nothing and the
        // edge penalty makes the insert a loss.
        let useless = CandidateTask::new(EditOperation::Insert, 0, 4, 0.0);
        assert_eq!(
            learner.apply(&useless).unwrap(),
            TaskOutcome::Stale(StaleReason::NotImproving)
        );

        let useful = CandidateTask::new(EditOperation::Insert, 2, 5, 0.0);
        match learner.apply(&useful).unwrap() {
            TaskOutcome::Applied { before, after } => assert!(after > before),
            other => panic!("expected apply, got {other:?}"),
        }
    }

    #[test]
    fn stale_basis_is_superseded() {
        let data = shared_cause_data();
        let index = RecordIndex::new(&data);
        let learner = Learner::new(&index, config(1)).unwrap();

        let task = learner.propose(5).unwrap().unwrap();
        assert_eq!(task.to, 5);
        assert!(matches!(learner.apply(&task).unwrap(), TaskOutcome::Applied { .. }));
        assert_eq!(learner.apply(&task).unwrap(), TaskOutcome::Stale(StaleReason::Superseded));

        let fresh = learner.propose(5).unwrap();
        assert!(fresh.is_none_or(|t| t.basis.to == 1));
    }

    #[test]
    fn reverse_updates_both_endpoints() {
        let data = shared_cause_data();
        let index = RecordIndex::new(&data);
        let learner = Learner::with_initial_edges(&index, config(1), &[(1, 4), (4, 0)]).unwrap();

        // 4 -> 0 tells 0 nothing; 0 -> 4 completes 4's parents {0, 1}.
        let task = CandidateTask::new(EditOperation::Reverse, 4, 0, 0.0);
        match learner.apply(&task).unwrap() {
            TaskOutcome::Applied { before, after } => assert!(after > before),
            other => panic!("expected apply, got {other:?}"),
        }
        let edges = learner.edges().unwrap();
        assert_eq!(edges, vec![(0, 4), (1, 4)]);
        assert!((learner.score().unwrap() - recomputed_score(&index, &edges)).abs() < 1e-9);
        learner.verify().unwrap();
    }

    #[test]
    fn strict_quality_factor_queues_nothing() {
        let data = copy_pair_data();
        let index = RecordIndex::new(&data);
        let cfg = LearnerConfig {
            quality_factor: 2.0,
            ..config(2)
        };
        let mut learner = Learner::new(&index, cfg).unwrap();
        assert_eq!(learner.config().quality_factor, 2.0);

        let report = learner.run().unwrap();
        assert_eq!(report.search.pushed, 0);
        assert_eq!(report.search.applied, 0);
        assert!(learner.edges().unwrap().is_empty());
        assert_eq!(report.final_score, report.initial_score);
    }

    #[test]
    fn remove_of_uninformative_edge_applies() {
        let data = shared_cause_data();
        let index = RecordIndex::new(&data);
        let cfg = LearnerConfig {
            enable_remove: true,
            ..config(1)
        };
        // 0 is independent of 2, and of every single extra parent as well.
        let learner = Learner::with_initial_edges(&index, cfg, &[(2, 0), (2, 3)]).unwrap();

        let task = learner.propose(0).unwrap().unwrap();
        assert_eq!((task.operation, task.from, task.to), (EditOperation::Remove, 2, 0));
        match learner.apply(&task).unwrap() {
            TaskOutcome::Applied { before, after } => assert!(after > before),
            other => panic!("expected apply, got {other:?}"),
        }

        let edges = learner.edges().unwrap();
        assert_eq!(edges, vec![(2, 3)]);
        let total = learner
            .stm
            .atomically(|tx| learner.score.num_total_parent(tx))
            .unwrap();
        assert_eq!(total, 1);
        assert!((learner.score().unwrap() - recomputed_score(&index, &edges)).abs() < 1e-9);
        learner.verify().unwrap();
    }

    #[test]
    fn verify_names_a_node_on_a_cycle() {
        let data = copy_pair_data();
        let index = RecordIndex::new(&data);
        let learner = Learner::with_initial_edges(&index, config(1), &[(0, 1), (1, 2)]).unwrap();
        learner.verify().unwrap();

        learner
            .stm
            .atomically(|tx| learner.dag.apply_operation(tx, EditOperation::Insert, 2, 0))
            .unwrap();
        assert!(matches!(learner.verify(), Err(LearnError::SelfReachable { .. })));
    }

    #[test]
    fn parallel_runs_stay_acyclic_and_consistent() {
        for (seed, num_threads) in [(1u64, 2usize), (2, 4), (3, 8)] {
            let index = random_index(seed, 14);
            let cfg = LearnerConfig {
                max_parents: Some(3),
                enable_remove: true,
                enable_reverse: true,
                ..config(num_threads)
            };
            let mut learner = Learner::new(&index, cfg).unwrap();
            let report = learner.run().unwrap();

            learner.verify().unwrap();
            assert!(report.final_score >= report.initial_score);
            let edges = learner.edges().unwrap();
            assert_eq!(report.num_edge, edges.len());
            let expected = recomputed_score(&index, &edges);
            assert!(
                (report.final_score - expected).abs() <= 1e-6 * expected.abs().max(1.0),
                "seed {seed}: cached {} vs recomputed {expected}",
                report.final_score
            );
            for id in 0..index.num_variable() {
                assert!(edges.iter().filter(|e| e.1 == id).count() <= 3);
            }
            assert_eq!(
                report.search.popped,
                report.search.applied + report.search.discarded
            );
            assert_eq!(learner.pending_tasks().unwrap(), 0);
        }
    }

    #[test]
    fn thread_count_does_not_break_termination() {
        let index = random_index(0xC0FFEE, 10);
        for num_threads in [1, 3] {
            let mut learner = Learner::new(&index, config(num_threads)).unwrap();
            let report = learner.run().unwrap();
            assert!(report.search.applied <= report.search.pushed);
            // A second run starts from the learned graph and cannot lose score.
            let again = learner.run().unwrap();
            assert!(again.final_score >= report.final_score);
        }
    }
}
