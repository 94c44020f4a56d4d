//! # Bayesian Network Structure Learner
//!
//! Parallel hill-climbing search for the structure of a Bayesian network over
//! binary variables, built on a small software transactional memory.
//!
//! This crate provides:
//! - A transactional runtime ([`stm`]) with versioned cells and serializable
//!   transactions that retry on conflict.
//! - A shared DAG model whose parent/child sets are transactional cells, with
//!   reachability queries and cycle detection.
//! - Log-likelihood scoring with a BIC-style structure penalty and cached,
//!   incrementally updated totals.
//! - A parallel driver: workers pop the best pending edit, re-validate it,
//!   apply it atomically and propose follow-up edits.
//!
//! ## Quick Start
//!
//! ```
//! use bayes_learner::prelude::*;
//! use rand::SeedableRng;
//! use rand::rngs::SmallRng;
//!
//! let mut rng = SmallRng::seed_from_u64(7);
//! let cfg = GeneratorConfig {
//!     num_variable: 8,
//!     num_record: 256,
//!     ..Default::default()
//! };
//! let (data, _network) = Dataset::generate(&mut rng, &cfg).unwrap();
//! let index = RecordIndex::new(&data);
//!
//! let mut learner = Learner::new(&index, LearnerConfig { num_threads: 2, ..Default::default() }).unwrap();
//! let report = learner.run().unwrap();
//! assert!(report.final_score >= report.initial_score);
//! learner.verify().unwrap();
//! ```
//!
//! ## Modules
//!
//! - [`stm`]: Transactional cells, transactions and the retry driver.
//! - [`graph`]: Transactional DAG with path queries and cycle detection.
//! - [`oracle`]: Record-count oracle trait and a bitset index implementing it.
//! - [`score`]: Local log-likelihoods and the shared score accounting.
//! - [`task`]: Candidate edits and the priority-ordered task list.
//! - [`candidate`]: Best-edit search for one destination node.
//! - [`learner`]: Configuration and the parallel search driver.
//! - [`data`]: Binary datasets and a random-network generator.
//!
//! ## Performance Notes
//!
//! - Local log-likelihoods cost `2^|parents|` count queries; parent sets are
//!   capped at [`score::MAX_PARENT_LIMIT`].
//! - Count queries are word-wise bitset intersections over the records.
//! - For maximum performance, compile with: `RUSTFLAGS="-C target-cpu=native" cargo build --release`

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::inline_always)] // Intentional for hot-path code
#![allow(clippy::doc_markdown)] // LaTeX-style notation in docs
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::multiple_crate_versions)] // Cargo.lock management is external

pub mod candidate;
pub mod data;
pub mod error;
pub mod graph;
pub mod learner;
pub mod oracle;
pub mod score;
pub mod stm;
pub mod task;

/// Re-export commonly used types for convenience.
pub mod prelude {
    pub use crate::data::{Dataset, GeneratorConfig, Network};
    pub use crate::error::LearnError;
    pub use crate::graph::EditOperation;
    pub use crate::learner::{Learner, LearnerConfig, RunReport, StaleReason, TaskOutcome, Verdict};
    pub use crate::oracle::{Constraint, CountOracle, RecordIndex};
    pub use crate::task::CandidateTask;
}
