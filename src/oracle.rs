//! Sufficient-statistics oracle: counts of records matching a conjunction of
//! variable assignments.

use crate::data::Dataset;

/// One `variable == value` term of a count query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Constraint {
    /// Variable id.
    pub variable: usize,
    /// Required value (0 or 1).
    pub value: u8,
}

impl Constraint {
    /// Creates a constraint.
    #[inline(always)]
    pub const fn new(variable: usize, value: u8) -> Self {
        Self { variable, value }
    }
}

/// Read-only record counter used by the learner.
///
/// Implementations must be side-effect-free and safe to share across worker
/// threads. Adding a constraint never increases the count.
pub trait CountOracle: Sync {
    /// Number of variables covered.
    fn num_variable(&self) -> usize;

    /// Total number of records.
    fn num_record(&self) -> usize;

    /// Number of records satisfying every constraint. An empty slice matches
    /// all records.
    fn count(&self, constraints: &[Constraint]) -> usize;
}

/// Bitset index over a [`Dataset`].
///
/// For every variable a bitset (one bit per record) marks the records where
/// it is 1. A query ANDs the selected bitsets (complemented for value 0) word
/// by word and counts the surviving bits.
#[derive(Clone, Debug)]
pub struct RecordIndex {
    num_variable: usize,
    num_record: usize,
    words_per_variable: usize,
    tail_mask: u64,
    ones: Vec<u64>,
}

impl RecordIndex {
    /// Indexes `dataset`. One pass over the records.
    pub fn new(dataset: &Dataset) -> Self {
        let num_variable = dataset.num_variable();
        let num_record = dataset.num_record();
        let words_per_variable = num_record.div_ceil(64);
        let mut ones = vec![0u64; num_variable * words_per_variable];

        for (r, record) in dataset.records().enumerate() {
            let (word, mask) = (r / 64, 1u64 << (r % 64));
            for (var, &value) in record.iter().enumerate() {
                if value != 0 {
                    ones[var * words_per_variable + word] |= mask;
                }
            }
        }

        let tail_mask = match num_record % 64 {
            0 => u64::MAX,
            rem => (1u64 << rem) - 1,
        };

        Self {
            num_variable,
            num_record,
            words_per_variable,
            tail_mask,
            ones,
        }
    }

    #[inline(always)]
    fn row(&self, variable: usize) -> &[u64] {
        let start = variable * self.words_per_variable;
        &self.ones[start..start + self.words_per_variable]
    }
}

impl CountOracle for RecordIndex {
    fn num_variable(&self) -> usize {
        self.num_variable
    }

    fn num_record(&self) -> usize {
        self.num_record
    }

    fn count(&self, constraints: &[Constraint]) -> usize {
        if constraints.is_empty() {
            return self.num_record;
        }
        let last = self.words_per_variable.saturating_sub(1);
        let mut total = 0usize;
        for w in 0..self.words_per_variable {
            let mut acc = if w == last { self.tail_mask } else { u64::MAX };
            for c in constraints {
                let bits = self.row(c.variable)[w];
                acc &= if c.value != 0 { bits } else { !bits };
                if acc == 0 {
                    break;
                }
            }
            total += acc.count_ones() as usize;
        }
        total
    }
}

// ============================================================================
// Tests
// ============================================================================
