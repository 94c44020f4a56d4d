//! Synthetic binary record sets drawn from a random Bayesian network.
//!
//! The generator picks a random variable order, gives each variable up to
//! `max_num_parent` parents among the variables before it, draws a random
//! conditional probability table per variable and forward-samples records.

use crate::error::LearnError;
use rand::Rng;
use rand::seq::SliceRandom;

/// Upper bound on generator parents; the table has `2^max_num_parent` rows.
const MAX_GENERATOR_PARENTS: usize = 20;

// ============================================================================
// Configuration
// ============================================================================

/// Parameters of the synthetic data generator.
#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    /// Number of binary variables.
    pub num_variable: usize,
    /// Number of records to sample.
    pub num_record: usize,
    /// Maximum parents per variable in the generating network.
    pub max_num_parent: usize,
    /// Chance (percent) that each candidate parent is accepted.
    pub percent_parent: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            num_variable: 32,
            num_record: 4096,
            max_num_parent: 2,
            percent_parent: 10,
        }
    }
}

impl GeneratorConfig {
    /// Checks that every field is in range.
    ///
    /// # Errors
    /// [`LearnError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), LearnError> {
        if self.num_variable == 0 {
            return Err(LearnError::InvalidConfig("num_variable must be positive".into()));
        }
        if self.num_record == 0 {
            return Err(LearnError::InvalidConfig("num_record must be positive".into()));
        }
        if self.max_num_parent > MAX_GENERATOR_PARENTS {
            return Err(LearnError::InvalidConfig(format!(
                "max_num_parent must be at most {MAX_GENERATOR_PARENTS}"
            )));
        }
        if self.percent_parent > 100 {
            return Err(LearnError::InvalidConfig("percent_parent must be in 0..=100".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Network
// ============================================================================

/// The structure a dataset was sampled from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Network {
    num_variable: usize,
    edges: Vec<(usize, usize)>,
}

impl Network {
    /// Number of variables.
    pub fn num_variable(&self) -> usize {
        self.num_variable
    }

    /// Edges as `(parent, child)`, sorted.
    pub fn edges(&self) -> &[(usize, usize)] {
        &self.edges
    }

    /// Sorted parents of `id`.
    pub fn parents_of(&self, id: usize) -> Vec<usize> {
        let mut parents: Vec<usize> = self
            .edges
            .iter()
            .filter(|&&(_, to)| to == id)
            .map(|&(from, _)| from)
            .collect();
        parents.sort_unstable();
        parents
    }
}

// ============================================================================
// Dataset
// ============================================================================

/// Row-major binary records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dataset {
    num_variable: usize,
    num_record: usize,
    values: Vec<u8>,
}

impl Dataset {
    /// Builds a dataset from a flat row-major buffer of 0/1 values.
    ///
    /// # Errors
    /// [`LearnError::InvalidDataset`] if the buffer is not a whole number of
    /// rows or holds a value other than 0 and 1.
    pub fn from_records(num_variable: usize, values: Vec<u8>) -> Result<Self, LearnError> {
        if num_variable == 0 {
            return Err(LearnError::InvalidDataset("no variables".into()));
        }
        if values.len() % num_variable != 0 {
            return Err(LearnError::InvalidDataset(format!(
                "{} values do not form rows of width {num_variable}",
                values.len()
            )));
        }
        if let Some(pos) = values.iter().position(|&v| v > 1) {
            return Err(LearnError::InvalidDataset(format!(
                "record {} variable {} holds non-binary value {}",
                pos / num_variable,
                pos % num_variable,
                values[pos]
            )));
        }
        Ok(Self {
            num_variable,
            num_record: values.len() / num_variable,
            values,
        })
    }

    /// Samples a dataset from a freshly drawn random network.
    ///
    /// # Errors
    /// [`LearnError::InvalidConfig`] if `cfg` does not validate.
    pub fn generate<R: Rng>(rng: &mut R, cfg: &GeneratorConfig) -> Result<(Self, Network), LearnError> {
        cfg.validate()?;
        let n = cfg.num_variable;

        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);

        let mut parents: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut pool = Vec::with_capacity(n);
        for (i, &var) in order.iter().enumerate() {
            pool.clear();
            pool.extend_from_slice(&order[..i]);
            pool.shuffle(rng);
            for &candidate in &pool {
                if parents[var].len() >= cfg.max_num_parent {
                    break;
                }
                if rng.random_ratio(cfg.percent_parent, 100) {
                    parents[var].push(candidate);
                }
            }
            parents[var].sort_unstable();
        }

        // P(var = 1 | parent assignment), indexed by the parents' values as bits.
        let tables: Vec<Vec<f64>> = parents
            .iter()
            .map(|p| (0..(1usize << p.len())).map(|_| rng.random::<f64>()).collect())
            .collect();

        let mut values = vec![0u8; n * cfg.num_record];
        for row in values.chunks_exact_mut(n) {
            for &var in &order {
                let index = parents[var]
                    .iter()
                    .enumerate()
                    .fold(0usize, |acc, (bit, &p)| acc | (usize::from(row[p]) << bit));
                row[var] = u8::from(rng.random_bool(tables[var][index]));
            }
        }

        let mut edges: Vec<(usize, usize)> = parents
            .iter()
            .enumerate()
            .flat_map(|(to, ps)| ps.iter().map(move |&from| (from, to)))
            .collect();
        edges.sort_unstable();

        let dataset = Self {
            num_variable: n,
            num_record: cfg.num_record,
            values,
        };
        Ok((dataset, Network { num_variable: n, edges }))
    }

    /// Number of variables per record.
    #[inline]
    pub fn num_variable(&self) -> usize {
        self.num_variable
    }

    /// Number of records.
    #[inline]
    pub fn num_record(&self) -> usize {
        self.num_record
    }

    /// The values of record `index`.
    #[inline]
    pub fn record(&self, index: usize) -> &[u8] {
        &self.values[index * self.num_variable..(index + 1) * self.num_variable]
    }

    /// Iterates over all records.
    pub fn records(&self) -> impl Iterator<Item = &[u8]> {
        self.values.chunks_exact(self.num_variable)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    #[test]
    fn generated_network_respects_parent_bound() {
        let mut rng = XorShiftRng::seed_from_u64(0x5EED);
        let cfg = GeneratorConfig {
            num_variable: 20,
            num_record: 256,
            max_num_parent: 3,
            percent_parent: 60,
        };
        let (data, net) = Dataset::generate(&mut rng, &cfg).unwrap();

        assert_eq!(data.num_variable(), 20);
        assert_eq!(data.num_record(), 256);
        assert_eq!(data.records().count(), 256);
        for id in 0..20 {
            assert!(net.parents_of(id).len() <= 3, "variable {id} has too many parents");
        }
        assert!(data.records().all(|r| r.iter().all(|&v| v <= 1)));
    }

    #[test]
    fn generated_network_is_acyclic() {
        let mut rng = XorShiftRng::seed_from_u64(0xF00D);
        let cfg = GeneratorConfig {
            num_variable: 16,
            num_record: 8,
            max_num_parent: 4,
            percent_parent: 80,
        };
        let (_, net) = Dataset::generate(&mut rng, &cfg).unwrap();

        // Kahn's algorithm must consume every node.
        let n = net.num_variable();
        let mut indegree = vec![0usize; n];
        for &(_, to) in net.edges() {
            indegree[to] += 1;
        }
        let mut ready: Vec<usize> = (0..n).filter(|&v| indegree[v] == 0).collect();
        let mut seen = 0;
        while let Some(v) = ready.pop() {
            seen += 1;
            for &(from, to) in net.edges() {
                if from == v {
                    indegree[to] -= 1;
                    if indegree[to] == 0 {
                        ready.push(to);
                    }
                }
            }
        }
        assert_eq!(seen, n, "generating network contains a cycle");
    }

    #[test]
    fn from_records_validates_shape_and_values() {
        let data = Dataset::from_records(3, vec![0, 1, 0, 1, 1, 1]).unwrap();
        assert_eq!(data.num_record(), 2);
        assert_eq!(data.record(1), &[1, 1, 1]);
        assert!(matches!(
            Dataset::from_records(3, vec![0, 1, 0, 1]),
            Err(LearnError::InvalidDataset(_))
        ));
        assert!(matches!(
            Dataset::from_records(2, vec![0, 2]),
            Err(LearnError::InvalidDataset(_))
        ));
        assert!(Dataset::from_records(0, Vec::new()).is_err());
    }

    #[test]
    fn config_validation() {
        assert!(GeneratorConfig::default().validate().is_ok());
        let bad = GeneratorConfig {
            percent_parent: 101,
            ..GeneratorConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
