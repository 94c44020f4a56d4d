//! Word-based software transactional memory.
//!
//! Every piece of shared mutable state in the learner lives in a [`TVar`].
//! Code that touches shared state receives a [`Transaction`] and returns a
//! [`TxResult`]; the caller decides where the transaction begins and ends by
//! wrapping the work in [`Stm::atomically`].
//!
//! # Protocol
//!
//! The runtime follows the TL2 scheme:
//!
//! 1. A transaction samples the global version clock when it begins.
//! 2. Reads record the lock word they observed. A cell carrying a version newer
//!    than the sampled clock forces a read-set revalidation ("extension"); if
//!    any earlier read has changed the transaction aborts.
//! 3. Writes are buffered privately and are visible to later reads of the same
//!    transaction.
//! 4. Commit locks the write set in id order, advances the clock, revalidates
//!    the read set and installs the buffered values under the new version.
//!
//! Aborts are retried transparently with exponential backoff; nothing blocks
//! while another transaction holds a cell.

use crate::error::LearnError;
use crossbeam::utils::{Backoff, CachePadded};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

// ============================================================================
// Global state
// ============================================================================

/// Low bit of a lock word; set while a committer owns the cell.
const LOCKED: u64 = 1;

/// Global version clock shared by all transactions.
static GLOBAL_CLOCK: CachePadded<AtomicU64> = CachePadded::new(AtomicU64::new(0));

/// Source of unique cell ids (commit lock order).
static NEXT_CELL_ID: AtomicUsize = AtomicUsize::new(0);

#[inline(always)]
const fn version_of(word: u64) -> u64 {
    word >> 1
}

// ============================================================================
// Errors
// ============================================================================

/// Why a transaction body stopped early.
#[derive(Debug)]
pub enum TxError {
    /// A concurrent commit invalidated this transaction; it will be retried.
    Conflict,
    /// An unrecoverable failure; the transaction is abandoned and the error
    /// is returned from [`Stm::atomically`].
    Fatal(LearnError),
}

impl From<LearnError> for TxError {
    fn from(err: LearnError) -> Self {
        Self::Fatal(err)
    }
}

/// Result type of every operation that runs inside a transaction.
pub type TxResult<T> = Result<T, TxError>;

// ============================================================================
// TVar
// ============================================================================

/// A transactional cell.
///
/// The value is stored behind an [`Arc`] so reads are a reference-count bump
/// and writes replace the whole value (copy-on-write).
pub struct TVar<T> {
    id: usize,
    lock: AtomicU64,
    value: RwLock<Arc<T>>,
}

impl<T: Send + Sync + 'static> TVar<T> {
    /// Creates a new cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            id: NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed),
            lock: AtomicU64::new(GLOBAL_CLOCK.load(Ordering::Acquire) << 1),
            value: RwLock::new(Arc::new(value)),
        }
    }

    /// Reads the cell as seen by `tx`.
    ///
    /// # Errors
    /// Returns [`TxError::Conflict`] when a concurrent commit makes a
    /// consistent read impossible.
    pub fn read<'a>(&'a self, tx: &mut Transaction<'a>) -> TxResult<Arc<T>> {
        if let Some(value) = tx.pending::<T>(self.id) {
            return Ok(value);
        }
        loop {
            let before = self.lock.load(Ordering::Acquire);
            if before & LOCKED != 0 {
                return Err(TxError::Conflict);
            }
            let value = self.load_committed();
            let after = self.lock.load(Ordering::Acquire);
            if before != after {
                return Err(TxError::Conflict);
            }
            if version_of(before) > tx.read_version {
                tx.extend()?;
                continue;
            }
            tx.reads.push(ReadEntry {
                cell: self,
                observed: before,
            });
            return Ok(value);
        }
    }

    /// Buffers `value` as the new content of the cell; it becomes visible to
    /// other transactions only if `tx` commits.
    pub fn write<'a>(&'a self, tx: &mut Transaction<'a>, value: T) {
        let value: Box<dyn Any + Send> = Box::new(Arc::new(value));
        match tx.writes.iter_mut().find(|w| w.cell.id() == self.id) {
            Some(entry) => entry.value = value,
            None => tx.writes.push(WriteEntry { cell: self, value }),
        }
    }

    #[inline]
    fn load_committed(&self) -> Arc<T> {
        let guard = self.value.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }
}

impl<T> fmt::Debug for TVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.lock.load(Ordering::Relaxed);
        f.debug_struct("TVar")
            .field("id", &self.id)
            .field("version", &version_of(word))
            .field("locked", &(word & LOCKED != 0))
            .finish_non_exhaustive()
    }
}

/// Type-erased view of a cell used by the commit protocol.
trait Cell: Sync {
    fn id(&self) -> usize;
    fn lock_word(&self) -> &AtomicU64;
    fn install(&self, value: Box<dyn Any + Send>);
}

impl<T: Send + Sync + 'static> Cell for TVar<T> {
    #[inline]
    fn id(&self) -> usize {
        self.id
    }

    #[inline]
    fn lock_word(&self) -> &AtomicU64 {
        &self.lock
    }

    fn install(&self, value: Box<dyn Any + Send>) {
        match value.downcast::<Arc<T>>() {
            Ok(value) => *self.value.write().unwrap_or_else(PoisonError::into_inner) = *value,
            Err(_) => debug_assert!(false, "write buffer type mismatch for cell {}", self.id),
        }
    }
}

// ============================================================================
// Transaction
// ============================================================================

struct ReadEntry<'a> {
    cell: &'a dyn Cell,
    observed: u64,
}

struct WriteEntry<'a> {
    cell: &'a dyn Cell,
    value: Box<dyn Any + Send>,
}

/// An in-flight atomic transaction.
///
/// Obtained only through [`Stm::atomically`]; operations on shared state take
/// `&mut Transaction` as their capability to read and write [`TVar`]s.
pub struct Transaction<'a> {
    read_version: u64,
    reads: Vec<ReadEntry<'a>>,
    writes: Vec<WriteEntry<'a>>,
}

impl<'a> Transaction<'a> {
    fn begin() -> Self {
        Self {
            read_version: GLOBAL_CLOCK.load(Ordering::Acquire),
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Returns true if the transaction has buffered any write.
    pub fn has_writes(&self) -> bool {
        !self.writes.is_empty()
    }

    fn pending<T: Send + Sync + 'static>(&self, id: usize) -> Option<Arc<T>> {
        self.writes
            .iter()
            .find(|w| w.cell.id() == id)
            .and_then(|w| w.value.downcast_ref::<Arc<T>>())
            .map(Arc::clone)
    }

    /// Moves the read version forward if nothing read so far has changed.
    fn extend(&mut self) -> TxResult<()> {
        let now = GLOBAL_CLOCK.load(Ordering::Acquire);
        let unchanged = self
            .reads
            .iter()
            .all(|r| r.cell.lock_word().load(Ordering::Acquire) == r.observed);
        if !unchanged {
            return Err(TxError::Conflict);
        }
        self.read_version = now;
        Ok(())
    }

    fn owns(&self, id: usize) -> bool {
        self.writes.binary_search_by_key(&id, |w| w.cell.id()).is_ok()
    }

    /// Read-set validation performed while the write set is locked.
    fn reads_still_valid(&self) -> bool {
        self.reads.iter().all(|r| {
            let current = r.cell.lock_word().load(Ordering::Acquire);
            current == r.observed || (current == r.observed | LOCKED && self.owns(r.cell.id()))
        })
    }

    fn release(&self, acquired: usize) {
        for w in &self.writes[..acquired] {
            w.cell.lock_word().fetch_and(!LOCKED, Ordering::Release);
        }
    }

    fn commit(mut self) -> TxResult<()> {
        if !self.has_writes() {
            return Ok(());
        }
        self.writes.sort_unstable_by_key(|w| w.cell.id());

        for (acquired, w) in self.writes.iter().enumerate() {
            let word = w.cell.lock_word();
            let current = word.load(Ordering::Acquire);
            let locked = current & LOCKED == 0
                && word
                    .compare_exchange(current, current | LOCKED, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok();
            if !locked {
                self.release(acquired);
                return Err(TxError::Conflict);
            }
        }

        let write_version = GLOBAL_CLOCK.fetch_add(1, Ordering::AcqRel) + 1;
        if write_version != self.read_version + 1 && !self.reads_still_valid() {
            self.release(self.writes.len());
            return Err(TxError::Conflict);
        }

        for w in self.writes.drain(..) {
            w.cell.install(w.value);
            w.cell.lock_word().store(write_version << 1, Ordering::Release);
        }
        Ok(())
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("read_version", &self.read_version)
            .field("reads", &self.reads.len())
            .field("writes", &self.writes.len())
            .finish()
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Commit/abort counters of an [`Stm`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxCounts {
    /// Transactions that committed.
    pub commits: u64,
    /// Attempts that aborted on conflict and were retried.
    pub aborts: u64,
}

/// Entry point for running transactions.
#[derive(Debug, Default)]
pub struct Stm {
    commits: CachePadded<AtomicU64>,
    aborts: CachePadded<AtomicU64>,
}

impl Stm {
    /// Creates a driver with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `body` atomically, retrying it until it commits.
    ///
    /// The body may run several times and must not have side effects outside
    /// the transaction other than on thread-private scratch state.
    ///
    /// # Errors
    /// Returns the error carried by [`TxError::Fatal`] if the body reports one;
    /// the transaction's writes are discarded.
    pub fn atomically<'a, T, F>(&self, mut body: F) -> Result<T, LearnError>
    where
        F: FnMut(&mut Transaction<'a>) -> TxResult<T>,
    {
        let backoff = Backoff::new();
        loop {
            let mut tx = Transaction::begin();
            let outcome = match body(&mut tx) {
                Ok(value) => tx.commit().map(|()| value),
                Err(err) => Err(err),
            };
            match outcome {
                Ok(value) => {
                    self.commits.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(TxError::Conflict) => {
                    self.aborts.fetch_add(1, Ordering::Relaxed);
                    backoff.snooze();
                }
                Err(TxError::Fatal(err)) => return Err(err),
            }
        }
    }

    /// Returns a snapshot of the commit/abort counters.
    pub fn counts(&self) -> TxCounts {
        TxCounts {
            commits: self.commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn committed_write_is_visible_to_later_transactions() {
        let stm = Stm::new();
        let cell = TVar::new(1u32);

        stm.atomically(|tx| {
            let v = *cell.read(tx)?;
            cell.write(tx, v + 41);
            Ok(())
        })
        .unwrap();

        let seen = stm.atomically(|tx| Ok(*cell.read(tx)?)).unwrap();
        assert_eq!(seen, 42);
        assert_eq!(stm.counts().commits, 2);
    }

    #[test]
    fn reads_observe_own_buffered_writes() {
        let stm = Stm::new();
        let cell = TVar::new(vec![1, 2, 3]);

        let len = stm
            .atomically(|tx| {
                let mut v = (*cell.read(tx)?).clone();
                assert!(!tx.has_writes());
                v.push(4);
                cell.write(tx, v);
                assert!(tx.has_writes());
                Ok(cell.read(tx)?.len())
            })
            .unwrap();
        assert_eq!(len, 4);
    }

    #[test]
    fn fatal_error_discards_writes() {
        let stm = Stm::new();
        let cell = TVar::new(7i64);

        let result: Result<(), LearnError> = stm.atomically(|tx| {
            cell.write(tx, -1);
            Err(TxError::Fatal(LearnError::CycleDetected))
        });
        assert!(matches!(result, Err(LearnError::CycleDetected)));

        let seen = stm.atomically(|tx| Ok(*cell.read(tx)?)).unwrap();
        assert_eq!(seen, 7, "aborted write must not be installed");
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let stm = Stm::new();
        let counter = TVar::new(0u64);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..500 {
                        stm.atomically(|tx| {
                            let v = *counter.read(tx)?;
                            counter.write(tx, v + 1);
                            Ok(())
                        })
                        .unwrap();
                    }
                });
            }
        });

        let total = stm.atomically(|tx| Ok(*counter.read(tx)?)).unwrap();
        assert_eq!(total, 8 * 500);
    }

    #[test]
    fn concurrent_transfers_preserve_sum() {
        let stm = Stm::new();
        let accounts: Vec<TVar<i64>> = (0..6).map(|_| TVar::new(100)).collect();

        thread::scope(|s| {
            for t in 0..6usize {
                let stm = &stm;
                let accounts = &accounts;
                s.spawn(move || {
                    for i in 0..300usize {
                        let from = (t + i) % accounts.len();
                        let to = (t * 7 + i * 3 + 1) % accounts.len();
                        if from == to {
                            continue;
                        }
                        stm.atomically(|tx| {
                            let a = *accounts[from].read(tx)?;
                            let b = *accounts[to].read(tx)?;
                            accounts[from].write(tx, a - 3);
                            accounts[to].write(tx, b + 3);
                            Ok(())
                        })
                        .unwrap();
                    }
                });
            }
        });

        let sum = stm
            .atomically(|tx| {
                let mut sum = 0;
                for a in &accounts {
                    sum += *a.read(tx)?;
                }
                Ok(sum)
            })
            .unwrap();
        assert_eq!(sum, 600, "transfers must conserve the total");
    }

    #[test]
    fn snapshot_reads_are_consistent_under_writers() {
        let stm = Stm::new();
        let a = TVar::new(0i64);
        let b = TVar::new(0i64);

        thread::scope(|s| {
            s.spawn(|| {
                for i in 1..=500 {
                    stm.atomically(|tx| {
                        a.write(tx, i);
                        b.write(tx, -i);
                        Ok(())
                    })
                    .unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..500 {
                    let (x, y) = stm.atomically(|tx| Ok((*a.read(tx)?, *b.read(tx)?))).unwrap();
                    assert_eq!(x + y, 0, "torn snapshot observed");
                }
            });
        });
    }
}
