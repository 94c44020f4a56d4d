//! Transactional directed acyclic graph used as the learned network structure.
//!
//! Representation:
//! - every node owns two sorted adjacency vectors, `parents` and `children`,
//!   each in its own [`TVar`] so a reachability query over `children` does not
//!   conflict with a concurrent update of some node's `parents`;
//! - `b ∈ parents(a)` iff `a ∈ children(b)`. Only [`Dag::apply_operation`]
//!   mutates adjacency and it always updates both mirrors.
//!
//! Acyclicity is a cross-transaction invariant maintained by callers: the
//! mutation primitives perform no cycle check.

use crate::error::LearnError;
use crate::stm::{TVar, Transaction, TxResult};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Edit operations
// ============================================================================

/// Kind of single-edge edit applied to a `(from, to)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EditOperation {
    /// Add the edge `from -> to`.
    Insert,
    /// Delete the edge `from -> to`.
    Remove,
    /// Replace `from -> to` with `to -> from`.
    Reverse,
}

impl fmt::Display for EditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "insert",
            Self::Remove => "remove",
            Self::Reverse => "reverse",
        })
    }
}

// ============================================================================
// Traversal scratch
// ============================================================================

/// A fixed-capacity bitset over node ids.
#[derive(Clone, Debug, Default)]
pub struct VisitSet {
    words: Vec<u64>,
}

impl VisitSet {
    /// Creates an empty set able to hold ids in `0..len`.
    pub fn with_len(len: usize) -> Self {
        let mut set = Self::default();
        set.reset(len);
        set
    }

    /// Clears the set and resizes it for ids in `0..len`.
    pub fn reset(&mut self, len: usize) {
        self.words.clear();
        self.words.resize(len.div_ceil(64), 0);
    }

    /// Inserts `id`; returns true if it was not present.
    #[inline(always)]
    pub fn insert(&mut self, id: usize) -> bool {
        let word = &mut self.words[id / 64];
        let mask = 1u64 << (id % 64);
        let fresh = *word & mask == 0;
        *word |= mask;
        fresh
    }

    /// Returns whether `id` is in the set.
    #[inline(always)]
    pub fn contains(&self, id: usize) -> bool {
        self.words
            .get(id / 64)
            .is_some_and(|w| w & (1u64 << (id % 64)) != 0)
    }

    /// Number of ids in the set.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Iterates ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut t = word;
            std::iter::from_fn(move || {
                if t == 0 {
                    return None;
                }
                let bit = t.trailing_zeros() as usize;
                t &= t - 1;
                Some(i * 64 + bit)
            })
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Thread-private buffers reused by every traversal of a [`Dag`].
#[derive(Debug, Default)]
pub struct Traversal {
    queue: VecDeque<usize>,
    visited: VisitSet,
    marks: Vec<Mark>,
    stack: Vec<(usize, Arc<Vec<usize>>, usize)>,
}

impl Traversal {
    /// Creates scratch space sized for `num_node` nodes.
    pub fn new(num_node: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(num_node),
            visited: VisitSet::with_len(num_node),
            marks: Vec::with_capacity(num_node),
            stack: Vec::new(),
        }
    }

    fn prepare(&mut self, num_node: usize) {
        self.queue.clear();
        self.visited.reset(num_node);
    }
}

// ============================================================================
// Dag
// ============================================================================

#[derive(Debug)]
struct Node {
    parents: TVar<Vec<usize>>,
    children: TVar<Vec<usize>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Parents,
    Children,
}

/// The shared graph. Node count is fixed at construction.
#[derive(Debug)]
pub struct Dag {
    nodes: Vec<Node>,
}

impl Dag {
    /// Creates a graph with `num_node` nodes and no edges.
    pub fn new(num_node: usize) -> Self {
        let nodes = (0..num_node)
            .map(|_| Node {
                parents: TVar::new(Vec::new()),
                children: TVar::new(Vec::new()),
            })
            .collect();
        Self { nodes }
    }

    /// Number of nodes.
    #[inline(always)]
    pub fn num_node(&self) -> usize {
        self.nodes.len()
    }

    /// Fails with [`LearnError::NodeOutOfRange`] unless `id` names a node.
    pub fn check_node(&self, id: usize) -> Result<(), LearnError> {
        if id < self.nodes.len() {
            Ok(())
        } else {
            Err(LearnError::NodeOutOfRange {
                id,
                num_variable: self.nodes.len(),
            })
        }
    }

    /// Sorted parent ids of `id`.
    pub fn parents<'a>(&'a self, tx: &mut Transaction<'a>, id: usize) -> TxResult<Arc<Vec<usize>>> {
        self.nodes[id].parents.read(tx)
    }

    /// Sorted child ids of `id`.
    pub fn children<'a>(&'a self, tx: &mut Transaction<'a>, id: usize) -> TxResult<Arc<Vec<usize>>> {
        self.nodes[id].children.read(tx)
    }

    /// Returns whether the edge `from -> to` exists.
    pub fn has_edge<'a>(&'a self, tx: &mut Transaction<'a>, from: usize, to: usize) -> TxResult<bool> {
        Ok(self.parents(tx, to)?.binary_search(&from).is_ok())
    }

    /// Applies `op` to the pair `(from, to)`, keeping both adjacency mirrors in
    /// step. Callers validate acyclicity first.
    ///
    /// # Errors
    /// [`LearnError::OutOfMemory`] if an adjacency set cannot grow.
    pub fn apply_operation<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        op: EditOperation,
        from: usize,
        to: usize,
    ) -> TxResult<()> {
        match op {
            EditOperation::Insert => self.insert_edge(tx, from, to),
            EditOperation::Remove => self.remove_edge(tx, from, to),
            EditOperation::Reverse => {
                self.remove_edge(tx, from, to)?;
                self.insert_edge(tx, to, from)
            }
        }
    }

    fn insert_edge<'a>(&'a self, tx: &mut Transaction<'a>, from: usize, to: usize) -> TxResult<()> {
        let parents = with_inserted(&self.nodes[to].parents.read(tx)?, from)?;
        self.nodes[to].parents.write(tx, parents);
        let children = with_inserted(&self.nodes[from].children.read(tx)?, to)?;
        self.nodes[from].children.write(tx, children);
        Ok(())
    }

    fn remove_edge<'a>(&'a self, tx: &mut Transaction<'a>, from: usize, to: usize) -> TxResult<()> {
        let parents = without(&self.nodes[to].parents.read(tx)?, from)?;
        self.nodes[to].parents.write(tx, parents);
        let children = without(&self.nodes[from].children.read(tx)?, to)?;
        self.nodes[from].children.write(tx, children);
        Ok(())
    }

    /// Breadth-first search over `children`: is `to` reachable from `from`?
    ///
    /// Inserting `from -> to` keeps the graph acyclic iff `is_path(to, from)`
    /// is false.
    pub fn is_path<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        from: usize,
        to: usize,
        scratch: &mut Traversal,
    ) -> TxResult<bool> {
        self.search_children(tx, from, to, None, scratch)
    }

    /// Like [`Dag::is_path`] but ignores the direct edge `from -> to`.
    ///
    /// Reversing `from -> to` keeps the graph acyclic iff this is false.
    pub fn is_path_without_edge<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        from: usize,
        to: usize,
        scratch: &mut Traversal,
    ) -> TxResult<bool> {
        self.search_children(tx, from, to, Some((from, to)), scratch)
    }

    fn search_children<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        from: usize,
        to: usize,
        skip: Option<(usize, usize)>,
        scratch: &mut Traversal,
    ) -> TxResult<bool> {
        scratch.prepare(self.nodes.len());
        scratch.visited.insert(from);
        scratch.queue.push_back(from);

        while let Some(id) = scratch.queue.pop_front() {
            if id == to {
                return Ok(true);
            }
            let children = self.children(tx, id)?;
            for &child in children.iter() {
                if skip == Some((id, child)) {
                    continue;
                }
                if scratch.visited.insert(child) {
                    scratch.queue.push_back(child);
                }
            }
        }
        Ok(false)
    }

    /// All ancestors of `id`, ascending.
    ///
    /// # Errors
    /// [`LearnError::SelfReachable`] if `id` is its own ancestor.
    pub fn find_ancestors<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        id: usize,
        scratch: &mut Traversal,
    ) -> TxResult<Vec<usize>> {
        self.reachable(tx, id, Direction::Parents, scratch)
    }

    /// All descendants of `id`, ascending.
    ///
    /// # Errors
    /// [`LearnError::SelfReachable`] if `id` is its own descendant.
    pub fn find_descendants<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        id: usize,
        scratch: &mut Traversal,
    ) -> TxResult<Vec<usize>> {
        self.reachable(tx, id, Direction::Children, scratch)
    }

    fn reachable<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        id: usize,
        direction: Direction,
        scratch: &mut Traversal,
    ) -> TxResult<Vec<usize>> {
        scratch.prepare(self.nodes.len());
        scratch.queue.push_back(id);

        while let Some(current) = scratch.queue.pop_front() {
            let next = match direction {
                Direction::Parents => self.parents(tx, current)?,
                Direction::Children => self.children(tx, current)?,
            };
            for &n in next.iter() {
                if n == id {
                    return Err(LearnError::SelfReachable { id }.into());
                }
                if scratch.visited.insert(n) {
                    scratch.queue.push_back(n);
                }
            }
        }
        Ok(scratch.visited.iter().collect())
    }

    /// Whole-graph cycle check (three-color iterative DFS). `O(V + E)`; meant
    /// for verification, not for the per-edit path.
    pub fn is_cycle<'a>(&'a self, tx: &mut Transaction<'a>, scratch: &mut Traversal) -> TxResult<bool> {
        let n = self.nodes.len();
        scratch.marks.clear();
        scratch.marks.resize(n, Mark::Unvisited);
        scratch.stack.clear();

        for root in 0..n {
            if scratch.marks[root] != Mark::Unvisited {
                continue;
            }
            scratch.marks[root] = Mark::InProgress;
            scratch.stack.push((root, self.children(tx, root)?, 0));

            while let Some((id, children, cursor)) = scratch.stack.last_mut() {
                let Some(&child) = children.get(*cursor) else {
                    scratch.marks[*id] = Mark::Done;
                    scratch.stack.pop();
                    continue;
                };
                *cursor += 1;
                match scratch.marks[child] {
                    Mark::InProgress => {
                        scratch.stack.clear();
                        return Ok(true);
                    }
                    Mark::Unvisited => {
                        scratch.marks[child] = Mark::InProgress;
                        let grandchildren = self.children(tx, child)?;
                        scratch.stack.push((child, grandchildren, 0));
                    }
                    Mark::Done => {}
                }
            }
        }
        Ok(false)
    }

    /// Total number of edges.
    pub fn edge_count<'a>(&'a self, tx: &mut Transaction<'a>) -> TxResult<usize> {
        let mut count = 0;
        for id in 0..self.nodes.len() {
            count += self.parents(tx, id)?.len();
        }
        Ok(count)
    }

    /// Every edge as `(from, to)`, sorted.
    pub fn edges<'a>(&'a self, tx: &mut Transaction<'a>) -> TxResult<Vec<(usize, usize)>> {
        let mut edges = Vec::new();
        for to in 0..self.nodes.len() {
            for &from in self.parents(tx, to)?.iter() {
                edges.push((from, to));
            }
        }
        edges.sort_unstable();
        Ok(edges)
    }
}

fn with_inserted(set: &[usize], id: usize) -> Result<Vec<usize>, LearnError> {
    let mut out = Vec::new();
    out.try_reserve_exact(set.len() + 1)
        .map_err(LearnError::out_of_memory("adjacency set"))?;
    match set.binary_search(&id) {
        Ok(_) => out.extend_from_slice(set),
        Err(pos) => {
            out.extend_from_slice(&set[..pos]);
            out.push(id);
            out.extend_from_slice(&set[pos..]);
        }
    }
    Ok(out)
}

fn without(set: &[usize], id: usize) -> Result<Vec<usize>, LearnError> {
    let mut out = Vec::new();
    out.try_reserve_exact(set.len())
        .map_err(LearnError::out_of_memory("adjacency set"))?;
    out.extend(set.iter().copied().filter(|&x| x != id));
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================
