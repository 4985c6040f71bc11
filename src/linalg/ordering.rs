//! # Fill-Reducing Orderings
//!
//! A fill-reducing ordering is a symmetric permutation `P` such that the factors of `PAPᵀ` carry
//! fewer nonzeros than the factors of `A`. Orderings only look at the structure of the matrix, which
//! is handed over as an [`AdjacencyGraph`] (METIS-style `xadj`/`adjncy` arrays of the pattern of
//! `A + Aᵀ` without self loops).
//!
//! Orderings are pluggable through the [`FillReducingOrdering`] trait. The built-in strategies are
//! - [`LibraryOrdering`]: faer's approximate minimum degree (needs the `library-ordering` feature),
//! - [`MinimumDegreeOrdering`]: a quotient-graph minimum degree implemented in this crate,
//! - [`IdentityOrdering`]: no reordering at all.
//!
//! [`compute_ordering`] never fails: an unavailable or misbehaving method is reported with a
//! warning and replaced by the identity permutation.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::str::FromStr;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::linalg::solver::SolverError;

/// A permutation together with its inverse.
///
/// `perm[k]` is the original index placed at position `k` and `iperm[perm[k]] == k`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation {
    perm: Vec<usize>,
    iperm: Vec<usize>,
}

impl Permutation {
    pub fn identity(n: usize) -> Self {
        Self {
            perm: (0..n).collect(),
            iperm: (0..n).collect(),
        }
    }

    /// Builds a permutation from its forward array, computing the inverse.
    pub fn try_from_perm(perm: Vec<usize>) -> Result<Self, SolverError> {
        let n = perm.len();
        let mut iperm = vec![usize::MAX; n];
        for (k, &old) in perm.iter().enumerate() {
            if old >= n || iperm[old] != usize::MAX {
                return Err(SolverError::InvalidStructure {
                    reason: format!("permutation entry {old} at position {k} is invalid"),
                });
            }
            iperm[old] = k;
        }
        Ok(Self { perm, iperm })
    }

    /// Builds a permutation from both arrays, checking that they are mutual inverses.
    pub fn try_new(perm: Vec<usize>, iperm: Vec<usize>) -> Result<Self, SolverError> {
        let checked = Self::try_from_perm(perm)?;
        if checked.iperm != iperm {
            return Err(SolverError::InvalidStructure {
                reason: "inverse permutation does not match the permutation".to_string(),
            });
        }
        Ok(checked)
    }

    pub fn n(&self) -> usize {
        self.perm.len()
    }

    pub fn perm(&self) -> &[usize] {
        &self.perm
    }

    pub fn iperm(&self) -> &[usize] {
        &self.iperm
    }

    pub fn is_identity(&self) -> bool {
        self.perm.iter().enumerate().all(|(k, &old)| k == old)
    }
}

/// Symmetric adjacency structure of a sparse matrix in `xadj`/`adjncy` form.
///
/// The neighbors of vertex `i` are `adjncy[xadj[i]..xadj[i + 1]]`, sorted and without
/// duplicates or self loops. Every edge is stored in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjacencyGraph {
    xadj: Vec<usize>,
    adjncy: Vec<usize>,
}

impl AdjacencyGraph {
    /// Builds the graph of `A + Aᵀ` from a compressed-column pattern.
    ///
    /// The pattern is trusted to satisfy the compressed-column invariants.
    pub fn from_pattern(n: usize, colptr: &[usize], rowind: &[usize]) -> Self {
        // count both directions of every off-diagonal entry
        let mut degree = vec![0usize; n];
        for j in 0..n {
            for &i in &rowind[colptr[j]..colptr[j + 1]] {
                if i != j {
                    degree[i] += 1;
                    degree[j] += 1;
                }
            }
        }

        let mut xadj = vec![0usize; n + 1];
        for i in 0..n {
            xadj[i + 1] = xadj[i] + degree[i];
        }
        let mut next = xadj.clone();
        let mut adjncy = vec![0usize; xadj[n]];
        for j in 0..n {
            for &i in &rowind[colptr[j]..colptr[j + 1]] {
                if i != j {
                    adjncy[next[i]] = j;
                    next[i] += 1;
                    adjncy[next[j]] = i;
                    next[j] += 1;
                }
            }
        }

        // sort and compact each list in place
        let mut write = 0;
        let mut compact_xadj = vec![0usize; n + 1];
        for i in 0..n {
            let (start, end) = (xadj[i], xadj[i + 1]);
            adjncy[start..end].sort_unstable();
            let mut last = usize::MAX;
            for p in start..end {
                let v = adjncy[p];
                if v != last {
                    adjncy[write] = v;
                    write += 1;
                    last = v;
                }
            }
            compact_xadj[i + 1] = write;
        }
        adjncy.truncate(write);

        Self {
            xadj: compact_xadj,
            adjncy,
        }
    }

    pub fn n(&self) -> usize {
        self.xadj.len() - 1
    }

    /// Number of stored (directed) edges, i.e. twice the number of undirected edges.
    pub fn nnz(&self) -> usize {
        self.adjncy.len()
    }

    pub fn xadj(&self) -> &[usize] {
        &self.xadj
    }

    pub fn adjncy(&self) -> &[usize] {
        &self.adjncy
    }

    pub fn neighbors(&self, i: usize) -> &[usize] {
        &self.adjncy[self.xadj[i]..self.xadj[i + 1]]
    }

    pub fn degree(&self, i: usize) -> usize {
        self.xadj[i + 1] - self.xadj[i]
    }
}

/// Strategy computing a fill-reducing permutation from an adjacency graph.
pub trait FillReducingOrdering {
    fn name(&self) -> &'static str;

    fn compute_ordering(&self, graph: &AdjacencyGraph) -> Result<Permutation, SolverError>;
}

/// Keeps the natural order.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityOrdering;

impl FillReducingOrdering for IdentityOrdering {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn compute_ordering(&self, graph: &AdjacencyGraph) -> Result<Permutation, SolverError> {
        Ok(Permutation::identity(graph.n()))
    }
}

/// Approximate minimum degree ordering provided by faer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibraryOrdering;

impl FillReducingOrdering for LibraryOrdering {
    fn name(&self) -> &'static str {
        "library"
    }

    #[cfg(feature = "library-ordering")]
    fn compute_ordering(&self, graph: &AdjacencyGraph) -> Result<Permutation, SolverError> {
        use faer::dyn_stack::{MemBuffer, MemStack};
        use faer::sparse::SymbolicSparseColMatRef;
        use faer::sparse::linalg::amd;

        let n = graph.n();
        let failed = |reason: String| SolverError::OrderingFailed {
            method: self.name(),
            reason,
        };

        let mut perm = Vec::new();
        let mut iperm = Vec::new();
        perm.try_reserve_exact(n)
            .map_err(|_| SolverError::MemoryReservation)?;
        iperm
            .try_reserve_exact(n)
            .map_err(|_| SolverError::MemoryReservation)?;
        perm.resize(n, 0usize);
        iperm.resize(n, 0usize);

        // The graph arrays already form a sorted symmetric pattern.
        let pattern = SymbolicSparseColMatRef::new_checked(n, n, graph.xadj(), None, graph.adjncy());

        let mut mem = MemBuffer::try_new(amd::order_scratch::<usize>(n, graph.nnz()))
            .map_err(|_| SolverError::MemoryReservation)?;
        amd::order(
            &mut perm,
            &mut iperm,
            pattern,
            amd::Control::default(),
            MemStack::new(&mut mem),
        )
        .map_err(|err| failed(format!("{err:?}")))?;

        Permutation::try_new(perm, iperm).map_err(|err| failed(err.to_string()))
    }

    #[cfg(not(feature = "library-ordering"))]
    fn compute_ordering(&self, _graph: &AdjacencyGraph) -> Result<Permutation, SolverError> {
        Err(SolverError::OrderingFailed {
            method: self.name(),
            reason: "not available in this build".to_string(),
        })
    }
}

/// Minimum degree ordering on the quotient graph.
///
/// Eliminated vertices become elements; an element adjacent to a newly eliminated vertex is
/// absorbed into the new element, so the graph never stores fill edges explicitly. Degrees are
/// exact external degrees and ties are broken by the smallest index, which makes the ordering
/// deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinimumDegreeOrdering;

impl FillReducingOrdering for MinimumDegreeOrdering {
    fn name(&self) -> &'static str {
        "amd"
    }

    fn compute_ordering(&self, graph: &AdjacencyGraph) -> Result<Permutation, SolverError> {
        let perm = QuotientGraph::new(graph).eliminate_all();
        Permutation::try_from_perm(perm)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Variable { degree: usize },
    Element,
    Absorbed,
}

struct QuotientGraph {
    nodes: Vec<Node>,
    /// Variables: adjacent variables and elements. Elements: the variables they cover.
    adj: Vec<Vec<usize>>,
    heap: BinaryHeap<Reverse<(usize, usize)>>,
    marker: Vec<usize>,
    mark: usize,
}

impl QuotientGraph {
    fn new(graph: &AdjacencyGraph) -> Self {
        let n = graph.n();
        let adj: Vec<Vec<usize>> = (0..n).map(|i| graph.neighbors(i).to_vec()).collect();
        let nodes = (0..n)
            .map(|i| Node::Variable {
                degree: graph.degree(i),
            })
            .collect();
        let heap = (0..n).map(|i| Reverse((graph.degree(i), i))).collect();

        Self {
            nodes,
            adj,
            heap,
            marker: vec![0; n],
            mark: 0,
        }
    }

    fn next_mark(&mut self) -> usize {
        self.mark += 1;
        self.mark
    }

    fn eliminate_all(mut self) -> Vec<usize> {
        let n = self.nodes.len();
        let mut perm = Vec::with_capacity(n);
        while let Some(Reverse((degree, p))) = self.heap.pop() {
            match self.nodes[p] {
                // stale heap entry
                Node::Variable { degree: current } if current != degree => continue,
                Node::Variable { .. } => {
                    perm.push(p);
                    self.eliminate(p);
                }
                Node::Element | Node::Absorbed => continue,
            }
        }
        perm
    }

    fn eliminate(&mut self, p: usize) {
        let mark = self.next_mark();
        self.marker[p] = mark;

        // reach of p: adjacent variables plus variables covered by adjacent elements
        let mut reach = Vec::new();
        let mut elements = Vec::new();
        for &v in &self.adj[p] {
            match self.nodes[v] {
                Node::Variable { .. } => {
                    if self.marker[v] != mark {
                        self.marker[v] = mark;
                        reach.push(v);
                    }
                }
                Node::Element => elements.push(v),
                Node::Absorbed => {}
            }
        }
        for &e in &elements {
            for &v in &self.adj[e] {
                if matches!(self.nodes[v], Node::Variable { .. }) && self.marker[v] != mark {
                    self.marker[v] = mark;
                    reach.push(v);
                }
            }
        }

        // p becomes the element covering its reach and absorbs its neighboring elements
        self.nodes[p] = Node::Element;
        for &e in &elements {
            self.nodes[e] = Node::Absorbed;
            self.adj[e] = Vec::new();
        }
        self.adj[p] = reach.clone();

        for &v in &reach {
            self.refresh_variable(v, p);
        }
    }

    /// Drops dead references from the list of `v`, links it to element `e` and recomputes its
    /// external degree.
    fn refresh_variable(&mut self, v: usize, e: usize) {
        let mut list = std::mem::take(&mut self.adj[v]);
        list.retain(|&u| u != e && matches!(self.nodes[u], Node::Variable { .. } | Node::Element));
        // variables covered by e are reachable through e
        let mark = self.next_mark();
        for &u in &self.adj[e] {
            self.marker[u] = mark;
        }
        list.retain(|&u| !(matches!(self.nodes[u], Node::Variable { .. }) && self.marker[u] == mark));
        list.push(e);

        let mark = self.next_mark();
        self.marker[v] = mark;
        let mut degree = 0;
        for &u in &list {
            match self.nodes[u] {
                Node::Variable { .. } => {
                    if self.marker[u] != mark {
                        self.marker[u] = mark;
                        degree += 1;
                    }
                }
                Node::Element => {
                    for &w in &self.adj[u] {
                        if matches!(self.nodes[w], Node::Variable { .. }) && self.marker[w] != mark {
                            self.marker[w] = mark;
                            degree += 1;
                        }
                    }
                }
                Node::Absorbed => {}
            }
        }

        self.adj[v] = list;
        self.nodes[v] = Node::Variable { degree };
        self.heap.push(Reverse((degree, v)));
    }
}

/// Ordering method selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingMethod {
    #[default]
    Library,
    Identity,
    Amd,
}

impl OrderingMethod {
    pub fn strategy(&self) -> Box<dyn FillReducingOrdering> {
        match self {
            OrderingMethod::Library => Box::new(LibraryOrdering),
            OrderingMethod::Identity => Box::new(IdentityOrdering),
            OrderingMethod::Amd => Box::new(MinimumDegreeOrdering),
        }
    }
}

impl fmt::Display for OrderingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderingMethod::Library => "library",
            OrderingMethod::Identity => "identity",
            OrderingMethod::Amd => "amd",
        };
        f.write_str(name)
    }
}

impl FromStr for OrderingMethod {
    type Err = SolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "library" => Ok(OrderingMethod::Library),
            "identity" | "natural" => Ok(OrderingMethod::Identity),
            "amd" => Ok(OrderingMethod::Amd),
            _ => Err(SolverError::InvalidOptionValue {
                name: "ordering".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Computes an ordering with `strategy`, degrading to the identity permutation when the strategy
/// fails or returns something that is not a permutation of `[0, n)`.
pub fn compute_ordering_with(strategy: &dyn FillReducingOrdering, graph: &AdjacencyGraph) -> Permutation {
    let n = graph.n();
    match strategy.compute_ordering(graph) {
        Ok(perm) if perm.n() == n => {
            debug!("{} ordering computed for n = {n}", strategy.name());
            perm
        }
        Ok(perm) => {
            warn!(
                "{} ordering returned {} entries for n = {n}, using identity ordering",
                strategy.name(),
                perm.n()
            );
            Permutation::identity(n)
        }
        Err(err) => {
            warn!("{} ordering unavailable ({err}), using identity ordering", strategy.name());
            Permutation::identity(n)
        }
    }
}

/// Computes an ordering with the selected method; never fails.
pub fn compute_ordering(method: OrderingMethod, graph: &AdjacencyGraph) -> Permutation {
    compute_ordering_with(method.strategy().as_ref(), graph)
}
