//! # Symbolic Factorization
//!
//! The symbolic phase depends only on the sparsity pattern of the system matrix. It fixes the
//! fill-reducing permutation, builds the pattern of the permuted matrix that the numeric phase
//! reads, and for symmetric factorizations computes the elimination tree and the column counts of
//! `L`. Since the pattern of the assembled matrix rarely changes between time steps, the result is
//! computed once and shared (read-only) by every numeric factorization until the pattern changes.
//!
//! Symmetric factorizations (Cholesky, LDLT) read the upper triangle of `PAPᵀ`; entries of `A`
//! whose permuted position lies below the diagonal are ignored, unless the mirrored entry is not
//! stored, in which case the entry is transposed into the upper triangle. Both full symmetric
//! matrices and matrices storing a single triangle are therefore accepted.
//!
//! LU reads the full pattern of `PAPᵀ` where `P` is computed on the pattern of `A + Aᵀ`. The
//! column counts of the Cholesky factor of `P(A + Aᵀ)Pᵀ` are used as nonzero estimates for `L`
//! and `U`.

use log::trace;

use crate::linalg::csc::SparseMatrixCsc;
use crate::linalg::ordering::{AdjacencyGraph, OrderingMethod, Permutation, compute_ordering};
use crate::linalg::solver::SolverError;
use crate::linalg::try_filled;
use crate::Real;

/// Marks input entries that are not read by the numeric phase.
pub const NOT_STORED: usize = usize::MAX;

/// Which triangle(s) of the permuted matrix the numeric phase reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorStructure {
    /// Upper triangle of `PAPᵀ` (Cholesky, LDLT).
    Symmetric,
    /// Full `PAPᵀ` (LU).
    Unsymmetric,
}

/// Pattern of the permuted matrix together with the map from input entries to permuted entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermutedPattern {
    colptr: Vec<usize>,
    rowind: Vec<usize>,
    /// `scatter[p]` is the slot of input entry `p` in the permuted pattern, or [`NOT_STORED`].
    scatter: Vec<usize>,
}

impl PermutedPattern {
    /// Pattern of the upper triangle of `PAPᵀ`.
    fn upper<T>(mat: &SparseMatrixCsc<T>, perm: &Permutation) -> Result<Self, SolverError> {
        let n = mat.n();
        let iperm = perm.iperm();
        let nnz = mat.nnz();

        // (column, row, input entry, entry already in the upper triangle)
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(nnz)
            .map_err(|_| SolverError::MemoryReservation)?;
        for j in 0..n {
            let (rows, _) = mat.col(j);
            for (offset, &i) in rows.iter().enumerate() {
                let (r, c) = (iperm[i], iperm[j]);
                entries.push((r.max(c), r.min(c), mat.colptr()[j] + offset, r <= c));
            }
        }
        // within a slot the native upper entry sorts first
        entries.sort_unstable_by_key(|&(c, r, _, native)| (c, r, !native));

        let mut colptr = try_filled(n + 1, 0usize)?;
        let mut rowind = Vec::new();
        rowind
            .try_reserve_exact(nnz)
            .map_err(|_| SolverError::MemoryReservation)?;
        let mut scatter = try_filled(nnz, NOT_STORED)?;

        let mut last = None;
        for (c, r, p, _) in entries {
            if last == Some((c, r)) {
                continue;
            }
            scatter[p] = rowind.len();
            rowind.push(r);
            colptr[c + 1] += 1;
            last = Some((c, r));
        }
        for j in 0..n {
            colptr[j + 1] += colptr[j];
        }

        Ok(Self {
            colptr,
            rowind,
            scatter,
        })
    }

    /// Pattern of the full `PAPᵀ`.
    fn full<T>(mat: &SparseMatrixCsc<T>, perm: &Permutation) -> Result<Self, SolverError> {
        let n = mat.n();
        let iperm = perm.iperm();
        let nnz = mat.nnz();

        let mut colptr = try_filled(n + 1, 0usize)?;
        let mut rowind = try_filled(nnz, 0usize)?;
        let mut scatter = try_filled(nnz, NOT_STORED)?;

        for (k, &j) in perm.perm().iter().enumerate() {
            colptr[k + 1] = colptr[k] + (mat.colptr()[j + 1] - mat.colptr()[j]);
        }

        let mut slots: Vec<(usize, usize)> = Vec::new();
        for (k, &j) in perm.perm().iter().enumerate() {
            slots.clear();
            for p in mat.colptr()[j]..mat.colptr()[j + 1] {
                slots.push((iperm[mat.rowind()[p]], p));
            }
            slots.sort_unstable();
            for (offset, &(r, p)) in slots.iter().enumerate() {
                rowind[colptr[k] + offset] = r;
                scatter[p] = colptr[k] + offset;
            }
        }

        Ok(Self {
            colptr,
            rowind,
            scatter,
        })
    }

    pub fn colptr(&self) -> &[usize] {
        &self.colptr
    }

    pub fn rowind(&self) -> &[usize] {
        &self.rowind
    }

    pub fn scatter(&self) -> &[usize] {
        &self.scatter
    }

    pub fn nnz(&self) -> usize {
        self.rowind.len()
    }

    /// Writes the values of the input matrix into the permuted pattern.
    pub fn gather<T: Real>(&self, values: &[T], out: &mut Vec<T>) -> Result<(), SolverError> {
        if values.len() != self.scatter.len() {
            return Err(SolverError::InvalidStructure {
                reason: format!(
                    "{} values for a pattern of {} entries",
                    values.len(),
                    self.scatter.len()
                ),
            });
        }
        crate::linalg::try_reset(out, self.nnz(), T::zero())?;
        for (&slot, &v) in self.scatter.iter().zip(values) {
            if slot != NOT_STORED {
                out[slot] = v;
            }
        }
        Ok(())
    }
}

/// Result of the symbolic phase. Immutable once built.
#[derive(Debug, Clone)]
pub struct SymbolicFactorization {
    structure: FactorStructure,
    perm: Permutation,
    pattern: PermutedPattern,
    /// Parent of every column of `L` in the elimination tree, `None` for roots.
    etree: Vec<Option<usize>>,
    /// Strictly-lower nonzeros of every column of `L`.
    col_counts: Vec<usize>,
    l_colptr: Vec<usize>,
}

impl SymbolicFactorization {
    /// Orders and analyzes a matrix for a Cholesky or LDLT factorization.
    pub fn analyze_symmetric<T>(
        mat: &SparseMatrixCsc<T>,
        method: OrderingMethod,
    ) -> Result<Self, SolverError> {
        let graph = AdjacencyGraph::from_pattern(mat.n(), mat.colptr(), mat.rowind());
        let perm = compute_ordering(method, &graph);
        Self::with_permutation(mat, perm, FactorStructure::Symmetric)
    }

    /// Orders (on `A + Aᵀ`) and analyzes a matrix for an LU factorization.
    pub fn analyze_unsymmetric<T>(
        mat: &SparseMatrixCsc<T>,
        method: OrderingMethod,
    ) -> Result<Self, SolverError> {
        let graph = AdjacencyGraph::from_pattern(mat.n(), mat.colptr(), mat.rowind());
        let perm = compute_ordering(method, &graph);
        Self::with_permutation(mat, perm, FactorStructure::Unsymmetric)
    }

    /// Analyzes a matrix with a caller-provided permutation.
    pub fn with_permutation<T>(
        mat: &SparseMatrixCsc<T>,
        perm: Permutation,
        structure: FactorStructure,
    ) -> Result<Self, SolverError> {
        let n = mat.n();
        if perm.n() != n {
            return Err(SolverError::InvalidStructure {
                reason: format!("permutation of length {} for a matrix of order {n}", perm.n()),
            });
        }

        let upper = PermutedPattern::upper(mat, &perm)?;
        match structure {
            FactorStructure::Symmetric => check_diagonal(&upper, &perm)?,
            FactorStructure::Unsymmetric => check_rows_and_columns(mat)?,
        }

        let (etree, col_counts) = elimination_tree(n, upper.colptr(), upper.rowind())?;
        let mut l_colptr = try_filled(n + 1, 0usize)?;
        for j in 0..n {
            l_colptr[j + 1] = l_colptr[j] + col_counts[j];
        }

        let pattern = match structure {
            FactorStructure::Symmetric => upper,
            FactorStructure::Unsymmetric => PermutedPattern::full(mat, &perm)?,
        };

        trace!(
            "symbolic factorization: n = {n}, nnz(A) = {}, nnz(L) = {}",
            mat.nnz(),
            l_colptr[n] + n
        );

        Ok(Self {
            structure,
            perm,
            pattern,
            etree,
            col_counts,
            l_colptr,
        })
    }

    pub fn n(&self) -> usize {
        self.perm.n()
    }

    pub fn structure(&self) -> FactorStructure {
        self.structure
    }

    pub fn perm(&self) -> &Permutation {
        &self.perm
    }

    pub fn pattern(&self) -> &PermutedPattern {
        &self.pattern
    }

    pub fn etree(&self) -> &[Option<usize>] {
        &self.etree
    }

    pub fn col_counts(&self) -> &[usize] {
        &self.col_counts
    }

    /// Column pointers of the strictly lower part of `L`.
    pub fn l_colptr(&self) -> &[usize] {
        &self.l_colptr
    }

    /// Nonzeros of `L` including its diagonal. Exact for symmetric factorizations, an estimate
    /// for LU (exact when no row interchange happens).
    pub fn nnz_l(&self) -> usize {
        self.l_colptr[self.n()] + self.n()
    }

    /// Nonzeros of `U` including its diagonal (LU estimate, equals [`Self::nnz_l`]).
    pub fn nnz_u(&self) -> usize {
        self.nnz_l()
    }
}

/// Elimination tree and strictly-lower column counts of the Cholesky factor of a matrix whose
/// upper triangle has the given pattern.
///
/// Each row subtree is walked up the partial tree until a node already flagged for the current
/// column; every node on the walk gains one entry in its column. No ancestor compression is
/// done, so the flags are what bound the work to `nnz(L)`.
pub fn elimination_tree(
    n: usize,
    colptr: &[usize],
    rowind: &[usize],
) -> Result<(Vec<Option<usize>>, Vec<usize>), SolverError> {
    let mut etree = try_filled(n, None)?;
    let mut counts = try_filled(n, 0usize)?;
    let mut visited = try_filled(n, usize::MAX)?;

    for j in 0..n {
        visited[j] = j;
        for &row in &rowind[colptr[j]..colptr[j + 1]] {
            if row > j {
                return Err(SolverError::InvalidStructure {
                    reason: format!("entry ({row}, {j}) is below the diagonal"),
                });
            }
            // walk up the tree until reaching a column already visited for row j
            let mut i = row;
            while visited[i] != j {
                if etree[i].is_none() {
                    etree[i] = Some(j);
                }
                counts[i] += 1;
                visited[i] = j;
                match etree[i] {
                    Some(parent) => i = parent,
                    None => break,
                }
            }
        }
    }

    Ok((etree, counts))
}

/// Nonzero pattern of a row of `L`, i.e. the row subtree of the elimination tree.
pub(crate) struct RowReach {
    marked: Vec<bool>,
    path: Vec<usize>,
    order: Vec<usize>,
}

impl RowReach {
    pub(crate) fn new(n: usize) -> Result<Self, SolverError> {
        let mut path = Vec::new();
        let mut order = Vec::new();
        path.try_reserve_exact(n)
            .map_err(|_| SolverError::MemoryReservation)?;
        order
            .try_reserve_exact(n)
            .map_err(|_| SolverError::MemoryReservation)?;
        Ok(Self {
            marked: try_filled(n, false)?,
            path,
            order,
        })
    }

    /// Columns `j < k` with `L[k, j] != 0`, given the rows of column `k` of the upper pattern.
    /// Every column comes before its ancestors.
    pub(crate) fn compute(&mut self, k: usize, rows: &[usize], etree: &[Option<usize>]) -> &[usize] {
        self.order.clear();
        for &row in rows {
            // climb until reaching k or a column already on a path
            self.path.clear();
            let mut node = Some(row);
            while let Some(j) = node {
                if j >= k || self.marked[j] {
                    break;
                }
                self.marked[j] = true;
                self.path.push(j);
                node = etree[j];
            }
            self.order.extend(self.path.iter().rev());
        }
        for &j in &self.order {
            self.marked[j] = false;
        }
        self.order.reverse();
        &self.order
    }
}

fn check_diagonal(upper: &PermutedPattern, perm: &Permutation) -> Result<(), SolverError> {
    for k in 0..perm.n() {
        let rows = &upper.rowind()[upper.colptr()[k]..upper.colptr()[k + 1]];
        // rows are sorted, the diagonal is the last entry of an upper column
        if rows.last() != Some(&k) {
            return Err(SolverError::SingularStructure {
                column: perm.perm()[k],
            });
        }
    }
    Ok(())
}

fn check_rows_and_columns<T>(mat: &SparseMatrixCsc<T>) -> Result<(), SolverError> {
    let n = mat.n();
    let mut row_used = try_filled(n, false)?;
    for j in 0..n {
        let (rows, _) = mat.col(j);
        if rows.is_empty() {
            return Err(SolverError::SingularStructure { column: j });
        }
        for &i in rows {
            row_used[i] = true;
        }
    }
    match row_used.iter().position(|&used| !used) {
        Some(i) => Err(SolverError::SingularStructure { column: i }),
        None => Ok(()),
    }
}
