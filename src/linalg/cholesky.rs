//! # Sparse Cholesky Factorization
//!
//! Up-looking `PAPᵀ = LLᵀ` for symmetric positive definite matrices, the usual case for the
//! systems of an implicit time step (mass plus damping plus stiffness). The traversal is the same
//! as for [`crate::linalg::ldlt`]; the diagonal of `L` is stored separately from its strictly
//! lower part.
//!
//! ## Example Usage
//! ```
//! use faer::sparse::{SparseColMat, Triplet};
//! use stepsolve::linalg::cholesky::SparseCholeskySolver;
//! use stepsolve::linalg::solver::LinearSolver;
//! use stepsolve::options::SolverOptions;
//!
//! let n = 3;
//! let triplets = vec![
//!     Triplet::new(0, 0, 2.0),
//!     Triplet::new(0, 1, -1.0),
//!     Triplet::new(1, 0, -1.0),
//!     Triplet::new(1, 1, 2.0),
//!     Triplet::new(1, 2, -1.0),
//!     Triplet::new(2, 1, -1.0),
//!     Triplet::new(2, 2, 2.0),
//! ];
//! let mat = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets).unwrap();
//!
//! let mut solver = SparseCholeskySolver::new(SolverOptions::new());
//! solver.invert(&mat).unwrap();
//! let b = faer::Mat::from_fn(n, 1, |i, _| i as f64);
//! let x = solver.solve(b.as_ref()).unwrap();
//! assert!((&b - &mat * &x).norm_l2() < 1e-12);
//! ```

use crate::linalg::ldlt::check_symmetric;
use crate::linalg::solver::{NumericFactor, SolverError, SparseDirectSolver};
use crate::linalg::symbolic::{FactorStructure, RowReach, SymbolicFactorization};
use crate::linalg::triangular::TriangularFactor;
use crate::linalg::try_filled;
use crate::options::SolverOptions;
use crate::{E, Real};

/// Sparse Cholesky solver with pattern-aware refactorization.
pub type SparseCholeskySolver = SparseDirectSolver<CholeskyFactor>;

/// Numeric Cholesky factor of a permuted matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CholeskyFactor<T = E> {
    /// Strictly lower part of `L`.
    l: TriangularFactor<T>,
    diag: Vec<T>,
}

impl<T: Real> CholeskyFactor<T> {
    pub fn factorize(
        symbolic: &SymbolicFactorization,
        values: &[T],
        pivot_threshold: T,
    ) -> Result<Self, SolverError> {
        check_symmetric(symbolic, values.len())?;

        let n = symbolic.n();
        let pattern = symbolic.pattern();
        let (colptr, rowind) = (pattern.colptr(), pattern.rowind());
        let etree = symbolic.etree();
        let perm = symbolic.perm().perm();

        let mut l = TriangularFactor::with_colptr(symbolic.l_colptr().to_vec())?;
        let mut diag = try_filled(n, T::zero())?;
        let mut x = try_filled(n, T::zero())?;
        let mut next = try_filled(n, 0usize)?;
        next.copy_from_slice(&symbolic.l_colptr()[..n]);
        let mut reach = RowReach::new(n)?;

        let (l_colptr, l_rowind, l_values) = l.parts_mut();
        for k in 0..n {
            let rows = &rowind[colptr[k]..colptr[k + 1]];
            let mut akk = T::zero();
            for (&i, &v) in rows.iter().zip(&values[colptr[k]..colptr[k + 1]]) {
                if i == k {
                    akk = v;
                } else {
                    x[i] = v;
                }
            }

            let mut d = akk;
            for &c in reach.compute(k, rows, etree) {
                let lkc = x[c] / diag[c];
                x[c] = T::zero();
                let tail = next[c];
                for q in l_colptr[c]..tail {
                    let i = l_rowind[q];
                    x[i] = x[i] - l_values[q] * lkc;
                }
                l_rowind[tail] = k;
                l_values[tail] = lkc;
                next[c] += 1;
                d = d - lkc * lkc;
            }

            if !d.is_finite() || d <= T::zero() || d <= pivot_threshold * T::one().max(akk.abs())
            {
                return Err(SolverError::NotPositiveDefinite {
                    column: perm[k],
                    pivot: d.to_f64().unwrap_or(E::NAN),
                });
            }
            diag[k] = d.sqrt();
        }

        Ok(Self { l, diag })
    }

    pub fn l(&self) -> &TriangularFactor<T> {
        &self.l
    }

    pub fn diag(&self) -> &[T] {
        &self.diag
    }

    /// Solves `LLᵀ x = b` in place.
    pub fn solve_in_place(&self, x: &mut [T]) {
        self.l.solve_lower(&self.diag, x);
        self.l.solve_lower_transpose(&self.diag, x);
    }
}

impl NumericFactor for CholeskyFactor<E> {
    const NAME: &'static str = "cholesky";

    const STRUCTURE: FactorStructure = FactorStructure::Symmetric;

    fn factorize(
        symbolic: &SymbolicFactorization,
        values: &[E],
        options: &SolverOptions,
    ) -> Result<Self, SolverError> {
        CholeskyFactor::factorize(symbolic, values, options.pivot_threshold)
    }

    fn solve_permuted(&self, x: &mut [E], _work: &mut [E]) {
        self.solve_in_place(x);
    }

    fn solve_transpose_permuted(&self, x: &mut [E], _work: &mut [E]) {
        self.solve_in_place(x);
    }

    fn nnz(&self) -> usize {
        self.l.nnz() + self.diag.len()
    }
}
