//! # Sparse LDLᵀ Factorization
//!
//! Up-looking `PAPᵀ = LDLᵀ` with a unit lower triangular `L` and a diagonal `D`. Row `k` of `L` is
//! obtained from a sparse triangular solve with the rows already computed, restricted to the row
//! subtree of the elimination tree, so the work is proportional to the flops of the factorization.
//! Negative pivots are accepted, which makes the factorization usable for symmetric
//! quasi-definite systems (e.g. constrained dynamics); only pivots that are too small relative to
//! the diagonal entry they come from are rejected.

use crate::linalg::solver::{NumericFactor, SolverError, SparseDirectSolver};
use crate::linalg::symbolic::{FactorStructure, RowReach, SymbolicFactorization};
use crate::linalg::triangular::{TriangularFactor, solve_diagonal};
use crate::linalg::try_filled;
use crate::options::SolverOptions;
use crate::{E, Real};

/// Sparse LDLᵀ solver with pattern-aware refactorization.
pub type SparseLdlSolver = SparseDirectSolver<LdlFactor>;

/// Numeric LDLᵀ factors of a permuted matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct LdlFactor<T = E> {
    l: TriangularFactor<T>,
    d: Vec<T>,
    d_inv: Vec<T>,
}

impl<T: Real> LdlFactor<T> {
    /// Factorizes the upper triangle of `PAPᵀ` whose values are laid out along
    /// `symbolic.pattern()`.
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
        let mut d = try_filled(n, T::zero())?;
        let mut d_inv = try_filled(n, T::zero())?;
        let mut y = try_filled(n, T::zero())?;
        let mut next = try_filled(n, 0usize)?;
        next.copy_from_slice(&symbolic.l_colptr()[..n]);
        let mut reach = RowReach::new(n)?;

        let (l_colptr, l_rowind, l_values) = l.parts_mut();
        for k in 0..n {
            let rows = &rowind[colptr[k]..colptr[k + 1]];
            let mut diag = T::zero();
            for (&i, &v) in rows.iter().zip(&values[colptr[k]..colptr[k + 1]]) {
                if i == k {
                    diag = v;
                } else {
                    y[i] = v;
                }
            }

            // y = L(0..k, 0..k) \ A(0..k, k), consumed column by column
            let mut dk = diag;
            for &c in reach.compute(k, rows, etree) {
                let yc = y[c];
                y[c] = T::zero();
                let tail = next[c];
                for q in l_colptr[c]..tail {
                    let i = l_rowind[q];
                    y[i] = y[i] - l_values[q] * yc;
                }
                let lkc = yc * d_inv[c];
                l_rowind[tail] = k;
                l_values[tail] = lkc;
                next[c] += 1;
                dk = dk - yc * lkc;
            }

            if !dk.is_finite()
                || dk == T::zero()
                || dk.abs() <= pivot_threshold * T::one().max(diag.abs())
            {
                return Err(SolverError::NotPositiveDefinite {
                    column: perm[k],
                    pivot: dk.to_f64().unwrap_or(E::NAN),
                });
            }
            d[k] = dk;
            d_inv[k] = dk.recip();
        }

        Ok(Self { l, d, d_inv })
    }

    pub fn l(&self) -> &TriangularFactor<T> {
        &self.l
    }

    pub fn d(&self) -> &[T] {
        &self.d
    }

    /// Number of positive and negative entries of `D`.
    pub fn inertia(&self) -> (usize, usize) {
        let positive = self.d.iter().filter(|&&d| d > T::zero()).count();
        (positive, self.d.len() - positive)
    }

    /// Solves `LDLᵀ x = b` in place.
    pub fn solve_in_place(&self, x: &mut [T]) {
        self.l.solve_lower_unit(x);
        solve_diagonal(&self.d_inv, x);
        self.l.solve_lower_unit_transpose(x);
    }
}

pub(crate) fn check_symmetric(
    symbolic: &SymbolicFactorization,
    nvalues: usize,
) -> Result<(), SolverError> {
    if symbolic.structure() != FactorStructure::Symmetric {
        return Err(SolverError::InvalidStructure {
            reason: "symmetric factorization requires a symmetric analysis".to_string(),
        });
    }
    if nvalues != symbolic.pattern().nnz() {
        return Err(SolverError::InvalidStructure {
            reason: format!(
                "{nvalues} values for a permuted pattern of {} entries",
                symbolic.pattern().nnz()
            ),
        });
    }
    Ok(())
}

impl NumericFactor for LdlFactor<E> {
    const NAME: &'static str = "ldlt";

    const STRUCTURE: FactorStructure = FactorStructure::Symmetric;

    fn factorize(
        symbolic: &SymbolicFactorization,
        values: &[E],
        options: &SolverOptions,
    ) -> Result<Self, SolverError> {
        LdlFactor::factorize(symbolic, values, options.pivot_threshold)
    }

    fn solve_permuted(&self, x: &mut [E], _work: &mut [E]) {
        self.solve_in_place(x);
    }

    fn solve_transpose_permuted(&self, x: &mut [E], _work: &mut [E]) {
        self.solve_in_place(x);
    }

    fn nnz(&self) -> usize {
        self.l.nnz() + self.d.len()
    }
}

#[cfg(test)]
mod tests {
    use faer::Mat;
    use faer::sparse::{SparseColMat, Triplet};
    use rstest::rstest;

    use super::*;
    use crate::I;
    use crate::linalg::csc::SparseMatrixCsc;
    use crate::linalg::ordering::{OrderingMethod, Permutation};
    use crate::linalg::pattern::PatternChange;
    use crate::linalg::solver::LinearSolver;

    fn from_dense(rows: &[&[E]]) -> SparseColMat<I, E> {
        let n = rows.len();
        let mut triplets = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                if v != 0.0 {
                    triplets.push(Triplet::new(i, j, v));
                }
            }
        }
        SparseColMat::try_new_from_triplets(n, n, &triplets).unwrap()
    }

    #[test]
    fn test_two_by_two() {
        let mat = from_dense(&[&[4.0, 1.0], &[1.0, 3.0]]);
        let mut solver = SparseLdlSolver::new(SolverOptions::new());
        solver.invert(&mat).unwrap();

        let b = Mat::from_fn(2, 1, |i, _| [1.0, 2.0][i]);
        let x = solver.solve(b.as_ref()).unwrap();
        assert!((x[(0, 0)] - 1.0 / 11.0).abs() < 1e-12);
        assert!((x[(1, 0)] - 7.0 / 11.0).abs() < 1e-12);
    }

    #[test]
    fn test_quasi_definite() {
        // [K  Bᵀ]
        // [B  -C]
        let mat = from_dense(&[
            &[4.0, 1.0, 1.0],
            &[1.0, 3.0, 0.0],
            &[1.0, 0.0, -2.0],
        ]);
        let csc = SparseMatrixCsc::from_assembled(&mat).unwrap();
        let symbolic = SymbolicFactorization::with_permutation(
            &csc,
            Permutation::identity(3),
            FactorStructure::Symmetric,
        )
        .unwrap();
        let mut values = Vec::new();
        symbolic.pattern().gather(csc.values(), &mut values).unwrap();
        let factor = LdlFactor::factorize(&symbolic, &values, 1e-14).unwrap();
        assert_eq!(factor.inertia(), (2, 1));

        let mut solver = SparseLdlSolver::new(SolverOptions::new());
        solver.invert(&mat).unwrap();
        let b = Mat::from_fn(3, 1, |i, _| (i + 1) as E);
        let x = solver.solve(b.as_ref()).unwrap();
        assert!((&b - &mat * &x).norm_l2() < 1e-12);
    }

    #[rstest]
    fn test_singular(
        #[values(OrderingMethod::Identity, OrderingMethod::Amd)] ordering: OrderingMethod,
    ) {
        let mat = from_dense(&[&[1.0, 2.0], &[2.0, 4.0]]);
        let mut solver = SparseLdlSolver::new(SolverOptions::new().with_ordering(ordering));
        let err = solver.invert(&mat).unwrap_err();
        assert!(matches!(err, SolverError::NotPositiveDefinite { .. }));
        assert!(!solver.is_factorized());
    }

    #[test]
    fn test_zero_pivot_rejected_for_any_threshold() {
        let csc = SparseMatrixCsc::from_assembled(&from_dense(&[&[1.0, 2.0], &[2.0, 4.0]])).unwrap();
        let symbolic = SymbolicFactorization::with_permutation(
            &csc,
            Permutation::identity(2),
            FactorStructure::Symmetric,
        )
        .unwrap();
        let mut values = Vec::new();
        symbolic.pattern().gather(csc.values(), &mut values).unwrap();

        for threshold in [1e-14, 0.0, -1.0] {
            assert_eq!(
                LdlFactor::factorize(&symbolic, &values, threshold).err(),
                Some(SolverError::NotPositiveDefinite {
                    column: 1,
                    pivot: 0.0
                })
            );
        }
    }

    #[test]
    fn test_pivot_reported_in_original_numbering() {
        // the zero pivot sits at original column 0, eliminated last
        let mat = from_dense(&[&[0.0, 0.0], &[0.0, 1.0]]);
        let csc = SparseMatrixCsc::try_new(2, vec![0, 1, 2], vec![0, 1], vec![0.0, 1.0]).unwrap();
        assert_eq!(csc.nnz(), 2);

        let reversed = Permutation::try_from_perm(vec![1, 0]).unwrap();
        let symbolic =
            SymbolicFactorization::with_permutation(&csc, reversed, FactorStructure::Symmetric)
                .unwrap();
        let mut values = Vec::new();
        symbolic.pattern().gather(csc.values(), &mut values).unwrap();
        assert_eq!(
            LdlFactor::factorize(&symbolic, &values, 1e-14),
            Err(SolverError::NotPositiveDefinite {
                column: 0,
                pivot: 0.0
            })
        );
        // the dense conversion drops the zero, leaving a structurally singular matrix
        let mut solver = SparseLdlSolver::new(SolverOptions::new());
        assert_eq!(
            solver.invert(&mat),
            Err(SolverError::SingularStructure { column: 0 })
        );
    }

    #[test]
    fn test_values_only_update() {
        let first = from_dense(&[&[4.0, 1.0], &[1.0, 3.0]]);
        let second = from_dense(&[&[5.0, 1.0], &[1.0, 6.0]]);
        let mut solver = SparseLdlSolver::new(SolverOptions::new());

        solver.invert(&first).unwrap();
        solver.invert(&second).unwrap();
        assert_eq!(solver.statistics().symbolic_factorizations, 1);
        assert_eq!(solver.statistics().numeric_factorizations, 2);
        assert_eq!(solver.statistics().last_change, Some(PatternChange::Values));

        let b = Mat::from_fn(2, 1, |i, _| [1.0, 2.0][i]);
        let x = solver.solve(b.as_ref()).unwrap();
        assert!((&b - &second * &x).norm_l2() < 1e-12);
    }
}
