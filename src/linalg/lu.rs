//! # Sparse LU Factorization
//!
//! Left-looking `Pr (PAPᵀ) = LU` for general square matrices, where `P` is the fill-reducing
//! permutation (computed on the pattern of `A + Aᵀ`) and `Pr` the row interchanges chosen while
//! factorizing. Column `k` of `L` and `U` comes from a sparse triangular solve with the columns
//! already computed; its nonzero pattern is the set of rows reachable from the pattern of column
//! `k` of the matrix in the graph of `L`, found with a depth-first search.
//!
//! Pivoting is threshold partial pivoting: the diagonal entry is kept whenever its magnitude is
//! at least `tolerance` times the largest candidate of the column, which keeps the fill-reducing
//! ordering intact on diagonally dominant systems. Otherwise the largest candidate is taken.
//!
//! ## Example Usage
//! ```
//! use faer::sparse::{SparseColMat, Triplet};
//! use stepsolve::linalg::lu::SparseLuSolver;
//! use stepsolve::linalg::solver::LinearSolver;
//! use stepsolve::options::SolverOptions;
//!
//! // Non-symmetric, with a zero on the diagonal
//! let n = 3;
//! let triplets = vec![
//!     Triplet::new(0, 1, 2.0),
//!     Triplet::new(1, 0, 1.0),
//!     Triplet::new(1, 1, 1.0),
//!     Triplet::new(2, 1, -1.0),
//!     Triplet::new(2, 2, 3.0),
//! ];
//! let mat = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets).unwrap();
//!
//! let mut solver = SparseLuSolver::new(SolverOptions::new());
//! solver.invert(&mat).unwrap();
//! let b = faer::Mat::from_fn(n, 1, |i, _| (i + 1) as f64);
//! let x = solver.solve(b.as_ref()).unwrap();
//! assert!((&b - &mat * &x).norm_l2() < 1e-12);
//! ```

use crate::linalg::solver::{NumericFactor, SolverError, SparseDirectSolver};
use crate::linalg::symbolic::{FactorStructure, SymbolicFactorization};
use crate::linalg::triangular::TriangularFactor;
use crate::linalg::try_filled;
use crate::options::SolverOptions;
use crate::{E, Real};

/// Sparse LU solver with pattern-aware refactorization.
pub type SparseLuSolver = SparseDirectSolver<LuFactor>;

const UNPIVOTED: usize = usize::MAX;

/// Numeric LU factors of a permuted matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct LuFactor<T = E> {
    /// Strictly lower part of the unit lower factor, rows in pivot order.
    l: TriangularFactor<T>,
    /// Strictly upper part of `U`.
    u: TriangularFactor<T>,
    u_diag: Vec<T>,
    /// `pinv[i]` is the pivot step at which row `i` of the permuted matrix was chosen.
    pinv: Vec<usize>,
}

/// Depth-first search over the graph of the columns of `L` computed so far.
struct Reach {
    marked: Vec<bool>,
    /// (node, next entry of its `L` column, end of its `L` column)
    stack: Vec<(usize, usize, usize)>,
    postorder: Vec<usize>,
}

impl Reach {
    fn new(n: usize) -> Result<Self, SolverError> {
        let mut stack = Vec::new();
        let mut postorder = Vec::new();
        stack
            .try_reserve_exact(n)
            .map_err(|_| SolverError::MemoryReservation)?;
        postorder
            .try_reserve_exact(n)
            .map_err(|_| SolverError::MemoryReservation)?;
        Ok(Self {
            marked: try_filled(n, false)?,
            stack,
            postorder,
        })
    }

    /// Rows reachable from `rows`, in reverse topological order (dependencies last).
    fn compute(
        &mut self,
        rows: &[usize],
        pinv: &[usize],
        l_colptr: &[usize],
        l_rowind: &[usize],
    ) -> &[usize] {
        self.postorder.clear();
        for &start in rows {
            if self.marked[start] {
                continue;
            }
            self.push(start, pinv, l_colptr);
            while let Some(&(j, p, end)) = self.stack.last() {
                if p < end {
                    let top = self.stack.len() - 1;
                    self.stack[top].1 = p + 1;
                    let i = l_rowind[p];
                    if !self.marked[i] {
                        self.push(i, pinv, l_colptr);
                    }
                } else {
                    self.stack.pop();
                    self.postorder.push(j);
                }
            }
        }
        &self.postorder
    }

    fn push(&mut self, j: usize, pinv: &[usize], l_colptr: &[usize]) {
        self.marked[j] = true;
        let (p, end) = match pinv[j] {
            UNPIVOTED => (0, 0),
            col => (l_colptr[col], l_colptr[col + 1]),
        };
        self.stack.push((j, p, end));
    }

    fn clear(&mut self) {
        for &j in &self.postorder {
            self.marked[j] = false;
        }
    }
}

fn reserve<T>(rowind: &mut Vec<usize>, values: &mut Vec<T>, additional: usize) -> Result<(), SolverError> {
    rowind
        .try_reserve(additional)
        .map_err(|_| SolverError::MemoryReservation)?;
    values
        .try_reserve(additional)
        .map_err(|_| SolverError::MemoryReservation)
}

impl<T: Real> LuFactor<T> {
    /// Factorizes the full `PAPᵀ` whose values are laid out along `symbolic.pattern()`.
    pub fn factorize(
        symbolic: &SymbolicFactorization,
        values: &[T],
        tolerance: T,
    ) -> Result<Self, SolverError> {
        if symbolic.structure() != FactorStructure::Unsymmetric {
            return Err(SolverError::InvalidStructure {
                reason: "LU factorization requires an unsymmetric analysis".to_string(),
            });
        }
        let pattern = symbolic.pattern();
        if values.len() != pattern.nnz() {
            return Err(SolverError::InvalidStructure {
                reason: format!(
                    "{} values for a permuted pattern of {} entries",
                    values.len(),
                    pattern.nnz()
                ),
            });
        }

        let n = symbolic.n();
        let (colptr, rowind) = (pattern.colptr(), pattern.rowind());
        let perm = symbolic.perm().perm();
        let estimate = symbolic.nnz_l().saturating_sub(n);

        let mut l_colptr = Vec::new();
        let mut u_colptr = Vec::new();
        l_colptr
            .try_reserve_exact(n + 1)
            .map_err(|_| SolverError::MemoryReservation)?;
        u_colptr
            .try_reserve_exact(n + 1)
            .map_err(|_| SolverError::MemoryReservation)?;
        l_colptr.push(0);
        u_colptr.push(0);
        let (mut l_rowind, mut l_values) = (Vec::new(), Vec::new());
        let (mut u_rowind, mut u_values) = (Vec::new(), Vec::new());
        reserve(&mut l_rowind, &mut l_values, estimate)?;
        reserve(&mut u_rowind, &mut u_values, estimate)?;

        let mut u_diag = try_filled(n, T::zero())?;
        let mut pinv = try_filled(n, UNPIVOTED)?;
        let mut x = try_filled(n, T::zero())?;
        let mut reach = Reach::new(n)?;

        for k in 0..n {
            let rows = &rowind[colptr[k]..colptr[k + 1]];
            let nodes = reach.compute(rows, &pinv, &l_colptr, &l_rowind);
            for (&i, &v) in rows.iter().zip(&values[colptr[k]..colptr[k + 1]]) {
                x[i] = v;
            }

            // x = L \ A(:, k), visiting every row before the rows it updates
            for &j in nodes.iter().rev() {
                let col = pinv[j];
                if col == UNPIVOTED {
                    continue;
                }
                let xj = x[j];
                for p in l_colptr[col]..l_colptr[col + 1] {
                    let i = l_rowind[p];
                    x[i] = x[i] - l_values[p] * xj;
                }
            }

            reserve(&mut u_rowind, &mut u_values, nodes.len())?;
            let mut ipiv = None;
            let mut largest = T::zero();
            for &i in nodes {
                if pinv[i] == UNPIVOTED {
                    let magnitude = x[i].abs();
                    if ipiv.is_none() || magnitude > largest {
                        largest = magnitude;
                        ipiv = Some(i);
                    }
                } else {
                    u_rowind.push(pinv[i]);
                    u_values.push(x[i]);
                }
            }

            if pinv[k] == UNPIVOTED && x[k] != T::zero() && x[k].abs() >= tolerance * largest {
                ipiv = Some(k);
            }
            let pivot = ipiv.map(|i| x[i]).unwrap_or(T::zero());
            let ipiv = match ipiv {
                Some(i) if pivot != T::zero() && pivot.is_finite() => i,
                _ => {
                    let pivot = pivot.to_f64().unwrap_or(E::NAN);
                    return Err(SolverError::SingularMatrix {
                        column: perm[k],
                        pivot,
                    });
                }
            };
            u_diag[k] = pivot;
            pinv[ipiv] = k;

            reserve(&mut l_rowind, &mut l_values, nodes.len())?;
            for &i in nodes {
                if pinv[i] == UNPIVOTED {
                    l_rowind.push(i);
                    l_values.push(x[i] / pivot);
                }
                x[i] = T::zero();
            }
            reach.clear();
            l_colptr.push(l_rowind.len());
            u_colptr.push(u_rowind.len());
        }

        // rows of L in pivot order
        for i in &mut l_rowind {
            *i = pinv[*i];
        }

        Ok(Self {
            l: TriangularFactor::from_parts(l_colptr, l_rowind, l_values),
            u: TriangularFactor::from_parts(u_colptr, u_rowind, u_values),
            u_diag,
            pinv,
        })
    }

    pub fn l(&self) -> &TriangularFactor<T> {
        &self.l
    }

    pub fn u(&self) -> &TriangularFactor<T> {
        &self.u
    }

    pub fn u_diag(&self) -> &[T] {
        &self.u_diag
    }

    /// Pivot step of every row of the permuted matrix.
    pub fn row_pivots(&self) -> &[usize] {
        &self.pinv
    }

    /// Solves `(PAPᵀ) x = b` in place; `work` must have the order of the matrix.
    pub fn solve_in_place(&self, x: &mut [T], work: &mut [T]) {
        for (i, &xi) in x.iter().enumerate() {
            work[self.pinv[i]] = xi;
        }
        self.l.solve_lower_unit(work);
        self.u.solve_upper(&self.u_diag, work);
        x.copy_from_slice(work);
    }

    /// Solves `(PAPᵀ)ᵀ x = b` in place; `work` must have the order of the matrix.
    pub fn solve_transpose_in_place(&self, x: &mut [T], work: &mut [T]) {
        self.u.solve_upper_transpose(&self.u_diag, x);
        self.l.solve_lower_unit_transpose(x);
        for (w, &row) in work.iter_mut().zip(&self.pinv) {
            *w = x[row];
        }
        x.copy_from_slice(work);
    }
}

impl NumericFactor for LuFactor<E> {
    const NAME: &'static str = "lu";

    const STRUCTURE: FactorStructure = FactorStructure::Unsymmetric;

    fn factorize(
        symbolic: &SymbolicFactorization,
        values: &[E],
        options: &SolverOptions,
    ) -> Result<Self, SolverError> {
        LuFactor::factorize(symbolic, values, options.tolerance)
    }

    fn solve_permuted(&self, x: &mut [E], work: &mut [E]) {
        self.solve_in_place(x, work);
    }

    fn solve_transpose_permuted(&self, x: &mut [E], work: &mut [E]) {
        self.solve_transpose_in_place(x, work);
    }

    fn nnz(&self) -> usize {
        self.l.nnz() + self.u.nnz() + self.u_diag.len()
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

    fn factor_natural(mat: &SparseColMat<I, E>, tolerance: E) -> Result<LuFactor, SolverError> {
        let csc = SparseMatrixCsc::from_assembled(mat).unwrap();
        let symbolic = SymbolicFactorization::with_permutation(
            &csc,
            Permutation::identity(csc.n()),
            FactorStructure::Unsymmetric,
        )?;
        let mut values = Vec::new();
        symbolic.pattern().gather(csc.values(), &mut values)?;
        LuFactor::factorize(&symbolic, &values, tolerance)
    }

    #[rstest]
    fn test_two_by_two(
        #[values(OrderingMethod::Library, OrderingMethod::Identity, OrderingMethod::Amd)]
        ordering: OrderingMethod,
    ) {
        let mat = from_dense(&[&[4.0, 1.0], &[1.0, 3.0]]);
        let mut solver = SparseLuSolver::new(SolverOptions::new().with_ordering(ordering));
        solver.invert(&mat).unwrap();

        let b = Mat::from_fn(2, 1, |i, _| [1.0, 2.0][i]);
        let x = solver.solve(b.as_ref()).unwrap();
        assert!((x[(0, 0)] - 1.0 / 11.0).abs() < 1e-12);
        assert!((x[(1, 0)] - 7.0 / 11.0).abs() < 1e-12);
    }

    #[test]
    fn test_singular() {
        let mat = from_dense(&[&[1.0, 2.0], &[2.0, 4.0]]);
        let mut solver =
            SparseLuSolver::new(SolverOptions::new().with_ordering(OrderingMethod::Identity));
        assert_eq!(
            solver.invert(&mat),
            Err(SolverError::SingularMatrix {
                column: 1,
                pivot: 0.0
            })
        );
        assert!(!solver.is_factorized());
    }

    #[test]
    fn test_zero_diagonal_needs_row_interchange() {
        let mat = from_dense(&[&[0.0, 1.0], &[1.0, 0.0]]);
        let factor = factor_natural(&mat, 1e-3).unwrap();
        assert_eq!(factor.row_pivots(), &[1, 0]);
        assert_eq!(factor.u_diag(), &[1.0, 1.0]);

        let mut solver = SparseLuSolver::new(SolverOptions::new());
        solver.invert(&mat).unwrap();
        let b = Mat::from_fn(2, 1, |i, _| [3.0, 5.0][i]);
        let x = solver.solve(b.as_ref()).unwrap();
        assert_eq!(x[(0, 0)], 5.0);
        assert_eq!(x[(1, 0)], 3.0);
    }

    #[rstest]
    #[case(1e-3, &[0, 1])]
    #[case(1.0, &[1, 0])]
    fn test_tolerance_controls_diagonal_preference(#[case] tolerance: E, #[case] pivots: &[usize]) {
        // the diagonal is half of the largest candidate of the first column
        let mat = from_dense(&[&[0.5, 1.0], &[1.0, 1.0]]);
        let factor = factor_natural(&mat, tolerance).unwrap();
        assert_eq!(factor.row_pivots(), pivots);
    }

    #[test]
    fn test_zero_tolerance_never_keeps_zero_diagonal() {
        let swap = from_dense(&[&[0.0, 1.0], &[1.0, 0.0]]);
        let factor = factor_natural(&swap, 0.0).unwrap();
        assert_eq!(factor.row_pivots(), &[1, 0]);
        assert!(factor.l().values().iter().all(|v| v.is_finite()));

        let singular = from_dense(&[&[1.0, 2.0], &[2.0, 4.0]]);
        assert_eq!(
            factor_natural(&singular, 0.0).err(),
            Some(SolverError::SingularMatrix {
                column: 1,
                pivot: 0.0
            })
        );
    }

    #[rstest]
    #[case(0.0)]
    #[case(-1.0)]
    #[case(E::NAN)]
    fn test_invalid_tolerance_option_is_rejected(#[case] tolerance: E) {
        let mat = from_dense(&[&[0.0, 1.0], &[1.0, 0.0]]);
        let mut solver = SparseLuSolver::new(SolverOptions::new().with_tolerance(tolerance));
        assert!(matches!(
            solver.invert(&mat),
            Err(SolverError::InvalidOptionValue { .. })
        ));
        assert!(!solver.is_factorized());
    }

    #[test]
    fn test_transpose_solve() {
        let mat = from_dense(&[&[2.0, 1.0, 0.0], &[0.0, 3.0, 1.0], &[1.0, 0.0, 4.0]]);
        let csc = SparseMatrixCsc::from_assembled(&mat).unwrap();
        let mut solver = SparseLuSolver::new(SolverOptions::new());
        solver.invert(&mat).unwrap();

        let r = Mat::from_fn(3, 1, |i, _| [1.0, -2.0, 0.5][i]);
        let mut z = Mat::<E>::zeros(3, 1);
        solver.solve_transpose(z.as_mut(), r.as_ref()).unwrap();

        let z_vec: Vec<E> = (0..3).map(|i| z[(i, 0)]).collect();
        let mut atz = vec![0.0; 3];
        csc.mul_transpose_vec(&z_vec, &mut atz).unwrap();
        for i in 0..3 {
            assert!((atz[i] - r[(i, 0)]).abs() < 1e-12);
        }

        let x = solver.solve(r.as_ref()).unwrap();
        assert!((&r - &mat * &x).norm_l2() < 1e-12);
    }

    #[test]
    fn test_fill_in() {
        // arrow matrix eliminated hub first: L and U fill completely
        let n = 4;
        let mut triplets = Vec::new();
        for j in 0..n {
            triplets.push(Triplet::new(j, j, 4.0));
            if j > 0 {
                triplets.push(Triplet::new(0, j, 1.0));
                triplets.push(Triplet::new(j, 0, 2.0));
            }
        }
        let mat = SparseColMat::<I, E>::try_new_from_triplets(n, n, &triplets).unwrap();
        let factor = factor_natural(&mat, 1e-3).unwrap();
        assert_eq!(factor.l().nnz(), n * (n - 1) / 2);
        assert_eq!(factor.u().nnz(), n * (n - 1) / 2);
        assert_eq!(factor.row_pivots(), &[0, 1, 2, 3]);
    }
}
