//! # Triangular Solves
//!
//! Substitution kernels shared by every factorization. A [`TriangularFactor`] stores the strictly
//! triangular part of a factor column by column; the diagonal, when it is not unit, is stored
//! separately and passed to the kernels. All kernels work in place on a dense vector that is
//! already expressed in the permuted numbering of the factor.

use crate::linalg::solver::SolverError;
use crate::Real;

/// Strictly lower or strictly upper triangular matrix in compressed-column form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriangularFactor<T> {
    colptr: Vec<usize>,
    rowind: Vec<usize>,
    values: Vec<T>,
}

impl<T: Real> TriangularFactor<T> {
    pub fn from_parts(colptr: Vec<usize>, rowind: Vec<usize>, values: Vec<T>) -> Self {
        debug_assert_eq!(rowind.len(), values.len());
        Self {
            colptr,
            rowind,
            values,
        }
    }

    /// Allocates a factor with a fixed column structure (`colptr`) and zeroed entries.
    pub fn with_colptr(colptr: Vec<usize>) -> Result<Self, SolverError> {
        let nnz = colptr.last().copied().unwrap_or(0);
        Ok(Self {
            colptr,
            rowind: crate::linalg::try_filled(nnz, 0usize)?,
            values: crate::linalg::try_filled(nnz, T::zero())?,
        })
    }

    pub fn n(&self) -> usize {
        self.colptr.len().saturating_sub(1)
    }

    /// Stored (off-diagonal) entries.
    pub fn nnz(&self) -> usize {
        self.rowind.len()
    }

    pub fn colptr(&self) -> &[usize] {
        &self.colptr
    }

    pub fn rowind(&self) -> &[usize] {
        &self.rowind
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub(crate) fn parts_mut(&mut self) -> (&[usize], &mut [usize], &mut [T]) {
        (&self.colptr, &mut self.rowind, &mut self.values)
    }

    fn col(&self, j: usize) -> impl Iterator<Item = (usize, T)> + '_ {
        let range = self.colptr[j]..self.colptr[j + 1];
        self.rowind[range.clone()]
            .iter()
            .copied()
            .zip(self.values[range].iter().copied())
    }

    /// Solves `L x = b` for a unit lower triangular `L`.
    pub fn solve_lower_unit(&self, x: &mut [T]) {
        for j in 0..self.n() {
            let xj = x[j];
            if xj != T::zero() {
                for (i, l) in self.col(j) {
                    x[i] = x[i] - l * xj;
                }
            }
        }
    }

    /// Solves `Lᵀ x = b` for a unit lower triangular `L`.
    pub fn solve_lower_unit_transpose(&self, x: &mut [T]) {
        for j in (0..self.n()).rev() {
            let mut xj = x[j];
            for (i, l) in self.col(j) {
                xj = xj - l * x[i];
            }
            x[j] = xj;
        }
    }

    /// Solves `L x = b` for a lower triangular `L` with diagonal `diag`.
    pub fn solve_lower(&self, diag: &[T], x: &mut [T]) {
        for j in 0..self.n() {
            let xj = x[j] / diag[j];
            x[j] = xj;
            for (i, l) in self.col(j) {
                x[i] = x[i] - l * xj;
            }
        }
    }

    /// Solves `Lᵀ x = b` for a lower triangular `L` with diagonal `diag`.
    pub fn solve_lower_transpose(&self, diag: &[T], x: &mut [T]) {
        for j in (0..self.n()).rev() {
            let mut xj = x[j];
            for (i, l) in self.col(j) {
                xj = xj - l * x[i];
            }
            x[j] = xj / diag[j];
        }
    }

    /// Solves `U x = b` for an upper triangular `U` with diagonal `diag`.
    pub fn solve_upper(&self, diag: &[T], x: &mut [T]) {
        for j in (0..self.n()).rev() {
            let xj = x[j] / diag[j];
            x[j] = xj;
            for (i, u) in self.col(j) {
                x[i] = x[i] - u * xj;
            }
        }
    }

    /// Solves `Uᵀ x = b` for an upper triangular `U` with diagonal `diag`.
    pub fn solve_upper_transpose(&self, diag: &[T], x: &mut [T]) {
        for j in 0..self.n() {
            let mut xj = x[j];
            for (i, u) in self.col(j) {
                xj = xj - u * x[i];
            }
            x[j] = xj / diag[j];
        }
    }
}

/// Solves `D x = b` for a diagonal `D` given by its inverse.
pub fn solve_diagonal<T: Real>(diag_inv: &[T], x: &mut [T]) {
    for (xi, &d) in x.iter_mut().zip(diag_inv) {
        *xi = *xi * d;
    }
}

/// `dst[k] = src[perm[k]]`.
pub fn permute<T: Copy>(perm: &[usize], src: &[T], dst: &mut [T]) {
    for (d, &old) in dst.iter_mut().zip(perm) {
        *d = src[old];
    }
}

/// `dst[perm[k]] = src[k]`, the inverse of [`permute`].
pub fn permute_inverse<T: Copy>(perm: &[usize], src: &[T], dst: &mut [T]) {
    for (&s, &old) in src.iter().zip(perm) {
        dst[old] = s;
    }
}
