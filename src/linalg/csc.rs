//! # Compressed-Column Storage
//!
//! [`SparseMatrixCsc`] is the storage format consumed by the ordering, symbolic and numeric phases.
//! Assembled system matrices arrive in whatever shape the simulation produced them (faer CSC or
//! CSR, dense blocks, or an already compressed matrix) and are translated through the
//! [`AssembledMatrix`] trait:
//! - indices are validated and the matrix must be square,
//! - row indices are sorted inside each column and duplicates are summed,
//! - exact zeros coming from dense sources are not stored, while explicit zeros stored by sparse
//!   sources are kept so that the pattern seen by the solver does not flicker between steps.

use faer::sparse::{
    SparseColMat, SparseColMatRef, SparseRowMat, SparseRowMatRef, SymbolicSparseColMat,
};
use faer::{Mat, MatRef};

use crate::linalg::solver::SolverError;
use crate::{E, I, Real};

/// An assembled system matrix handed over by the simulation.
///
/// Implementors only need to report their shape and visit their stored entries; the visiting
/// order is irrelevant and an entry may be visited several times (contributions are summed).
pub trait AssembledMatrix {
    fn nrows(&self) -> usize;

    fn ncols(&self) -> usize;

    /// Number of entries [`AssembledMatrix::for_each_entry`] is going to visit.
    fn nnz_hint(&self) -> usize;

    /// Calls `f(row, col, value)` for every stored entry.
    fn for_each_entry(&self, f: &mut dyn FnMut(usize, usize, E));
}

/// Square sparse matrix in compressed-column form.
///
/// Invariants (checked by every constructor):
/// - `colptr.len() == n + 1`, `colptr[0] == 0`, `colptr` is non-decreasing,
/// - `colptr[n] == rowind.len() == values.len()`,
/// - row indices are `< n` and strictly increasing inside each column.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrixCsc<T = E> {
    n: usize,
    colptr: Vec<usize>,
    rowind: Vec<usize>,
    values: Vec<T>,
}

impl<T> SparseMatrixCsc<T> {
    pub fn n(&self) -> usize {
        self.n
    }

    /// Number of stored entries, explicit zeros included.
    pub fn nnz(&self) -> usize {
        self.colptr[self.n]
    }

    /// Storage capacity for entries.
    pub fn nzmax(&self) -> usize {
        self.rowind.capacity().min(self.values.capacity())
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

    pub fn values_mut(&mut self) -> &mut [T] {
        &mut self.values
    }

    /// Row indices and values of column `j`.
    pub fn col(&self, j: usize) -> (&[usize], &[T]) {
        let range = self.colptr[j]..self.colptr[j + 1];
        (&self.rowind[range.clone()], &self.values[range])
    }
}

impl<T: Real> SparseMatrixCsc<T> {
    /// Builds a matrix from raw compressed-column arrays after validating them.
    pub fn try_new(
        n: usize,
        colptr: Vec<usize>,
        rowind: Vec<usize>,
        values: Vec<T>,
    ) -> Result<Self, SolverError> {
        check_structure(n, &colptr, &rowind)?;
        if values.len() != rowind.len() {
            return Err(SolverError::InvalidStructure {
                reason: format!(
                    "{} values for {} row indices",
                    values.len(),
                    rowind.len()
                ),
            });
        }
        Ok(Self {
            n,
            colptr,
            rowind,
            values,
        })
    }

    /// The `n x n` identity matrix.
    pub fn identity(n: usize) -> Self {
        Self {
            n,
            colptr: (0..=n).collect(),
            rowind: (0..n).collect(),
            values: vec![T::one(); n],
        }
    }

    /// Value stored at `(i, j)`, zero if the entry is not part of the pattern.
    pub fn get(&self, i: usize, j: usize) -> T {
        let (rows, vals) = self.col(j);
        match rows.binary_search(&i) {
            Ok(pos) => vals[pos],
            Err(_) => T::zero(),
        }
    }

    fn check_vec_len(&self, len: usize) -> Result<(), SolverError> {
        if len != self.n {
            return Err(SolverError::RhsDimensionMismatch {
                expected: self.n,
                found: len,
            });
        }
        Ok(())
    }

    /// Computes `y = A x`.
    pub fn mul_vec(&self, x: &[T], y: &mut [T]) -> Result<(), SolverError> {
        self.check_vec_len(x.len())?;
        self.check_vec_len(y.len())?;

        y.fill(T::zero());
        for j in 0..self.n {
            let xj = x[j];
            if xj == T::zero() {
                continue;
            }
            for p in self.colptr[j]..self.colptr[j + 1] {
                y[self.rowind[p]] = y[self.rowind[p]] + self.values[p] * xj;
            }
        }
        Ok(())
    }

    /// Computes `y = Aᵀ x`.
    pub fn mul_transpose_vec(&self, x: &[T], y: &mut [T]) -> Result<(), SolverError> {
        self.check_vec_len(x.len())?;
        self.check_vec_len(y.len())?;

        for j in 0..self.n {
            let mut acc = T::zero();
            for p in self.colptr[j]..self.colptr[j + 1] {
                acc = acc + self.values[p] * x[self.rowind[p]];
            }
            y[j] = acc;
        }
        Ok(())
    }

    /// Returns `Aᵀ`; the result has sorted columns by construction.
    pub fn transpose(&self) -> Self {
        let n = self.n;
        let nnz = self.nnz();

        let mut counts = vec![0usize; n + 1];
        for &i in &self.rowind {
            counts[i + 1] += 1;
        }
        for i in 0..n {
            counts[i + 1] += counts[i];
        }

        let colptr = counts.clone();
        let mut next = counts;
        let mut rowind = vec![0usize; nnz];
        let mut values = vec![T::zero(); nnz];
        for j in 0..n {
            for p in self.colptr[j]..self.colptr[j + 1] {
                let q = next[self.rowind[p]];
                next[self.rowind[p]] += 1;
                rowind[q] = j;
                values[q] = self.values[p];
            }
        }

        Self {
            n,
            colptr,
            rowind,
            values,
        }
    }

    /// Whether `A` equals `Aᵀ` both in pattern and values.
    pub fn is_symmetric(&self) -> bool {
        let t = self.transpose();
        t.colptr == self.colptr && t.rowind == self.rowind && t.values == self.values
    }
}

impl SparseMatrixCsc<E> {
    /// Translates an assembled system matrix into compressed-column form.
    pub fn from_assembled(mat: &dyn AssembledMatrix) -> Result<Self, SolverError> {
        let (nrows, ncols) = (mat.nrows(), mat.ncols());
        if nrows != ncols {
            return Err(SolverError::DimensionMismatch { nrows, ncols });
        }
        let n = ncols;

        let mut entries: Vec<(usize, usize, E)> = Vec::new();
        entries
            .try_reserve_exact(mat.nnz_hint())
            .map_err(|_| SolverError::MemoryReservation)?;

        let mut out_of_bounds = None;
        mat.for_each_entry(&mut |row, col, val| {
            if row >= n || col >= n {
                out_of_bounds.get_or_insert((row, col));
            } else {
                entries.push((row, col, val));
            }
        });
        if let Some((row, col)) = out_of_bounds {
            return Err(SolverError::InvalidStructure {
                reason: format!("entry ({row}, {col}) lies outside a {n}x{n} matrix"),
            });
        }

        // Stable sort keeps the accumulation order of duplicates deterministic.
        entries.sort_by_key(|&(row, col, _)| (col, row));

        let mut colptr = vec![0usize; n + 1];
        let mut rowind = Vec::new();
        let mut values = Vec::new();
        rowind
            .try_reserve_exact(entries.len())
            .map_err(|_| SolverError::MemoryReservation)?;
        values
            .try_reserve_exact(entries.len())
            .map_err(|_| SolverError::MemoryReservation)?;

        let mut last: Option<(usize, usize)> = None;
        for (row, col, val) in entries {
            if last == Some((row, col)) {
                if let Some(v) = values.last_mut() {
                    *v += val;
                }
                continue;
            }
            rowind.push(row);
            values.push(val);
            colptr[col + 1] += 1;
            last = Some((row, col));
        }
        for j in 0..n {
            colptr[j + 1] += colptr[j];
        }

        Ok(Self {
            n,
            colptr,
            rowind,
            values,
        })
    }

    /// Converts back into a faer matrix, e.g. to compute residuals with faer's sparse products.
    pub fn to_faer(&self) -> SparseColMat<I, E> {
        let symbolic = SymbolicSparseColMat::new_checked(
            self.n,
            self.n,
            self.colptr.clone(),
            None,
            self.rowind.clone(),
        );
        SparseColMat::new(symbolic, self.values.clone())
    }
}

/// Validates the compressed-column invariants of a pattern.
pub(crate) fn check_structure(
    n: usize,
    colptr: &[usize],
    rowind: &[usize],
) -> Result<(), SolverError> {
    let invalid = |reason: String| Err(SolverError::InvalidStructure { reason });

    if colptr.len() != n + 1 {
        return invalid(format!(
            "column pointer array has length {} instead of {}",
            colptr.len(),
            n + 1
        ));
    }
    if colptr[0] != 0 {
        return invalid(format!("first column pointer is {}", colptr[0]));
    }
    if colptr[n] != rowind.len() {
        return invalid(format!(
            "last column pointer is {} but {} row indices are stored",
            colptr[n],
            rowind.len()
        ));
    }
    for j in 0..n {
        if colptr[j] > colptr[j + 1] {
            return invalid(format!("column pointers decrease at column {j}"));
        }
        let rows = &rowind[colptr[j]..colptr[j + 1]];
        if let Some(&last) = rows.last() {
            if last >= n {
                return invalid(format!("row index {last} out of bounds in column {j}"));
            }
        }
        if rows.windows(2).any(|w| w[0] >= w[1]) {
            return invalid(format!("row indices of column {j} are not strictly increasing"));
        }
    }
    Ok(())
}

impl AssembledMatrix for SparseMatrixCsc<E> {
    fn nrows(&self) -> usize {
        self.n
    }

    fn ncols(&self) -> usize {
        self.n
    }

    fn nnz_hint(&self) -> usize {
        self.nnz()
    }

    fn for_each_entry(&self, f: &mut dyn FnMut(usize, usize, E)) {
        for j in 0..self.n {
            for p in self.colptr[j]..self.colptr[j + 1] {
                f(self.rowind[p], j, self.values[p]);
            }
        }
    }
}

impl AssembledMatrix for SparseColMatRef<'_, I, E> {
    fn nrows(&self) -> usize {
        self.symbolic().nrows()
    }

    fn ncols(&self) -> usize {
        self.symbolic().ncols()
    }

    fn nnz_hint(&self) -> usize {
        self.symbolic().compute_nnz()
    }

    fn for_each_entry(&self, f: &mut dyn FnMut(usize, usize, E)) {
        let symbolic = self.symbolic();
        for j in 0..symbolic.ncols() {
            for (i, &v) in symbolic.row_idx_of_col(j).zip(self.val_of_col(j)) {
                f(i, j, v);
            }
        }
    }
}

impl AssembledMatrix for SparseColMat<I, E> {
    fn nrows(&self) -> usize {
        self.as_ref().nrows()
    }

    fn ncols(&self) -> usize {
        AssembledMatrix::ncols(&self.as_ref())
    }

    fn nnz_hint(&self) -> usize {
        self.as_ref().nnz_hint()
    }

    fn for_each_entry(&self, f: &mut dyn FnMut(usize, usize, E)) {
        self.as_ref().for_each_entry(f)
    }
}

impl AssembledMatrix for SparseRowMatRef<'_, I, E> {
    fn nrows(&self) -> usize {
        self.symbolic().nrows()
    }

    fn ncols(&self) -> usize {
        self.symbolic().ncols()
    }

    fn nnz_hint(&self) -> usize {
        self.symbolic().compute_nnz()
    }

    fn for_each_entry(&self, f: &mut dyn FnMut(usize, usize, E)) {
        let symbolic = self.symbolic();
        for i in 0..symbolic.nrows() {
            for (j, &v) in symbolic.col_idx_of_row(i).zip(self.val_of_row(i)) {
                f(i, j, v);
            }
        }
    }
}

impl AssembledMatrix for SparseRowMat<I, E> {
    fn nrows(&self) -> usize {
        AssembledMatrix::nrows(&self.as_ref())
    }

    fn ncols(&self) -> usize {
        AssembledMatrix::ncols(&self.as_ref())
    }

    fn nnz_hint(&self) -> usize {
        self.as_ref().nnz_hint()
    }

    fn for_each_entry(&self, f: &mut dyn FnMut(usize, usize, E)) {
        self.as_ref().for_each_entry(f)
    }
}

impl AssembledMatrix for MatRef<'_, E> {
    fn nrows(&self) -> usize {
        MatRef::nrows(self)
    }

    fn ncols(&self) -> usize {
        MatRef::ncols(self)
    }

    fn nnz_hint(&self) -> usize {
        MatRef::nrows(self) * MatRef::ncols(self)
    }

    fn for_each_entry(&self, f: &mut dyn FnMut(usize, usize, E)) {
        for j in 0..MatRef::ncols(self) {
            for i in 0..MatRef::nrows(self) {
                let v = self[(i, j)];
                if v != 0.0 {
                    f(i, j, v);
                }
            }
        }
    }
}

impl AssembledMatrix for Mat<E> {
    fn nrows(&self) -> usize {
        Mat::nrows(self)
    }

    fn ncols(&self) -> usize {
        Mat::ncols(self)
    }

    fn nnz_hint(&self) -> usize {
        Mat::nrows(self) * Mat::ncols(self)
    }

    fn for_each_entry(&self, f: &mut dyn FnMut(usize, usize, E)) {
        self.as_ref().for_each_entry(f)
    }
}
