//! # Direct Solver Interface
//!
//! [`LinearSolver`] is the interface the time integrator talks to: `invert` is called once per
//! step with the assembled matrix, followed by any number of solves. The closed set of available
//! solvers is the [`DirectSolver`] enum, selectable by name through [`SolverKind`].
//!
//! The synchronous solvers share the [`SparseDirectSolver`] driver, which implements the caching
//! policy: the incoming pattern is compared against the last factorized one, the symbolic phase is
//! only rerun when the structure changed, and an unchanged matrix reuses the existing factor. The
//! numeric kernels plug into the driver through [`NumericFactor`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use derive_more::{Display, Error};
use enum_dispatch::enum_dispatch;
use faer::{Mat, MatMut, MatRef};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::E;
use crate::linalg::async_ldlt::AsyncSparseLdlSolver;
use crate::linalg::cholesky::SparseCholeskySolver;
use crate::linalg::csc::{AssembledMatrix, SparseMatrixCsc};
use crate::linalg::ldlt::SparseLdlSolver;
use crate::linalg::lu::SparseLuSolver;
use crate::linalg::pattern::{PatternCache, PatternChange, SolverStatistics};
use crate::linalg::symbolic::{FactorStructure, SymbolicFactorization};
use crate::linalg::triangular::{permute, permute_inverse};
use crate::linalg::try_reset;
use crate::options::SolverOptions;

#[derive(Debug, Display, Error, PartialEq)]
pub enum SolverError {
    #[display("Matrix must be square, got {nrows}x{ncols}")]
    DimensionMismatch { nrows: usize, ncols: usize },

    #[display("Invalid sparse structure: {reason}")]
    InvalidStructure { reason: String },

    #[display("Structurally singular matrix at column {column}")]
    SingularStructure { column: usize },

    #[display("Matrix is not positive definite: pivot {pivot:e} at column {column}")]
    NotPositiveDefinite { column: usize, pivot: E },

    #[display("Matrix is numerically singular: pivot {pivot:e} at column {column}")]
    SingularMatrix { column: usize, pivot: E },

    #[display("No factorization available, call invert first")]
    NotFactorized,

    #[display("Right-hand side has {found} rows, expected {expected}")]
    RhsDimensionMismatch { expected: usize, found: usize },

    #[display("Ordering method `{method}` failed: {reason}")]
    OrderingFailed { method: &'static str, reason: String },

    #[display("Memory reservation failed")]
    MemoryReservation,

    #[display("Background factorization task failed")]
    AsyncTaskFailed,

    #[display("Unknown option `{name}`")]
    UnknownOption { name: String },

    #[display("Invalid value `{value}` for option `{name}`")]
    InvalidOptionValue { name: String, value: String },

    #[display("Unknown solver `{name}`")]
    UnknownSolver { name: String },

    #[display("Matrix export failed: {message}")]
    Export { message: String },
}

/// Interface of a direct solver for the systems `Ax = b` of an implicit time step.
///
/// `invert` must succeed once before solving. Right-hand sides are faer matrices whose columns
/// are independent systems.
#[enum_dispatch]
pub trait LinearSolver {
    /// Prepares the solver for the assembled matrix `mat`, reusing whatever the previous call
    /// computed when the pattern (or the whole matrix) did not change.
    fn invert(&mut self, mat: &dyn AssembledMatrix) -> Result<(), SolverError>;

    /// Overwrites every column of `rhs` with the solution of `A x = rhs`.
    fn solve_in_place(&mut self, rhs: MatMut<'_, E>) -> Result<(), SolverError>;

    /// Overwrites every column of `rhs` with the solution of `Aᵀ x = rhs`.
    fn solve_transpose_in_place(&mut self, rhs: MatMut<'_, E>) -> Result<(), SolverError>;

    fn solve(&mut self, b: MatRef<'_, E>) -> Result<Mat<E>, SolverError> {
        let mut x = b.to_owned();
        self.solve_in_place(x.as_mut())?;
        Ok(x)
    }

    /// Writes the solution of `A x = b` into `x`.
    fn solve_into(&mut self, mut x: MatMut<'_, E>, b: MatRef<'_, E>) -> Result<(), SolverError> {
        check_same_shape(x.as_ref(), b)?;
        x.copy_from(b);
        self.solve_in_place(x)
    }

    /// Writes the solution of `Aᵀ z = r` into `z`.
    fn solve_transpose(&mut self, mut z: MatMut<'_, E>, r: MatRef<'_, E>) -> Result<(), SolverError> {
        check_same_shape(z.as_ref(), r)?;
        z.copy_from(r);
        self.solve_transpose_in_place(z)
    }

    fn is_factorized(&self) -> bool;

    /// Order of the currently factorized matrix.
    fn dim(&self) -> Option<usize>;

    fn statistics(&self) -> &SolverStatistics;

    fn options(&self) -> &SolverOptions;
}

fn check_same_shape(x: MatRef<'_, E>, b: MatRef<'_, E>) -> Result<(), SolverError> {
    if x.nrows() != b.nrows() || x.ncols() != b.ncols() {
        return Err(SolverError::RhsDimensionMismatch {
            expected: b.nrows(),
            found: x.nrows(),
        });
    }
    Ok(())
}

/// Numeric factorization that can be driven by [`SparseDirectSolver`].
///
/// Factors live in the permuted numbering of their [`SymbolicFactorization`]; the driver takes
/// care of permuting right-hand sides in and solutions out.
pub trait NumericFactor: Sized + Send + 'static {
    const NAME: &'static str;

    const STRUCTURE: FactorStructure;

    /// Factorizes the permuted matrix whose values are laid out along `symbolic.pattern()`.
    fn factorize(
        symbolic: &SymbolicFactorization,
        values: &[E],
        options: &SolverOptions,
    ) -> Result<Self, SolverError>;

    /// Solves with the permuted matrix; `work` has the order of the matrix.
    fn solve_permuted(&self, x: &mut [E], work: &mut [E]);

    /// Solves with the transposed permuted matrix; `work` has the order of the matrix.
    fn solve_transpose_permuted(&self, x: &mut [E], work: &mut [E]);

    /// Stored nonzeros of the factors, diagonal included.
    fn nnz(&self) -> usize;
}

/// Runs the symbolic phase suited for `F`.
pub(crate) fn analyze<F: NumericFactor>(
    csc: &SparseMatrixCsc,
    options: &SolverOptions,
) -> Result<SymbolicFactorization, SolverError> {
    match F::STRUCTURE {
        FactorStructure::Symmetric => SymbolicFactorization::analyze_symmetric(csc, options.ordering),
        FactorStructure::Unsymmetric => {
            SymbolicFactorization::analyze_unsymmetric(csc, options.ordering)
        }
    }
}

/// Scratch vectors used by the solve phase, sized to the order of the factorized matrix.
#[derive(Debug, Clone, Default)]
pub(crate) struct SolveScratch {
    tmp: Vec<E>,
    z_tmp: Vec<E>,
    r_tmp: Vec<E>,
}

impl SolveScratch {
    pub(crate) fn resize(&mut self, n: usize) -> Result<(), SolverError> {
        if self.tmp.len() != n {
            try_reset(&mut self.tmp, n, 0.0)?;
            try_reset(&mut self.z_tmp, n, 0.0)?;
            try_reset(&mut self.r_tmp, n, 0.0)?;
        }
        Ok(())
    }

    /// Solves every column of `rhs` in place with `factor`.
    pub(crate) fn solve_columns<F: NumericFactor>(
        &mut self,
        symbolic: &SymbolicFactorization,
        factor: &F,
        mut rhs: MatMut<'_, E>,
        transpose: bool,
    ) -> Result<(), SolverError> {
        let n = symbolic.n();
        if rhs.nrows() != n {
            return Err(SolverError::RhsDimensionMismatch {
                expected: n,
                found: rhs.nrows(),
            });
        }
        self.resize(n)?;

        let perm = symbolic.perm().perm();
        for j in 0..rhs.ncols() {
            for i in 0..n {
                self.tmp[i] = rhs[(i, j)];
            }
            permute(perm, &self.tmp, &mut self.z_tmp);
            if transpose {
                factor.solve_transpose_permuted(&mut self.z_tmp, &mut self.r_tmp);
            } else {
                factor.solve_permuted(&mut self.z_tmp, &mut self.r_tmp);
            }
            permute_inverse(perm, &self.z_tmp, &mut self.tmp);
            for i in 0..n {
                rhs[(i, j)] = self.tmp[i];
            }
        }
        Ok(())
    }
}

/// Pattern-aware driver shared by the synchronous direct solvers.
pub struct SparseDirectSolver<F> {
    options: SolverOptions,
    statistics: SolverStatistics,
    cache: PatternCache,
    symbolic: Option<Arc<SymbolicFactorization>>,
    factor: Option<F>,
    /// Values of the current matrix laid out along the permuted pattern.
    permuted_values: Vec<E>,
    scratch: SolveScratch,
}

impl<F: NumericFactor> SparseDirectSolver<F> {
    pub fn new(options: SolverOptions) -> Self {
        Self {
            options,
            statistics: SolverStatistics::default(),
            cache: PatternCache::new(),
            symbolic: None,
            factor: None,
            permuted_values: Vec::new(),
            scratch: SolveScratch::default(),
        }
    }

    pub fn symbolic(&self) -> Option<&SymbolicFactorization> {
        self.symbolic.as_deref()
    }

    pub fn factor(&self) -> Option<&F> {
        self.factor.as_ref()
    }
}

impl<F: NumericFactor> Default for SparseDirectSolver<F> {
    fn default() -> Self {
        Self::new(SolverOptions::default())
    }
}

impl<F: NumericFactor> LinearSolver for SparseDirectSolver<F> {
    fn invert(&mut self, mat: &dyn AssembledMatrix) -> Result<(), SolverError> {
        let start = Instant::now();
        self.options.validate()?;
        let csc = SparseMatrixCsc::from_assembled(mat)?;

        let mut change = self.cache.compare(&csc);
        if change == PatternChange::None && self.factor.is_none() {
            change = PatternChange::Values;
        }
        if change == PatternChange::None {
            self.statistics.record_invert(change);
            debug!("{}: matrix unchanged, reusing factorization", F::NAME);
            return Ok(());
        }

        let symbolic = match (&self.symbolic, change) {
            (Some(symbolic), PatternChange::Values) => Arc::clone(symbolic),
            _ => Arc::new(analyze::<F>(&csc, &self.options)?),
        };
        let analyzed = start.elapsed();

        symbolic
            .pattern()
            .gather(csc.values(), &mut self.permuted_values)?;
        let factor = F::factorize(&symbolic, &self.permuted_values, &self.options)?;

        self.scratch.resize(symbolic.n())?;
        self.cache.update(&csc);
        self.statistics.record_invert(change);

        debug!(
            "{}: {change}, n = {}, nnz(A) = {}, nnz(factor) = {}",
            F::NAME,
            csc.n(),
            csc.nnz(),
            factor.nnz()
        );
        if self.options.verbose {
            info!(
                "{}: {change}, n = {}, nnz(A) = {}, nnz(factor) = {}, ordering = {}, symbolic {:?}, total {:?}",
                F::NAME,
                csc.n(),
                csc.nnz(),
                factor.nnz(),
                self.options.ordering,
                analyzed,
                start.elapsed()
            );
        }

        self.symbolic = Some(symbolic);
        self.factor = Some(factor);
        Ok(())
    }

    fn solve_in_place(&mut self, rhs: MatMut<'_, E>) -> Result<(), SolverError> {
        let (Some(symbolic), Some(factor)) = (&self.symbolic, &self.factor) else {
            return Err(SolverError::NotFactorized);
        };
        self.scratch.solve_columns(symbolic, factor, rhs, false)?;
        self.statistics.solves += 1;
        Ok(())
    }

    fn solve_transpose_in_place(&mut self, rhs: MatMut<'_, E>) -> Result<(), SolverError> {
        let (Some(symbolic), Some(factor)) = (&self.symbolic, &self.factor) else {
            return Err(SolverError::NotFactorized);
        };
        self.scratch.solve_columns(symbolic, factor, rhs, true)?;
        self.statistics.solves += 1;
        Ok(())
    }

    fn is_factorized(&self) -> bool {
        self.factor.is_some()
    }

    fn dim(&self) -> Option<usize> {
        self.factor
            .as_ref()
            .and(self.symbolic.as_ref())
            .map(|symbolic| symbolic.n())
    }

    fn statistics(&self) -> &SolverStatistics {
        &self.statistics
    }

    fn options(&self) -> &SolverOptions {
        &self.options
    }
}

/// Named solver variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    #[default]
    Cholesky,
    Ldlt,
    Lu,
    AsyncLdlt,
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SolverKind::Cholesky => "cholesky",
            SolverKind::Ldlt => "ldlt",
            SolverKind::Lu => "lu",
            SolverKind::AsyncLdlt => "async_ldlt",
        };
        f.write_str(name)
    }
}

impl FromStr for SolverKind {
    type Err = SolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cholesky" => Ok(SolverKind::Cholesky),
            "ldlt" | "ldl" => Ok(SolverKind::Ldlt),
            "lu" => Ok(SolverKind::Lu),
            "async_ldlt" | "async_ldl" => Ok(SolverKind::AsyncLdlt),
            _ => Err(SolverError::UnknownSolver {
                name: s.to_string(),
            }),
        }
    }
}

/// The closed set of direct solvers.
#[enum_dispatch(LinearSolver)]
pub enum DirectSolver {
    Cholesky(SparseCholeskySolver),
    Ldlt(SparseLdlSolver),
    Lu(SparseLuSolver),
    AsyncLdlt(AsyncSparseLdlSolver),
}

impl DirectSolver {
    pub fn new(kind: SolverKind, options: SolverOptions) -> Self {
        match kind {
            SolverKind::Cholesky => SparseCholeskySolver::new(options).into(),
            SolverKind::Ldlt => SparseLdlSolver::new(options).into(),
            SolverKind::Lu => SparseLuSolver::new(options).into(),
            SolverKind::AsyncLdlt => AsyncSparseLdlSolver::new(options).into(),
        }
    }

    /// Builds the solver selected by `options.solver`.
    pub fn from_options(options: SolverOptions) -> Self {
        Self::new(options.solver, options)
    }

    pub fn from_name(name: &str, options: SolverOptions) -> Result<Self, SolverError> {
        Ok(Self::new(name.parse()?, options))
    }

    pub fn kind(&self) -> SolverKind {
        match self {
            DirectSolver::Cholesky(_) => SolverKind::Cholesky,
            DirectSolver::Ldlt(_) => SolverKind::Ldlt,
            DirectSolver::Lu(_) => SolverKind::Lu,
            DirectSolver::AsyncLdlt(_) => SolverKind::AsyncLdlt,
        }
    }
}
