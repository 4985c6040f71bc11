//! # Asynchronous LDLᵀ Solver
//!
//! Overlaps the numeric factorization of the matrix of step `n` with the solves of step `n - 1`.
//! `invert` only does the cheap foreground work (conversion, change detection, the symbolic phase
//! when the structure changed) and hands a snapshot of the permuted values to a background
//! thread. Until that thread finished, solves use the previous (stale) factor.
//!
//! Solving with a stale factor is an approximation. Set `wait_for_async_task` to block in
//! `invert` until the new factor is installed. `invert` also blocks when there is no factor of the
//! new order to fall back on: on the very first call and whenever the order of the matrix changes.
//!
//! At most one background task runs per solver. A matrix arriving while a task is in flight
//! becomes the pending matrix, replacing any older pending one, and is launched once the running
//! task is joined.
//!
//! A failed background factorization leaves the active factor in place. The failure of the most
//! recently submitted matrix is returned by the next `solve` or
//! [`AsyncSparseLdlSolver::wait_for_factorization`]; the failure of a matrix that a later
//! `invert` superseded is only logged.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use faer::MatMut;
use log::{debug, info, warn};

use crate::E;
use crate::linalg::csc::{AssembledMatrix, SparseMatrixCsc};
use crate::linalg::ldlt::LdlFactor;
use crate::linalg::pattern::{PatternCache, PatternChange, SolverStatistics};
use crate::linalg::solver::{
    LinearSolver, NumericFactor, SolveScratch, SolverError, analyze,
};
use crate::linalg::symbolic::SymbolicFactorization;
use crate::options::SolverOptions;

/// Lifecycle of the background factorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncState {
    /// No background task.
    Idle,
    FactorizationInFlight,
    /// The task finished; its factor is installed by the next solve or invert.
    FactorizationReady,
}

impl fmt::Display for AsyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AsyncState::Idle => "idle",
            AsyncState::FactorizationInFlight => "factorization in flight",
            AsyncState::FactorizationReady => "factorization ready",
        };
        f.write_str(name)
    }
}

type FactorResult = Result<LdlFactor, SolverError>;

struct AsyncTask {
    symbolic: Arc<SymbolicFactorization>,
    handle: JoinHandle<FactorResult>,
}

struct PendingMatrix {
    symbolic: Arc<SymbolicFactorization>,
    values: Vec<E>,
}

/// LDLᵀ solver whose numeric factorization runs on a background thread.
pub struct AsyncSparseLdlSolver {
    options: SolverOptions,
    statistics: SolverStatistics,
    /// Pattern and values of the last submitted matrix.
    cache: PatternCache,
    /// Symbolic factorization of the last submitted matrix.
    symbolic: Option<Arc<SymbolicFactorization>>,
    /// Factor used by the solves, with the symbolic factorization it was computed on.
    active: Option<(Arc<SymbolicFactorization>, LdlFactor)>,
    task: Option<AsyncTask>,
    pending: Option<PendingMatrix>,
    /// Failure of the most recently submitted matrix, not yet reported.
    failure: Option<SolverError>,
    scratch: SolveScratch,
}

impl AsyncSparseLdlSolver {
    pub fn new(options: SolverOptions) -> Self {
        Self {
            options,
            statistics: SolverStatistics::default(),
            cache: PatternCache::new(),
            symbolic: None,
            active: None,
            task: None,
            pending: None,
            failure: None,
            scratch: SolveScratch::default(),
        }
    }

    pub fn state(&self) -> AsyncState {
        match &self.task {
            None => AsyncState::Idle,
            Some(task) if task.handle.is_finished() => AsyncState::FactorizationReady,
            Some(_) => AsyncState::FactorizationInFlight,
        }
    }

    /// Blocks until every submitted matrix is factorized and installs the newest factor.
    ///
    /// Returns the error of the most recently submitted matrix if its factorization failed.
    pub fn wait_for_factorization(&mut self) -> Result<(), SolverError> {
        while self.task.is_some() {
            self.copy_async_invert_data()?;
        }
        self.take_failure()
    }

    fn take_failure(&mut self) -> Result<(), SolverError> {
        match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Starts the numeric factorization of `values` on a background thread.
    fn launch_async_task(
        &mut self,
        symbolic: Arc<SymbolicFactorization>,
        values: Vec<E>,
    ) -> Result<(), SolverError> {
        let shared = Arc::clone(&symbolic);
        let options = self.options.clone();
        let handle = thread::Builder::new()
            .name("async-ldlt".to_string())
            .spawn(move || <LdlFactor as NumericFactor>::factorize(&shared, &values, &options))
            .map_err(|_| SolverError::AsyncTaskFailed)?;

        debug!("async_ldlt: factorization launched, n = {}", symbolic.n());
        self.task = Some(AsyncTask { symbolic, handle });
        Ok(())
    }

    /// Joins the running task and installs its factor, then launches the pending matrix.
    ///
    /// A failed task leaves the active factor untouched. Its error is kept for reporting when the
    /// task held the latest submitted matrix and dropped otherwise. Only failures to set up the
    /// next task are returned.
    fn copy_async_invert_data(&mut self) -> Result<(), SolverError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let result = match task.handle.join() {
            Ok(result) => result,
            Err(_) => Err(SolverError::AsyncTaskFailed),
        };

        match result {
            Ok(factor) => {
                debug!("async_ldlt: factor installed, nnz(factor) = {}", factor.nnz());
                self.scratch.resize(task.symbolic.n())?;
                self.active = Some((task.symbolic, factor));
                self.statistics.numeric_factorizations += 1;
            }
            Err(err) if self.pending.is_some() => {
                warn!("async_ldlt: factorization of a superseded matrix failed: {err}");
            }
            Err(err) => {
                warn!("async_ldlt: background factorization failed: {err}");
                // the cached matrix has no factor, the next invert must not reuse it
                self.cache.clear();
                self.failure = Some(err);
            }
        }

        if let Some(pending) = self.pending.take() {
            self.launch_async_task(pending.symbolic, pending.values)?;
        }
        Ok(())
    }

    /// Installs the factor of a finished task without blocking.
    fn poll(&mut self) -> Result<(), SolverError> {
        match &self.task {
            Some(task) if task.handle.is_finished() => self.copy_async_invert_data(),
            _ => Ok(()),
        }
    }

    fn solve_columns(&mut self, rhs: MatMut<'_, E>, transpose: bool) -> Result<(), SolverError> {
        self.poll()?;
        self.take_failure()?;
        let Some((symbolic, factor)) = &self.active else {
            return Err(SolverError::NotFactorized);
        };
        self.scratch.solve_columns(symbolic, factor, rhs, transpose)?;
        self.statistics.solves += 1;
        Ok(())
    }
}

impl Default for AsyncSparseLdlSolver {
    fn default() -> Self {
        Self::new(SolverOptions::default())
    }
}

impl Drop for AsyncSparseLdlSolver {
    fn drop(&mut self) {
        self.pending = None;
        if let Some(task) = self.task.take() {
            // the snapshot is owned by the task; joining only waits for it to finish
            let _ = task.handle.join();
        }
    }
}

impl LinearSolver for AsyncSparseLdlSolver {
    fn invert(&mut self, mat: &dyn AssembledMatrix) -> Result<(), SolverError> {
        let start = Instant::now();
        self.options.validate()?;
        let csc = SparseMatrixCsc::from_assembled(mat)?;
        self.poll()?;

        let mut change = self.cache.compare(&csc);
        if change == PatternChange::None && self.active.is_none() && self.task.is_none() {
            change = PatternChange::Values;
        }
        if change == PatternChange::None {
            self.statistics.record_change(change);
            debug!("async_ldlt: matrix unchanged, reusing factorization");
            return Ok(());
        }

        let symbolic = match (&self.symbolic, change) {
            (Some(symbolic), PatternChange::Values) => Arc::clone(symbolic),
            _ => Arc::new(analyze::<LdlFactor>(&csc, &self.options)?),
        };
        let mut values = Vec::new();
        symbolic.pattern().gather(csc.values(), &mut values)?;

        if change == PatternChange::Structure && self.task.is_some() {
            // the running task works on the old structure
            self.pending = None;
            self.copy_async_invert_data()?;
        }
        if let Some(err) = self.failure.take() {
            debug!("async_ldlt: dropping failure of a superseded matrix: {err}");
        }

        let n = symbolic.n();
        self.cache.update(&csc);
        self.symbolic = Some(Arc::clone(&symbolic));
        self.statistics.record_change(change);

        if self.task.is_some() {
            if self.pending.is_some() {
                debug!("async_ldlt: pending matrix replaced");
            }
            self.pending = Some(PendingMatrix { symbolic, values });
        } else {
            self.launch_async_task(symbolic, values)?;
        }

        // a stale factor of another order cannot stand in for the new one
        let stale_order = self
            .active
            .as_ref()
            .is_none_or(|(active, _)| active.n() != n);
        if stale_order || self.options.wait_for_async_task {
            self.wait_for_factorization()?;
        }

        if self.options.verbose {
            info!(
                "async_ldlt: {change}, n = {}, nnz(A) = {}, state = {}, foreground {:?}",
                csc.n(),
                csc.nnz(),
                self.state(),
                start.elapsed()
            );
        }
        Ok(())
    }

    fn solve_in_place(&mut self, rhs: MatMut<'_, E>) -> Result<(), SolverError> {
        self.solve_columns(rhs, false)
    }

    fn solve_transpose_in_place(&mut self, rhs: MatMut<'_, E>) -> Result<(), SolverError> {
        self.solve_columns(rhs, true)
    }

    fn is_factorized(&self) -> bool {
        self.active.is_some()
    }

    fn dim(&self) -> Option<usize> {
        self.active.as_ref().map(|(symbolic, _)| symbolic.n())
    }

    fn statistics(&self) -> &SolverStatistics {
        &self.statistics
    }

    fn options(&self) -> &SolverOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use faer::Mat;
    use faer::sparse::{SparseColMat, Triplet};
    use rstest::rstest;

    use super::*;
    use crate::I;
    use crate::linalg::ordering::OrderingMethod;

    fn tridiagonal(n: usize, diag: E) -> SparseColMat<I, E> {
        let mut triplets = Vec::new();
        for j in 0..n {
            triplets.push(Triplet::new(j, j, diag));
            if j + 1 < n {
                triplets.push(Triplet::new(j, j + 1, -1.0));
                triplets.push(Triplet::new(j + 1, j, -1.0));
            }
        }
        SparseColMat::try_new_from_triplets(n, n, &triplets).unwrap()
    }

    fn residual(mat: &SparseColMat<I, E>, x: &Mat<E>, b: &Mat<E>) -> E {
        (b - mat * x).norm_l2()
    }

    #[test]
    fn test_first_invert_waits() {
        let mat = tridiagonal(50, 4.0);
        let mut solver = AsyncSparseLdlSolver::new(SolverOptions::new());
        solver.invert(&mat).unwrap();

        assert_eq!(solver.state(), AsyncState::Idle);
        assert!(solver.is_factorized());
        let b = Mat::from_fn(50, 1, |i, _| i as E);
        let x = solver.solve(b.as_ref()).unwrap();
        assert!(residual(&mat, &x, &b) < 1e-10);
    }

    #[test]
    fn test_stale_then_fresh() {
        let n = 200;
        let old = tridiagonal(n, 4.0);
        let new = tridiagonal(n, 6.0);
        let b = Mat::from_fn(n, 1, |i, _| (i % 7) as E);

        let mut solver = AsyncSparseLdlSolver::new(SolverOptions::new());
        solver.invert(&old).unwrap();
        solver.invert(&new).unwrap();
        assert_eq!(solver.statistics().last_change, Some(PatternChange::Values));

        // either the stale or the fresh factor, depending on the background thread
        let x = solver.solve(b.as_ref()).unwrap();
        assert!(residual(&old, &x, &b) < 1e-10 || residual(&new, &x, &b) < 1e-10);

        solver.wait_for_factorization().unwrap();
        assert_eq!(solver.state(), AsyncState::Idle);
        let x = solver.solve(b.as_ref()).unwrap();
        assert!(residual(&new, &x, &b) < 1e-10);
    }

    #[rstest]
    fn test_latest_matrix_wins(#[values(false, true)] wait: bool) {
        let n = 100;
        let mut solver =
            AsyncSparseLdlSolver::new(SolverOptions::new().with_wait_for_async_task(wait));
        for diag in [3.0, 4.0, 5.0, 6.0] {
            solver.invert(&tridiagonal(n, diag)).unwrap();
        }
        solver.wait_for_factorization().unwrap();

        let b = Mat::from_fn(n, 1, |i, _| (i + 1) as E);
        let x = solver.solve(b.as_ref()).unwrap();
        assert!(residual(&tridiagonal(n, 6.0), &x, &b) < 1e-10);

        // only installed factors are counted; a replaced pending matrix is never factorized
        let statistics = solver.statistics();
        if wait {
            assert_eq!(statistics.numeric_factorizations, 4);
        } else {
            assert!((3..=4).contains(&statistics.numeric_factorizations));
        }
        assert_eq!(statistics.symbolic_factorizations, 1);
    }

    #[test]
    fn test_order_change_blocks_without_wait_option() {
        let mut solver = AsyncSparseLdlSolver::new(SolverOptions::new());
        solver.invert(&tridiagonal(10, 4.0)).unwrap();

        let n = 2000;
        let large = tridiagonal(n, 4.0);
        solver.invert(&large).unwrap();
        assert_eq!(solver.state(), AsyncState::Idle);
        assert_eq!(solver.dim(), Some(n));

        let b = Mat::from_fn(n, 1, |i, _| (i % 5) as E);
        let x = solver.solve(b.as_ref()).unwrap();
        assert!(residual(&large, &x, &b) < 1e-10);
    }

    #[test]
    fn test_structure_change() {
        let mut solver =
            AsyncSparseLdlSolver::new(SolverOptions::new().with_wait_for_async_task(true));
        solver.invert(&tridiagonal(10, 4.0)).unwrap();
        solver.invert(&tridiagonal(12, 4.0)).unwrap();

        assert_eq!(solver.dim(), Some(12));
        assert_eq!(solver.statistics().symbolic_factorizations, 2);
        let b = Mat::from_fn(12, 1, |_, _| 1.0);
        let x = solver.solve(b.as_ref()).unwrap();
        assert!(residual(&tridiagonal(12, 4.0), &x, &b) < 1e-12);
    }

    #[test]
    fn test_background_failure_keeps_active_factor() {
        let n = 20;
        let good = tridiagonal(n, 4.0);
        // singular: every row sums to zero
        let mut triplets = Vec::new();
        for j in 0..n {
            let diag = if j == 0 || j + 1 == n { 1.0 } else { 2.0 };
            triplets.push(Triplet::new(j, j, diag));
            if j + 1 < n {
                triplets.push(Triplet::new(j, j + 1, -1.0));
                triplets.push(Triplet::new(j + 1, j, -1.0));
            }
        }
        let singular = SparseColMat::<I, E>::try_new_from_triplets(n, n, &triplets).unwrap();

        let mut solver = AsyncSparseLdlSolver::new(
            SolverOptions::new().with_ordering(OrderingMethod::Identity),
        );
        solver.invert(&good).unwrap();
        solver.invert(&singular).unwrap();
        assert!(matches!(
            solver.wait_for_factorization(),
            Err(SolverError::NotPositiveDefinite { .. })
        ));

        assert!(solver.is_factorized());
        let b = Mat::from_fn(n, 1, |i, _| i as E);
        let x = solver.solve(b.as_ref()).unwrap();
        assert!(residual(&good, &x, &b) < 1e-10);

        // the failed matrix is not treated as factorized
        solver.invert(&singular).unwrap();
        assert!(solver.wait_for_factorization().is_err());
    }

    #[test]
    fn test_superseded_failure_does_not_block_next_matrix() {
        let n = 20;
        let mut triplets = Vec::new();
        for j in 0..n {
            let diag = if j == 0 || j + 1 == n { 1.0 } else { 2.0 };
            triplets.push(Triplet::new(j, j, diag));
            if j + 1 < n {
                triplets.push(Triplet::new(j, j + 1, -1.0));
                triplets.push(Triplet::new(j + 1, j, -1.0));
            }
        }
        let singular = SparseColMat::<I, E>::try_new_from_triplets(n, n, &triplets).unwrap();
        let next = tridiagonal(n, 5.0);

        let mut solver = AsyncSparseLdlSolver::new(
            SolverOptions::new().with_ordering(OrderingMethod::Identity),
        );
        solver.invert(&tridiagonal(n, 4.0)).unwrap();
        solver.invert(&singular).unwrap();
        // the singular matrix may or may not have been joined already
        solver.invert(&next).unwrap();
        solver.wait_for_factorization().unwrap();

        let b = Mat::from_fn(n, 1, |i, _| i as E);
        let x = solver.solve(b.as_ref()).unwrap();
        assert!(residual(&next, &x, &b) < 1e-10);
    }

    #[test]
    fn test_failure_reported_by_next_solve() {
        let n = 20;
        let mut triplets = Vec::new();
        for j in 0..n {
            let diag = if j == 0 || j + 1 == n { 1.0 } else { 2.0 };
            triplets.push(Triplet::new(j, j, diag));
            if j + 1 < n {
                triplets.push(Triplet::new(j, j + 1, -1.0));
                triplets.push(Triplet::new(j + 1, j, -1.0));
            }
        }
        let singular = SparseColMat::<I, E>::try_new_from_triplets(n, n, &triplets).unwrap();
        let good = tridiagonal(n, 4.0);

        let mut solver = AsyncSparseLdlSolver::new(
            SolverOptions::new().with_ordering(OrderingMethod::Identity),
        );
        solver.invert(&good).unwrap();
        solver.invert(&singular).unwrap();
        while solver.state() == AsyncState::FactorizationInFlight {
            thread::yield_now();
        }

        let b = Mat::from_fn(n, 1, |i, _| i as E);
        assert!(matches!(
            solver.solve(b.as_ref()),
            Err(SolverError::NotPositiveDefinite { .. })
        ));
        // reported once, the previous factor keeps serving
        let x = solver.solve(b.as_ref()).unwrap();
        assert!(residual(&good, &x, &b) < 1e-10);
        assert_eq!(solver.statistics().numeric_factorizations, 1);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let mut solver =
            AsyncSparseLdlSolver::new(SolverOptions::new().with_pivot_threshold(E::NAN));
        assert!(matches!(
            solver.invert(&tridiagonal(4, 4.0)),
            Err(SolverError::InvalidOptionValue { .. })
        ));
        assert_eq!(solver.state(), AsyncState::Idle);
    }

    #[test]
    fn test_first_invert_failure() {
        let triplets = [
            Triplet::new(0, 0, 1.0),
            Triplet::new(0, 1, 2.0),
            Triplet::new(1, 0, 2.0),
            Triplet::new(1, 1, 4.0),
        ];
        let mat = SparseColMat::<I, E>::try_new_from_triplets(2, 2, &triplets).unwrap();
        let mut solver = AsyncSparseLdlSolver::new(SolverOptions::new());
        assert!(matches!(
            solver.invert(&mat),
            Err(SolverError::NotPositiveDefinite { .. })
        ));
        assert!(!solver.is_factorized());
        assert_eq!(solver.state(), AsyncState::Idle);

        let b = Mat::<E>::zeros(2, 1);
        assert_eq!(solver.solve(b.as_ref()), Err(SolverError::NotFactorized));
    }
}
