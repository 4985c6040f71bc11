//! # stepsolve
//!
//! Sparse direct solvers for the linear systems `Ax = b` assembled at every implicit time step of
//! a deformable-body simulation.
//!
//! The crate splits the work into the classic phases of a direct solver:
//! - conversion of the assembled system matrix into compressed-column storage
//!   ([`linalg::csc`]),
//! - a fill-reducing ordering ([`linalg::ordering`]),
//! - symbolic factorization ([`linalg::symbolic`]),
//! - numeric factorization ([`linalg::cholesky`], [`linalg::ldlt`], [`linalg::lu`]),
//! - triangular solves ([`linalg::triangular`]).
//!
//! Between time steps the solvers compare the incoming sparsity pattern against the previous one
//! ([`linalg::pattern`]) and only redo the phases that are invalidated. [`linalg::async_ldlt`]
//! additionally overlaps the numeric factorization with the rest of the step.
//!
//! ## Example Usage
//! ```
//! use faer::Mat;
//! use faer::sparse::{SparseColMat, Triplet};
//! use stepsolve::linalg::solver::{DirectSolver, LinearSolver, SolverKind};
//! use stepsolve::options::SolverOptions;
//!
//! let triplets = [
//!     Triplet::new(0, 0, 4.0),
//!     Triplet::new(0, 1, 1.0),
//!     Triplet::new(1, 0, 1.0),
//!     Triplet::new(1, 1, 3.0),
//! ];
//! let mat = SparseColMat::<usize, f64>::try_new_from_triplets(2, 2, &triplets).unwrap();
//!
//! let mut solver = DirectSolver::new(SolverKind::Cholesky, SolverOptions::new());
//! solver.invert(&mat.as_ref()).unwrap();
//!
//! let b = Mat::from_fn(2, 1, |i, _| [1.0, 2.0][i]);
//! let x = solver.solve(b.as_ref()).unwrap();
//! assert!((x[(0, 0)] - 1.0 / 11.0).abs() < 1e-12);
//! assert!((x[(1, 0)] - 7.0 / 11.0).abs() < 1e-12);
//! ```

use std::fmt::Debug;

use faer::traits::num_traits::Float;

/// Scalar type accepted by the factorization kernels.
pub trait Real: Float + Debug + Send + Sync + 'static {}
impl<T> Real for T where T: Float + Debug + Send + Sync + 'static {}

pub type E = f64;
pub type I = usize;

pub mod linalg;
pub mod options;

#[cfg(test)]
mod tests;
