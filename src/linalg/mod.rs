pub mod async_ldlt;
pub mod cholesky;
pub mod csc;
pub mod export;
pub mod ldlt;
pub mod lu;
pub mod ordering;
pub mod pattern;
pub mod solver;
pub mod symbolic;
pub mod triangular;

use crate::linalg::solver::SolverError;

/// Allocates a vector of `len` copies of `value`, reporting allocation failure instead of aborting.
pub(crate) fn try_filled<T: Clone>(len: usize, value: T) -> Result<Vec<T>, SolverError> {
    let mut vec = Vec::new();
    vec.try_reserve_exact(len)
        .map_err(|_| SolverError::MemoryReservation)?;
    vec.resize(len, value);
    Ok(vec)
}

/// Resizes a scratch vector to `len` entries of `value`, reusing its allocation.
pub(crate) fn try_reset<T: Clone>(vec: &mut Vec<T>, len: usize, value: T) -> Result<(), SolverError> {
    vec.clear();
    vec.try_reserve_exact(len)
        .map_err(|_| SolverError::MemoryReservation)?;
    vec.resize(len, value);
    Ok(())
}
