
use faer::Mat;
use faer::sparse::{SparseColMat, Triplet};

use crate::linalg::ordering::OrderingMethod;
use crate::options::SolverOptions;
use crate::{E, I};

/// Options shared by the scenarios; the asynchronous solver always installs the fresh factor.
pub(crate) fn options(ordering: OrderingMethod) -> SolverOptions {
    SolverOptions::new()
        .with_ordering(ordering)
        .with_wait_for_async_task(true)
}

pub(crate) fn from_dense(rows: &[&[E]]) -> SparseColMat<I, E> {
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

/// Five-point stencil on a `k x k` grid. `east`/`west` and `north`/`south` weight the
/// neighbours; equal weights give a symmetric matrix.
pub(crate) fn grid(k: usize, diag: E, east: E, west: E, north: E, south: E) -> SparseColMat<I, E> {
    let n = k * k;
    let mut triplets = Vec::new();
    for j in 0..n {
        let (r, c) = (j / k, j % k);
        triplets.push(Triplet::new(j, j, diag));
        if c + 1 < k {
            triplets.push(Triplet::new(j, j + 1, east));
            triplets.push(Triplet::new(j + 1, j, west));
        }
        if r + 1 < k {
            triplets.push(Triplet::new(j, j + k, north));
            triplets.push(Triplet::new(j + k, j, south));
        }
    }
    SparseColMat::try_new_from_triplets(n, n, &triplets).unwrap()
}

/// Symmetric positive definite mass-plus-stiffness like matrix.
pub(crate) fn spd_grid(k: usize) -> SparseColMat<I, E> {
    grid(k, 4.5, -1.0, -1.0, -1.0, -1.0)
}

/// Diagonally dominant convection-diffusion matrix.
pub(crate) fn convection_grid(k: usize) -> SparseColMat<I, E> {
    grid(k, 4.5, -1.3, -0.7, -1.1, -0.9)
}

pub(crate) fn rhs(n: usize, ncols: usize) -> Mat<E> {
    Mat::from_fn(n, ncols, |i, j| ((i * 7 + j * 3) % 11) as E - 5.0)
}

pub(crate) fn residual(mat: &SparseColMat<I, E>, x: &Mat<E>, b: &Mat<E>) -> E {
    (b - mat * x).norm_l2() / b.norm_l2().max(1.0)
}
