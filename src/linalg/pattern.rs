//! # Pattern Change Detection
//!
//! Between two time steps the assembled matrix usually keeps its sparsity pattern, and frequently
//! even its values (e.g. constant stiffness with a fixed time step). [`PatternCache`] remembers the
//! last successfully factorized matrix and classifies the next one:
//! - [`PatternChange::Structure`]: dimension or pattern differ, ordering and symbolic analysis
//!   must be redone,
//! - [`PatternChange::Values`]: same pattern, only the numeric factorization is redone,
//! - [`PatternChange::None`]: same pattern and values, the factor is reused as is.

use std::fmt;

use crate::linalg::csc::SparseMatrixCsc;
use crate::Real;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternChange {
    Structure,
    Values,
    None,
}

impl fmt::Display for PatternChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PatternChange::Structure => "structure changed",
            PatternChange::Values => "values changed",
            PatternChange::None => "unchanged",
        };
        f.write_str(text)
    }
}

/// Copy of the last matrix that was factorized successfully.
#[derive(Debug, Clone, Default)]
pub struct PatternCache<T = crate::E> {
    cached: Option<SparseMatrixCsc<T>>,
}

impl<T: Real> PatternCache<T> {
    pub fn new() -> Self {
        Self { cached: None }
    }

    /// Classifies `mat` against the cached matrix. An empty cache always reports a structure
    /// change.
    pub fn compare(&self, mat: &SparseMatrixCsc<T>) -> PatternChange {
        let Some(cached) = &self.cached else {
            return PatternChange::Structure;
        };

        // cheapest checks first
        if cached.n() != mat.n()
            || cached.nnz() != mat.nnz()
            || cached.colptr() != mat.colptr()
            || cached.rowind() != mat.rowind()
        {
            return PatternChange::Structure;
        }
        if cached.values() != mat.values() {
            return PatternChange::Values;
        }
        PatternChange::None
    }

    /// Remembers `mat`; called only after a successful factorization.
    pub fn update(&mut self, mat: &SparseMatrixCsc<T>) {
        match &mut self.cached {
            Some(cached) if cached.colptr() == mat.colptr() && cached.rowind() == mat.rowind() => {
                cached.values_mut().copy_from_slice(mat.values());
            }
            _ => self.cached = Some(mat.clone()),
        }
    }

    pub fn clear(&mut self) {
        self.cached = None;
    }

    pub fn is_empty(&self) -> bool {
        self.cached.is_none()
    }
}

/// Counters describing the work done by a solver, exposed for instrumentation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolverStatistics {
    pub symbolic_factorizations: usize,
    pub numeric_factorizations: usize,
    pub reused_factorizations: usize,
    pub solves: usize,
    pub last_change: Option<PatternChange>,
}

impl SolverStatistics {
    /// Records a completed `invert` that followed the decision `change`.
    pub(crate) fn record_invert(&mut self, change: PatternChange) {
        self.record_change(change);
        if change != PatternChange::None {
            self.numeric_factorizations += 1;
        }
    }

    /// Records the decision `change` without counting a numeric factorization.
    pub(crate) fn record_change(&mut self, change: PatternChange) {
        match change {
            PatternChange::Structure => self.symbolic_factorizations += 1,
            PatternChange::Values => {}
            PatternChange::None => self.reused_factorizations += 1,
        }
        self.last_change = Some(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diagonal(values: &[f64]) -> SparseMatrixCsc<f64> {
        let n = values.len();
        SparseMatrixCsc::try_new(n, (0..=n).collect(), (0..n).collect(), values.to_vec()).unwrap()
    }

    #[test]
    fn test_empty_cache_reports_structure() {
        let cache = PatternCache::new();
        assert_eq!(cache.compare(&diagonal(&[1.0])), PatternChange::Structure);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_classification() {
        let mut cache = PatternCache::new();
        let first = diagonal(&[1.0, 2.0]);
        cache.update(&first);

        assert_eq!(cache.compare(&first), PatternChange::None);
        assert_eq!(cache.compare(&diagonal(&[1.0, 3.0])), PatternChange::Values);
        assert_eq!(cache.compare(&diagonal(&[1.0, 2.0, 3.0])), PatternChange::Structure);

        // same n and nnz, different row index
        let moved = SparseMatrixCsc::try_new(2, vec![0, 1, 2], vec![0, 0], vec![1.0, 2.0]).unwrap();
        assert_eq!(cache.compare(&moved), PatternChange::Structure);

        // explicit zero keeps the pattern stable
        let with_zero = diagonal(&[0.0, 2.0]);
        assert_eq!(cache.compare(&with_zero), PatternChange::Values);
    }

    #[test]
    fn test_update_and_clear() {
        let mut cache = PatternCache::new();
        cache.update(&diagonal(&[1.0, 2.0]));
        cache.update(&diagonal(&[5.0, 6.0]));
        assert_eq!(cache.compare(&diagonal(&[5.0, 6.0])), PatternChange::None);

        cache.clear();
        assert_eq!(cache.compare(&diagonal(&[5.0, 6.0])), PatternChange::Structure);
    }

    #[test]
    fn test_statistics() {
        let mut stats = SolverStatistics::default();
        stats.record_invert(PatternChange::Structure);
        stats.record_invert(PatternChange::Values);
        stats.record_invert(PatternChange::None);

        assert_eq!(stats.symbolic_factorizations, 1);
        assert_eq!(stats.numeric_factorizations, 2);
        assert_eq!(stats.reused_factorizations, 1);
        assert_eq!(stats.last_change, Some(PatternChange::None));
    }
}
