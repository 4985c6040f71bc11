//! # Matrix Export
//!
//! Writes assembled system matrices in Matrix Market coordinate format, for inspecting a system
//! that fails to factorize with external tools. Entries are written column by column with
//! 1-based indices and full round-trip precision.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::debug;

use crate::linalg::csc::{AssembledMatrix, SparseMatrixCsc};
use crate::linalg::solver::SolverError;

const HEADER: &str = "%%MatrixMarket matrix coordinate real general";

fn export_error(path: &Path, err: std::io::Error) -> SolverError {
    SolverError::Export {
        message: format!("{}: {err}", path.display()),
    }
}

/// Writes `mat` to `path`, replacing any existing file.
pub fn write_matrix_market(path: impl AsRef<Path>, mat: &SparseMatrixCsc) -> Result<(), SolverError> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|err| export_error(path, err))?;
    let mut writer = BufWriter::new(file);
    write_entries(&mut writer, mat).map_err(|err| export_error(path, err))?;
    debug!("exported {}x{} matrix with {} entries to {}", mat.n(), mat.n(), mat.nnz(), path.display());
    Ok(())
}

fn write_entries<W: Write>(writer: &mut W, mat: &SparseMatrixCsc) -> std::io::Result<()> {
    writeln!(writer, "{HEADER}")?;
    writeln!(writer, "{} {} {}", mat.n(), mat.n(), mat.nnz())?;
    for j in 0..mat.n() {
        let (rows, values) = mat.col(j);
        for (&i, &v) in rows.iter().zip(values) {
            writeln!(writer, "{} {} {v:e}", i + 1, j + 1)?;
        }
    }
    writer.flush()
}

/// Converts an assembled matrix and writes it to `path`.
pub fn export_system(path: impl AsRef<Path>, mat: &dyn AssembledMatrix) -> Result<(), SolverError> {
    let csc = SparseMatrixCsc::from_assembled(mat)?;
    write_matrix_market(path, &csc)
}

#[cfg(test)]
mod tests {
    use faer::sparse::{SparseColMat, Triplet};
    use matrix_market_rs::MtxData;

    use super::*;
    use crate::{E, I};

    #[test]
    fn test_written_text() {
        let mat = SparseMatrixCsc::try_new(2, vec![0, 2, 3], vec![0, 1, 1], vec![4.0, -1.5, 0.25])
            .unwrap();
        let mut out = Vec::new();
        write_entries(&mut out, &mat).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "%%MatrixMarket matrix coordinate real general\n2 2 3\n1 1 4e0\n2 1 -1.5e0\n2 2 2.5e-1\n"
        );
    }

    #[test]
    fn test_export_round_trip() {
        let triplets = [
            Triplet::new(0, 0, 2.0),
            Triplet::new(2, 0, 1.0 / 3.0),
            Triplet::new(1, 1, -7.5),
            Triplet::new(0, 2, 1e-300),
            Triplet::new(2, 2, 3.0),
        ];
        let mat = SparseColMat::<I, E>::try_new_from_triplets(3, 3, &triplets).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.mtx");
        export_system(&path, &mat).unwrap();

        let MtxData::Sparse([nrows, ncols], coord, val, _) =
            MtxData::<f64, 2>::from_file(&path).unwrap()
        else {
            panic!("Matrix is not in sparse format");
        };
        assert_eq!((nrows, ncols), (3, 3));

        let read: Vec<_> = coord
            .iter()
            .zip(&val)
            .map(|(&[row, col], &v)| Triplet::new(row, col, v))
            .collect();
        let read = SparseColMat::<I, E>::try_new_from_triplets(3, 3, &read).unwrap();
        assert_eq!(
            SparseMatrixCsc::from_assembled(&read).unwrap(),
            SparseMatrixCsc::from_assembled(&mat).unwrap()
        );
    }

    #[test]
    fn test_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("system.mtx");
        let mat = SparseMatrixCsc::identity(2);
        assert!(matches!(
            write_matrix_market(&path, &mat),
            Err(SolverError::Export { .. })
        ));
    }
}
