//! Incremental and block QR factorization with column filtering.
//!
//! Supports two update modes: an incremental, Givens-rotation-based
//! insert/delete of a single column in `O(nm)`, and a from-scratch block
//! modified Gram-Schmidt (MGS) factorization. Column filtering policies
//! drop near-linearly-dependent columns during either mode; dropped
//! columns are removed from `V`/`W` by the caller (`crate::quasi_newton`)
//! to keep the three in lock-step.

use crate::{Matrix, Vector};

/// Column filtering policy applied during an acceleration step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterKind {
    /// Keep every column.
    NoFilter,
    /// Drop column `i` if `|R(i,i)| < eps * ||R||_F`.
    Qr1 {
        /// The singularity limit `eps`.
        singularity_limit: f64,
    },
    /// Drop column `i` if `|R(i,i)| < eps`.
    Qr1Abs {
        /// The singularity limit `eps`.
        singularity_limit: f64,
    },
    /// During MGS, drop a candidate vector if `||v_orth|| < eps * ||v||`.
    Qr2 {
        /// The singularity limit `eps`.
        singularity_limit: f64,
    },
    /// Truncate by singular-value threshold from an SVD update.
    PodFilter {
        /// Relative truncation threshold.
        truncation_threshold: f64,
    },
}

/// Errors from QR operations.
#[derive(Debug, thiserror::Error)]
pub enum QrError {
    /// The filter removed every column, leaving an empty (rank-0) system.
    #[error("QR filter removed all columns; system is rank-deficient")]
    SingularSystem,
    /// `Q`/`R` dimensions are inconsistent with the requested operation.
    #[error("QR shape mismatch: {0}")]
    ShapeMismatch(&'static str),
}

/// An incrementally-maintained (thin) QR factorization `A = Q R`, `Q` with
/// orthonormal columns (`n x m`), `R` upper triangular (`m x m`).
#[derive(Debug, Clone)]
pub struct QrDecomposition {
    q: Matrix,
    r: Matrix,
    n: usize,
}

impl QrDecomposition {
    /// An empty factorization over an `n`-dimensional ambient space.
    pub fn empty(n: usize) -> Self {
        Self { q: Matrix::zeros(n, 0), r: Matrix::zeros(0, 0), n }
    }

    /// Current number of columns (`m`).
    pub fn rank(&self) -> usize {
        self.r.ncols()
    }

    /// The orthonormal factor `Q` (`n x m`).
    pub fn q(&self) -> &Matrix {
        &self.q
    }

    /// The upper-triangular factor `R` (`m x m`).
    pub fn r(&self) -> &Matrix {
        &self.r
    }

    /// Append `v` as the new last column of `A`, updating `Q`/`R`
    /// incrementally via modified Gram-Schmidt against the existing `Q`
    /// (the standard `O(nm)` thin-QR column-insertion update; the
    /// column-*deletion* counterpart below instead uses Givens rotations to
    /// re-triangularize after a column is removed).
    ///
    /// With `filter = Qr2 { .. }`, the column is rejected (returns
    /// `Ok(false)`) instead of inserted if its orthogonal residual is too
    /// small relative to its own norm.
    pub fn insert_column(&mut self, v: &Vector, filter: FilterKind) -> Result<bool, QrError> {
        if v.len() != self.n {
            return Err(QrError::ShapeMismatch("column length does not match ambient dimension"));
        }
        let v_norm = v.norm();
        let m = self.rank();

        let mut r_col = Vector::zeros(m);
        let mut v_orth = v.clone();
        for j in 0..m {
            let qj = self.q.column(j);
            let proj = qj.dot(&v_orth);
            r_col[j] = proj;
            v_orth -= qj * proj;
        }
        let r_mm = v_orth.norm();

        if let FilterKind::Qr2 { singularity_limit } = filter {
            if v_norm > 0.0 && r_mm < singularity_limit * v_norm {
                return Ok(false);
            }
        }
        let q_new = if r_mm > 0.0 { &v_orth / r_mm } else { v_orth };

        let mut new_q = Matrix::zeros(self.n, m + 1);
        new_q.columns_mut(0, m).copy_from(&self.q);
        new_q.column_mut(m).copy_from(&q_new);

        let mut new_r = Matrix::zeros(m + 1, m + 1);
        new_r.view_mut((0, 0), (m, m)).copy_from(&self.r);
        new_r.view_mut((0, m), (m, 1)).copy_from(&r_col);
        new_r[(m, m)] = r_mm;

        self.q = new_q;
        self.r = new_r;
        Ok(true)
    }

    /// Remove column `idx` from `A`, re-triangularizing `R` with a sequence
    /// of Givens rotations that chase the sub-diagonal bulge introduced by
    /// the deletion back out of the matrix.
    pub fn delete_column(&mut self, idx: usize) -> Result<(), QrError> {
        let m = self.rank();
        if idx >= m {
            return Err(QrError::ShapeMismatch("column index out of range"));
        }

        let mut r = self.r.clone().remove_column(idx);
        // r is now n_rows = m, n_cols = m - 1, upper-triangular except for
        // a sub-diagonal run from row `idx` onward (a "bulge").
        for k in idx..m.saturating_sub(1) {
            let (c, s) = givens(r[(k, k)], r[(k + 1, k)]);
            apply_givens_rows(&mut r, k, k + 1, c, s);
            apply_givens_cols(&mut self.q, k, k + 1, c, s);
        }
        self.r = r.remove_row(m - 1);
        self.q = self.q.clone();
        Ok(())
    }

    /// Discard every column `i` with `|R(i,i)| < threshold` under `filter`
    /// (`NoFilter`/`Qr2` are no-ops here; `Qr2` only ever rejects at
    /// insertion time). Returns `Err(SingularSystem)` if every column would
    /// be removed. Column indices removed are returned in ascending order
    /// so the caller can drop the matching columns from `V`/`W`.
    pub fn filter_columns(&mut self, filter: FilterKind) -> Result<Vec<usize>, QrError> {
        let m = self.rank();
        if m == 0 {
            return Ok(Vec::new());
        }
        let threshold = match filter {
            FilterKind::NoFilter | FilterKind::Qr2 { .. } => return Ok(Vec::new()),
            FilterKind::Qr1 { singularity_limit } => singularity_limit * self.r.norm(),
            FilterKind::Qr1Abs { singularity_limit } => singularity_limit,
            FilterKind::PodFilter { .. } => return Ok(Vec::new()),
        };

        let mut dropped = Vec::new();
        let mut i = 0;
        while i < self.rank() {
            if self.r[(i, i)].abs() < threshold {
                self.delete_column(i)?;
                dropped.push(i);
            } else {
                i += 1;
            }
        }
        if self.rank() == 0 && m > 0 {
            return Err(QrError::SingularSystem);
        }
        Ok(dropped)
    }

    /// Solve the least-squares problem `A alpha ~= b` (`A = Q R`) via
    /// `R alpha = Q^T b`, back-substitution. Fails with `SingularSystem` if
    /// `R` has a (near-)zero diagonal entry.
    pub fn solve_least_squares(&self, b: &Vector) -> Result<Vector, QrError> {
        let m = self.rank();
        if m == 0 {
            return Err(QrError::SingularSystem);
        }
        let rhs = self.q.transpose() * b;
        let mut alpha = Vector::zeros(m);
        for i in (0..m).rev() {
            if self.r[(i, i)].abs() < 1e-14 {
                return Err(QrError::SingularSystem);
            }
            let mut s = rhs[i];
            for j in (i + 1)..m {
                s -= self.r[(i, j)] * alpha[j];
            }
            alpha[i] = s / self.r[(i, i)];
        }
        Ok(alpha)
    }

    /// Recompute a fresh factorization of `columns` via block modified
    /// Gram-Schmidt, applying `filter` to drop near-dependent candidates as
    /// they're processed.
    pub fn block_mgs(columns: &[Vector], n: usize, filter: FilterKind) -> Self {
        let mut qr = Self::empty(n);
        for v in columns {
            let _ = qr.insert_column(v, filter);
        }
        qr
    }
}

/// `(c, s)` such that `[c s; -s c] [a; b] = [r; 0]`.
fn givens(a: f64, b: f64) -> (f64, f64) {
    if b == 0.0 {
        (1.0, 0.0)
    } else {
        let r = a.hypot(b);
        (a / r, b / r)
    }
}

fn apply_givens_rows(m: &mut Matrix, i: usize, j: usize, c: f64, s: f64) {
    for col in 0..m.ncols() {
        let a = m[(i, col)];
        let b = m[(j, col)];
        m[(i, col)] = c * a + s * b;
        m[(j, col)] = -s * a + c * b;
    }
}

fn apply_givens_cols(m: &mut Matrix, i: usize, j: usize, c: f64, s: f64) {
    for row in 0..m.nrows() {
        let a = m[(row, i)];
        let b = m[(row, j)];
        m[(row, i)] = c * a + s * b;
        m[(row, j)] = -s * a + c * b;
    }
}

/// A truncated SVD `J ~= U Sigma V^T`, rank bounded by a relative
/// truncation threshold, with a two-sided rank-1 update-and-retruncate
/// step, used by the IMVJ RS-SVD restart mode in `crate::quasi_newton`.
///
/// Re-derives the SVD from scratch after each update via `nalgebra`'s dense
/// SVD rather than an incremental bidiagonalization update: for the column
/// counts an acceleration history realistically reaches (tens of columns),
/// this is cheap, and it sidesteps re-implementing Brand's incremental SVD
/// algorithm for a kernel this crate does not need elsewhere. Noted as a
/// simplification in `DESIGN.md`.
#[derive(Debug, Clone)]
pub struct TruncatedSvd {
    u: Matrix,
    singular_values: Vector,
    vt: Matrix,
    truncation_threshold: f64,
}

impl TruncatedSvd {
    /// Build (and truncate) the SVD of `j`.
    pub fn from_matrix(j: &Matrix, truncation_threshold: f64) -> Self {
        let svd = j.clone().svd(true, true);
        let mut s = Self {
            u: svd.u.expect("requested u"),
            singular_values: svd.singular_values,
            vt: svd.v_t.expect("requested v_t"),
            truncation_threshold,
        };
        s.retruncate();
        s
    }

    /// Current rank after truncation.
    pub fn rank(&self) -> usize {
        self.singular_values.len()
    }

    /// Reconstruct the dense matrix `U Sigma V^T`.
    pub fn to_dense(&self) -> Matrix {
        let sigma = Matrix::from_diagonal(&self.singular_values);
        &self.u * sigma * &self.vt
    }

    /// Apply a two-sided rank-1 correction `J_new = J + a b^T`, re-deriving
    /// and re-truncating the SVD.
    pub fn rank_one_update(&mut self, a: &Vector, b: &Vector) {
        let updated = self.to_dense() + a * b.transpose();
        *self = Self::from_matrix(&updated, self.truncation_threshold);
    }

    /// Drop singular values below `truncation_threshold * sigma_max`.
    fn retruncate(&mut self) {
        let sigma_max = self.singular_values.iter().cloned().fold(0.0, f64::max);
        if sigma_max == 0.0 {
            return;
        }
        let keep = self
            .singular_values
            .iter()
            .take_while(|&&s| s >= self.truncation_threshold * sigma_max)
            .count();
        self.u = self.u.columns(0, keep).into();
        self.singular_values = self.singular_values.rows(0, keep).into();
        self.vt = self.vt.rows(0, keep).into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(xs: &[f64]) -> Vector {
        Vector::from_vec(xs.to_vec())
    }

    #[test]
    fn insert_column_builds_orthonormal_q() {
        let mut qr = QrDecomposition::empty(3);
        qr.insert_column(&col(&[1.0, 0.0, 0.0]), FilterKind::NoFilter).unwrap();
        qr.insert_column(&col(&[1.0, 1.0, 0.0]), FilterKind::NoFilter).unwrap();
        let gram = qr.q().transpose() * qr.q();
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[(i, j)] - expected).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn reconstructs_original_matrix() {
        let mut qr = QrDecomposition::empty(3);
        let c0 = col(&[1.0, 2.0, 3.0]);
        let c1 = col(&[0.0, 1.0, 1.0]);
        qr.insert_column(&c0, FilterKind::NoFilter).unwrap();
        qr.insert_column(&c1, FilterKind::NoFilter).unwrap();
        let reconstructed = qr.q() * qr.r();
        for (i, expected) in [c0, c1].iter().enumerate() {
            for row in 0..3 {
                assert!((reconstructed[(row, i)] - expected[row]).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn qr2_filter_rejects_near_dependent_column() {
        let mut qr = QrDecomposition::empty(2);
        qr.insert_column(&col(&[1.0, 0.0]), FilterKind::NoFilter).unwrap();
        let accepted = qr
            .insert_column(&col(&[1.0, 1e-10]), FilterKind::Qr2 { singularity_limit: 1e-6 })
            .unwrap();
        assert!(!accepted);
        assert_eq!(qr.rank(), 1);
    }

    #[test]
    fn delete_column_keeps_qr_consistent() {
        let mut qr = QrDecomposition::empty(3);
        qr.insert_column(&col(&[1.0, 0.0, 0.0]), FilterKind::NoFilter).unwrap();
        qr.insert_column(&col(&[0.0, 1.0, 0.0]), FilterKind::NoFilter).unwrap();
        qr.insert_column(&col(&[0.0, 0.0, 1.0]), FilterKind::NoFilter).unwrap();
        qr.delete_column(1).unwrap();
        assert_eq!(qr.rank(), 2);
        let reconstructed = qr.q() * qr.r();
        assert!((reconstructed[(0, 0)] - 1.0).abs() < 1e-10);
        assert!((reconstructed[(2, 1)] - 1.0).abs() < 1e-10);
    }

    #[test]
    fn filter_columns_qr1_abs_drops_small_diagonal() {
        let mut qr = QrDecomposition::empty(2);
        qr.insert_column(&col(&[1.0, 0.0]), FilterKind::NoFilter).unwrap();
        qr.insert_column(&col(&[1.0 + 1e-9, 1e-9]), FilterKind::NoFilter).unwrap();
        let dropped = qr.filter_columns(FilterKind::Qr1Abs { singularity_limit: 1e-6 }).unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(qr.rank(), 1);
    }

    #[test]
    fn solve_least_squares_recovers_exact_solution() {
        let mut qr = QrDecomposition::empty(2);
        qr.insert_column(&col(&[1.0, 0.0]), FilterKind::NoFilter).unwrap();
        qr.insert_column(&col(&[0.0, 1.0]), FilterKind::NoFilter).unwrap();
        let alpha = qr.solve_least_squares(&col(&[3.0, 4.0])).unwrap();
        assert!((alpha[0] - 3.0).abs() < 1e-10);
        assert!((alpha[1] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn truncated_svd_rank_matches_dominant_singular_values() {
        // Geometrically decaying singular values (ratio 0.1), 4 of them
        // above a 1e-3 relative threshold out of 8.
        let mut sigmas = vec![1.0];
        for _ in 1..8 {
            sigmas.push(sigmas.last().unwrap() * 0.1);
        }
        let n = 8;
        let j = Matrix::from_fn(n, n, |r, c| if r == c { sigmas[r] } else { 0.0 });
        let svd = TruncatedSvd::from_matrix(&j, 1e-3);
        let expected_rank = sigmas.iter().filter(|&&s| s >= 1e-3 * sigmas[0]).count();
        assert_eq!(svd.rank(), expected_rank);
    }
}
