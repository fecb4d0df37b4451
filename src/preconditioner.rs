//! Diagonal scaling of stacked residual/value vectors, with freeze policy.
//!
//! A preconditioner maintains a per-subvector weight `w` and its inverse
//! `w^-1`, sized to the per-field stacked layout.
//! `apply`/`revert` scale rows of a stacked matrix; the round-trip must be
//! the identity within floating-point tolerance.

use crate::{Matrix, Vector};

/// Which quantity drives the preconditioner's weight update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionerVariant {
    /// Weights are always `1`; always frozen.
    Constant,
    /// Weight of a subvector is the reciprocal of its current-value norm.
    ValueNorm,
    /// Weight of a subvector is the reciprocal of its residual norm.
    ResidualNorm,
    /// Weight of a subvector is the reciprocal of the sum of residual
    /// magnitudes.
    ResidualSum,
}

/// Errors from preconditioner construction or use.
#[derive(Debug, thiserror::Error)]
pub enum PreconditionerError {
    /// The stacked matrix's row count didn't match the sum of the
    /// registered subvector sizes.
    #[error("stacked row count {rows} does not match subvector layout total {total}")]
    LayoutMismatch {
        /// Rows in the matrix passed to `apply`/`revert`.
        rows: usize,
        /// Sum of the registered subvector sizes.
        total: usize,
    },
}

/// Maintains per-subvector scale factors for a stacked layout of several
/// fields.
pub struct Preconditioner {
    variant: PreconditionerVariant,
    /// Size of each field's subvector, in stacking order.
    subvector_sizes: Vec<usize>,
    /// Per-row weight, length = sum of `subvector_sizes`.
    weights: Vector,
    /// Completed windows since construction.
    completed_windows: u32,
    /// Freeze after this many completed windows; `None` means never freeze
    /// (besides the `Constant` variant, which is always frozen).
    max_non_const_timesteps: Option<u32>,
    frozen: bool,
}

impl Preconditioner {
    /// Build a preconditioner over fields with the given subvector sizes,
    /// all weights initialized to `1`.
    pub fn new(
        variant: PreconditionerVariant,
        subvector_sizes: Vec<usize>,
        max_non_const_timesteps: Option<u32>,
    ) -> Self {
        let total: usize = subvector_sizes.iter().sum();
        Self {
            frozen: variant == PreconditionerVariant::Constant,
            variant,
            weights: Vector::from_element(total, 1.0),
            subvector_sizes,
            completed_windows: 0,
            max_non_const_timesteps,
        }
    }

    /// `true` once weights no longer update.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Recompute weights from `old_values`/`residuals` (stacked, one entry
    /// per field in layout order) unless frozen. Call with
    /// `time_window_completed = true` exactly once per accepted window so
    /// the freeze counter advances correctly.
    pub fn update(
        &mut self,
        time_window_completed: bool,
        values_by_field: &[Vector],
        residuals_by_field: &[Vector],
    ) {
        if self.frozen {
            return;
        }
        debug_assert_eq!(values_by_field.len(), self.subvector_sizes.len());
        debug_assert_eq!(residuals_by_field.len(), self.subvector_sizes.len());

        let mut offset = 0;
        for (i, &size) in self.subvector_sizes.iter().enumerate() {
            let scale = match self.variant {
                PreconditionerVariant::Constant => 1.0,
                PreconditionerVariant::ValueNorm => {
                    reciprocal_or_one(values_by_field[i].norm())
                }
                PreconditionerVariant::ResidualNorm => {
                    reciprocal_or_one(residuals_by_field[i].norm())
                }
                PreconditionerVariant::ResidualSum => {
                    reciprocal_or_one(residuals_by_field[i].iter().map(|x| x.abs()).sum())
                }
            };
            for w in self.weights.rows_mut(offset, size).iter_mut() {
                *w = scale;
            }
            offset += size;
        }

        if time_window_completed {
            self.completed_windows += 1;
            if let Some(max) = self.max_non_const_timesteps {
                if self.completed_windows >= max {
                    self.frozen = true;
                }
            }
        }
    }

    /// Scale the rows of `m` by `w`.
    pub fn apply(&self, m: &Matrix) -> Result<Matrix, PreconditionerError> {
        self.check_layout(m)?;
        Ok(Matrix::from_fn(m.nrows(), m.ncols(), |r, c| m[(r, c)] * self.weights[r]))
    }

    /// Scale the rows of `m` by `w^-1`. `apply` composed with
    /// `revert` is the identity within floating-point tolerance.
    pub fn revert(&self, m: &Matrix) -> Result<Matrix, PreconditionerError> {
        self.check_layout(m)?;
        Ok(Matrix::from_fn(m.nrows(), m.ncols(), |r, c| m[(r, c)] / self.weights[r]))
    }

    /// `apply` specialized to a single column vector (used by quasi-Newton
    /// variants to scale a residual or history column).
    pub fn apply_vector(&self, v: &Vector) -> Result<Vector, PreconditionerError> {
        Ok(self.apply(&Matrix::from_column_slice(v.len(), 1, v.as_slice()))?.column(0).into())
    }

    /// `revert` specialized to a single column vector.
    pub fn revert_vector(&self, v: &Vector) -> Result<Vector, PreconditionerError> {
        Ok(self.revert(&Matrix::from_column_slice(v.len(), 1, v.as_slice()))?.column(0).into())
    }

    fn check_layout(&self, m: &Matrix) -> Result<(), PreconditionerError> {
        let total: usize = self.subvector_sizes.iter().sum();
        if m.nrows() != total {
            return Err(PreconditionerError::LayoutMismatch { rows: m.nrows(), total });
        }
        Ok(())
    }
}

fn reciprocal_or_one(norm: f64) -> f64 {
    if norm > 0.0 {
        1.0 / norm
    } else {
        1.0
    }
}
