//! Common acceleration contract, constant relaxation, and Aitken's Delta^2.
//!
//! An accelerator consumes the stacked current and previous-iteration
//! values across every coupled field (in the fixed order the coupling
//! scheme registers them) and proposes the next iterate. `quasi_newton`
//! builds on the same `Accelerator` contract for IQN-ILS, IQN-IMVJ, and
//! Broyden.

use crate::preconditioner::{Preconditioner, PreconditionerError};
use crate::Vector;

/// Errors from an acceleration step.
#[derive(Debug, thiserror::Error)]
pub enum AccelerationError {
    /// The stacked input/output vectors disagree in length.
    #[error("stacked vector length mismatch: values has {values}, residual has {residual}")]
    LengthMismatch {
        /// Length of the stacked value vector.
        values: usize,
        /// Length of the stacked residual vector.
        residual: usize,
    },
    /// Forwarded from the preconditioner layer.
    #[error(transparent)]
    Preconditioner(#[from] PreconditionerError),
}

/// Per-field sizes in stacking order, shared by every accelerator variant so
/// `Preconditioner` and `crate::qr` stay aligned with `V`/`W` column layout.
#[derive(Debug, Clone)]
pub struct StackedLayout {
    sizes: Vec<usize>,
}

impl StackedLayout {
    /// Build a layout from per-field subvector sizes.
    pub fn new(sizes: Vec<usize>) -> Self {
        Self { sizes }
    }

    /// Total stacked length.
    pub fn total(&self) -> usize {
        self.sizes.iter().sum()
    }

    /// Per-field sizes, in stacking order.
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Split a stacked vector back into per-field pieces.
    pub fn split<'a>(&self, v: &'a Vector) -> Vec<Vector> {
        let mut offset = 0;
        let mut out = Vec::with_capacity(self.sizes.len());
        for &size in &self.sizes {
            out.push(Vector::from_iterator(size, v.rows(offset, size).iter().copied()));
            offset += size;
        }
        out
    }
}

/// The common iteration-acceleration contract: given the
/// current and previous-iteration stacked values, propose the next
/// iterate. Implementors keep their own `V`/`W` history.
pub trait Accelerator {
    /// Reset any per-window or per-run state (e.g. Aitken's `omega`, or a
    /// quasi-Newton method's column history) when a new run begins.
    fn initialize(&mut self, layout: &StackedLayout);

    /// Given the stacked current iterate `x` and the stacked residual
    /// `r = x_tilde - x` (the just-computed output minus the input), return
    /// the next proposed iterate.
    fn perform_acceleration(
        &mut self,
        x: &Vector,
        r: &Vector,
        preconditioner: &mut Preconditioner,
    ) -> Result<Vector, AccelerationError>;

    /// Called once a time window is accepted; column-history-based variants
    /// use this to decide whether to carry columns into the next window.
    fn on_time_window_complete(&mut self) {}

    /// Number of history columns dropped by filtering during the most
    /// recent `perform_acceleration` call.
    fn deleted_columns(&self) -> usize {
        0
    }
}

fn check_lengths(x: &Vector, r: &Vector) -> Result<(), AccelerationError> {
    if x.len() != r.len() {
        return Err(AccelerationError::LengthMismatch { values: x.len(), residual: r.len() });
    }
    Ok(())
}

/// `x_new = omega * x_tilde + (1 - omega) * x`, `omega` fixed for the whole
/// run.
#[derive(Debug, Clone, Copy)]
pub struct ConstantRelaxation {
    omega: f64,
}

impl ConstantRelaxation {
    /// Build with relaxation factor `omega` in `(0, 1]`.
    pub fn new(omega: f64) -> Self {
        Self { omega }
    }
}

impl Accelerator for ConstantRelaxation {
    fn initialize(&mut self, _layout: &StackedLayout) {}

    fn perform_acceleration(
        &mut self,
        x: &Vector,
        r: &Vector,
        _preconditioner: &mut Preconditioner,
    ) -> Result<Vector, AccelerationError> {
        check_lengths(x, r)?;
        Ok(x + r * self.omega)
    }
}

/// Aitken's Delta^2 relaxation: a scalar `omega` updated each iteration from
/// the angle between successive residuals, reset to the initial relaxation
/// factor at the start of every time window.
#[derive(Debug, Clone)]
pub struct Aitken {
    initial_omega: f64,
    omega: f64,
    previous_residual: Option<Vector>,
}

impl Aitken {
    /// Build with the initial (first-iteration) relaxation factor.
    pub fn new(initial_omega: f64) -> Self {
        Self { initial_omega, omega: initial_omega, previous_residual: None }
    }

    /// The relaxation factor that will be used on the next call.
    pub fn omega(&self) -> f64 {
        self.omega
    }
}

impl Accelerator for Aitken {
    fn initialize(&mut self, _layout: &StackedLayout) {
        self.omega = self.initial_omega;
        self.previous_residual = None;
    }

    fn perform_acceleration(
        &mut self,
        x: &Vector,
        r: &Vector,
        _preconditioner: &mut Preconditioner,
    ) -> Result<Vector, AccelerationError> {
        check_lengths(x, r)?;
        if let Some(prev) = &self.previous_residual {
            let delta = r - prev;
            let denom = delta.dot(&delta);
            if denom > 0.0 {
                self.omega = -self.omega * prev.dot(&delta) / denom;
            }
        }
        self.previous_residual = Some(r.clone());
        Ok(x + r * self.omega)
    }

    fn on_time_window_complete(&mut self) {
        self.omega = self.initial_omega;
        self.previous_residual = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preconditioner::PreconditionerVariant;

    fn precond() -> Preconditioner {
        Preconditioner::new(PreconditionerVariant::Constant, vec![2], None)
    }

    #[test]
    fn constant_relaxation_blends_by_omega() {
        let mut acc = ConstantRelaxation::new(0.25);
        let x = Vector::from_vec(vec![1.0, 1.0]);
        let r = Vector::from_vec(vec![4.0, 0.0]);
        let next = acc.perform_acceleration(&x, &r, &mut precond()).unwrap();
        assert!((next[0] - 2.0).abs() < 1e-12);
        assert!((next[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn aitken_first_iteration_uses_initial_omega() {
        let mut acc = Aitken::new(0.5);
        acc.initialize(&StackedLayout::new(vec![2]));
        let x = Vector::from_vec(vec![0.0, 0.0]);
        let r = Vector::from_vec(vec![2.0, 0.0]);
        let next = acc.perform_acceleration(&x, &r, &mut precond()).unwrap();
        assert!((next[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn aitken_resets_omega_on_window_complete() {
        let mut acc = Aitken::new(0.5);
        acc.initialize(&StackedLayout::new(vec![1]));
        let x = Vector::from_vec(vec![0.0]);
        acc.perform_acceleration(&x, &Vector::from_vec(vec![1.0]), &mut precond()).unwrap();
        acc.perform_acceleration(&x, &Vector::from_vec(vec![0.5]), &mut precond()).unwrap();
        assert!((acc.omega() - 0.5).abs() > 1e-9);
        acc.on_time_window_complete();
        assert!((acc.omega() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn length_mismatch_is_reported() {
        let mut acc = ConstantRelaxation::new(0.5);
        let err = acc
            .perform_acceleration(
                &Vector::from_vec(vec![1.0]),
                &Vector::from_vec(vec![1.0, 2.0]),
                &mut precond(),
            )
            .unwrap_err();
        assert!(matches!(err, AccelerationError::LengthMismatch { .. }));
    }

    #[test]
    fn stacked_layout_splits_back_into_fields() {
        let layout = StackedLayout::new(vec![2, 1]);
        let parts = layout.split(&Vector::from_vec(vec![1.0, 2.0, 3.0]));
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].as_slice(), &[1.0, 2.0]);
        assert_eq!(parts[1].as_slice(), &[3.0]);
    }
}
