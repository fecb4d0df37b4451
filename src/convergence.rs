//! Convergence predicates over (previous, current) value vectors.
//!
//! Each measure variant updates a `residual_norm` and reports whether the
//! underlying fixed-point iteration has converged. Norm computation is a
//! reduction over the participant's process group, so this crate models
//! that reduction as a pluggable [`NormReducer`]: a single-process caller
//! (or this crate's own tests) can use the trivial identity reducer while
//! a distributed deployment supplies one that all-reduces partial sums of
//! squares across ranks.

/// Combines a local sum-of-squares into a process-group-wide L2 norm.
/// `local_sum_of_squares` is this rank's contribution; the returned value
/// is `sqrt` of the reduced total.
pub trait NormReducer {
    /// Reduce `local_sum_of_squares` across the process group and return
    /// the resulting L2 norm.
    fn reduce_l2(&self, local_sum_of_squares: f64) -> f64;
}

/// A reducer for a single-rank participant (or this crate's unit tests):
/// the local contribution already is the whole vector.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalNormReducer;

impl NormReducer for LocalNormReducer {
    fn reduce_l2(&self, local_sum_of_squares: f64) -> f64 {
        local_sum_of_squares.sqrt()
    }
}

fn l2_norm(v: &crate::Vector, reducer: &dyn NormReducer) -> f64 {
    reducer.reduce_l2(v.iter().map(|x| x * x).sum())
}

fn diff_norm(old: &crate::Vector, new: &crate::Vector, reducer: &dyn NormReducer) -> f64 {
    let local: f64 = old
        .iter()
        .zip(new.iter())
        .map(|(o, n)| (n - o) * (n - o))
        .sum();
    reducer.reduce_l2(local)
}

/// Errors constructing a convergence measure.
#[derive(Debug, thiserror::Error)]
pub enum ConvergenceConfigError {
    /// `limit`/`fraction` must be strictly positive.
    #[error("threshold must be > 0 (got {0})")]
    NonPositiveThreshold(f64),
    /// A relative fraction must additionally be `<= 1`.
    #[error("relative fraction must be within (0, 1] (got {0})")]
    FractionOutOfRange(f64),
    /// `MinIterations(n)` requires `n >= 1`.
    #[error("MinIterations requires n >= 1 (got {0})")]
    NonPositiveMinIterations(u32),
}

/// One of the four convergence-measure variants.
pub enum ConvergenceMeasure {
    /// Converged if `||new - old||_2 <= limit`.
    Absolute {
        /// The absolute threshold.
        limit: f64,
        /// Latest computed residual norm.
        residual_norm: f64,
    },
    /// Converged if `||new - old||_2 <= fraction * ||new||_2`.
    Relative {
        /// The relative threshold.
        fraction: f64,
        /// Latest computed residual norm.
        residual_norm: f64,
    },
    /// Converged if the current residual is `<= fraction` of the series'
    /// first residual.
    ResidualRelative {
        /// The relative threshold.
        fraction: f64,
        /// Latest computed residual norm.
        residual_norm: f64,
        /// The first residual norm observed this series, if any.
        first_residual_norm: Option<f64>,
    },
    /// Converged once `measure` has been called `n` times, independent of
    /// the values passed.
    MinIterations {
        /// Required call count.
        n: u32,
        /// Calls observed so far.
        count: u32,
    },
}

impl ConvergenceMeasure {
    /// `Absolute(limit)`. `limit` must be `> 0`.
    pub fn absolute(limit: f64) -> Result<Self, ConvergenceConfigError> {
        if limit <= 0.0 {
            return Err(ConvergenceConfigError::NonPositiveThreshold(limit));
        }
        Ok(Self::Absolute { limit, residual_norm: f64::INFINITY })
    }

    /// `Relative(fraction)`. `fraction` must be in `(0, 1]`.
    pub fn relative(fraction: f64) -> Result<Self, ConvergenceConfigError> {
        validate_fraction(fraction)?;
        Ok(Self::Relative { fraction, residual_norm: f64::INFINITY })
    }

    /// `ResidualRelative(fraction)`. `fraction` must be in `(0, 1]`.
    pub fn residual_relative(fraction: f64) -> Result<Self, ConvergenceConfigError> {
        validate_fraction(fraction)?;
        Ok(Self::ResidualRelative {
            fraction,
            residual_norm: f64::INFINITY,
            first_residual_norm: None,
        })
    }

    /// `MinIterations(n)`. `n` must be `>= 1`.
    pub fn min_iterations(n: u32) -> Result<Self, ConvergenceConfigError> {
        if n == 0 {
            return Err(ConvergenceConfigError::NonPositiveMinIterations(n));
        }
        Ok(Self::MinIterations { n, count: 0 })
    }

    /// Reset any per-series state (e.g. the `ResidualRelative` baseline and
    /// the `MinIterations` counter) for a new window.
    pub fn reset(&mut self) {
        match self {
            ConvergenceMeasure::Absolute { residual_norm, .. }
            | ConvergenceMeasure::Relative { residual_norm, .. } => {
                *residual_norm = f64::INFINITY;
            }
            ConvergenceMeasure::ResidualRelative {
                residual_norm,
                first_residual_norm,
                ..
            } => {
                *residual_norm = f64::INFINITY;
                *first_residual_norm = None;
            }
            ConvergenceMeasure::MinIterations { count, .. } => *count = 0,
        }
    }

    /// The latest residual norm computed by [`Self::measure`].
    pub fn residual_norm(&self) -> f64 {
        match self {
            ConvergenceMeasure::Absolute { residual_norm, .. }
            | ConvergenceMeasure::Relative { residual_norm, .. }
            | ConvergenceMeasure::ResidualRelative { residual_norm, .. } => *residual_norm,
            ConvergenceMeasure::MinIterations { .. } => 0.0,
        }
    }

    /// Update internal state from `(old, new)` and report whether this
    /// measure now considers the iteration converged.
    pub fn measure(
        &mut self,
        old: &crate::Vector,
        new: &crate::Vector,
        reducer: &dyn NormReducer,
    ) -> bool {
        match self {
            ConvergenceMeasure::Absolute { limit, residual_norm } => {
                *residual_norm = diff_norm(old, new, reducer);
                *residual_norm <= *limit
            }
            ConvergenceMeasure::Relative { fraction, residual_norm } => {
                *residual_norm = diff_norm(old, new, reducer);
                *residual_norm <= *fraction * l2_norm(new, reducer)
            }
            ConvergenceMeasure::ResidualRelative {
                fraction,
                residual_norm,
                first_residual_norm,
            } => {
                *residual_norm = diff_norm(old, new, reducer);
                let baseline = *first_residual_norm.get_or_insert(*residual_norm);
                *residual_norm <= *fraction * baseline
            }
            ConvergenceMeasure::MinIterations { n, count } => {
                *count += 1;
                *count >= *n
            }
        }
    }
}

fn validate_fraction(fraction: f64) -> Result<(), ConvergenceConfigError> {
    if fraction <= 0.0 {
        return Err(ConvergenceConfigError::NonPositiveThreshold(fraction));
    }
    if fraction > 1.0 {
        return Err(ConvergenceConfigError::FractionOutOfRange(fraction));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vector;

    fn v(xs: &[f64]) -> Vector {
        Vector::from_vec(xs.to_vec())
    }

    #[test]
    fn absolute_converges_within_limit() {
        let mut m = ConvergenceMeasure::absolute(0.5).unwrap();
        assert!(m.measure(&v(&[0.0]), &v(&[0.3]), &LocalNormReducer));
        assert!((m.residual_norm() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn absolute_rejects_nonpositive_limit() {
        assert!(matches!(
            ConvergenceMeasure::absolute(0.0),
            Err(ConvergenceConfigError::NonPositiveThreshold(_))
        ));
    }

    #[test]
    fn relative_rejects_fraction_above_one() {
        assert!(matches!(
            ConvergenceMeasure::relative(1.5),
            Err(ConvergenceConfigError::FractionOutOfRange(_))
        ));
    }

    #[test]
    fn residual_relative_uses_first_residual_as_baseline() {
        let mut m = ConvergenceMeasure::residual_relative(0.5).unwrap();
        assert!(!m.measure(&v(&[0.0]), &v(&[1.0]), &LocalNormReducer));
        assert!(m.measure(&v(&[0.0]), &v(&[0.4]), &LocalNormReducer));
    }

    #[test]
    fn min_iterations_converges_after_n_calls_regardless_of_values() {
        let mut m = ConvergenceMeasure::min_iterations(3).unwrap();
        assert!(!m.measure(&v(&[0.0]), &v(&[100.0]), &LocalNormReducer));
        assert!(!m.measure(&v(&[0.0]), &v(&[100.0]), &LocalNormReducer));
        assert!(m.measure(&v(&[0.0]), &v(&[100.0]), &LocalNormReducer));
    }

    #[test]
    fn reset_clears_series_state() {
        let mut m = ConvergenceMeasure::min_iterations(2).unwrap();
        m.measure(&v(&[0.0]), &v(&[0.0]), &LocalNormReducer);
        m.reset();
        assert!(!m.measure(&v(&[0.0]), &v(&[0.0]), &LocalNormReducer));
    }
}
