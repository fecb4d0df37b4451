//! Interpolation over a [`SampleStorage`] of a field.
//!
//! A waveform does not own its samples; it borrows a `SampleStorage` and
//! evaluates it at an arbitrary `t` with either order-0 (piecewise
//! constant) or order-1 (piecewise linear) interpolation, clamping to the
//! nearest endpoint outside the stored range.

use crate::sample_storage::{SampleStorage, SampleStorageError};
use crate::Vector;

/// Interpolation order a [`Waveform`] samples with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpolationOrder {
    /// Piecewise constant: hold the last sample at or before `t`.
    Constant,
    /// Piecewise linear between the two samples bracketing `t`.
    Linear,
}

/// Errors sampling a [`Waveform`].
#[derive(Debug, thiserror::Error)]
pub enum WaveformError {
    /// Propagated from the underlying storage.
    #[error(transparent)]
    Storage(#[from] SampleStorageError),
}

/// A time-indexed view over one field's [`SampleStorage`], supporting
/// sub-stepping and interpolation at arbitrary times.
pub struct Waveform<'s> {
    storage: &'s SampleStorage,
    order: InterpolationOrder,
}

impl<'s> Waveform<'s> {
    /// Build a waveform over `storage`, sampling with `order`.
    pub fn new(storage: &'s SampleStorage, order: InterpolationOrder) -> Self {
        Self { storage, order }
    }

    /// Evaluate the waveform at `t`.
    ///
    /// - order 0: `v(t_k)` where `t_k = max{t_i <= t}`; if `t < t_first`,
    ///   returns `v(t_first)`.
    /// - order 1: linear interpolation between the bracketing samples, with
    ///   endpoint clamping outside `[t_first, t_last]`.
    pub fn sample(&self, t: f64) -> Result<Vector, WaveformError> {
        if self.storage.is_empty() {
            return Err(SampleStorageError::NoData.into());
        }
        let (first_t, _) = self.storage.first().expect("checked non-empty above");
        let (last_t, last_v) = self.storage.last().expect("checked non-empty above");

        if t <= first_t {
            return Ok(self.storage.first().expect("checked non-empty above").1.clone());
        }
        if t >= last_t {
            return Ok(last_v.clone());
        }

        let (lo, hi) = self
            .storage
            .bracket(t)
            .expect("non-empty storage and t within range must bracket");
        match self.order {
            InterpolationOrder::Constant => Ok(lo.1.clone()),
            InterpolationOrder::Linear => {
                let hi = hi.expect("t < last_t implies a sample strictly after lo exists");
                let (t0, v0) = (lo.0, &lo.1);
                let (t1, v1) = (hi.0, &hi.1);
                let frac = (t - t0) / (t1 - t0);
                Ok(v0 + (v1 - v0) * frac)
            }
        }
    }
}

/// Drop every sample strictly before `previous_end`, keeping only the final
/// sample of the previous window as the new anchor.
///
/// The solver is then expected to append samples up to `new_window_end`.
/// Takes `&mut SampleStorage` directly (rather than being a method on
/// `Waveform`, which only holds a shared borrow) since moving to the next
/// window mutates the underlying storage.
pub fn move_to_next_window(storage: &mut SampleStorage, previous_end: f64) {
    storage.clear_all_before(previous_end);
    storage.clear_except_last();
}
