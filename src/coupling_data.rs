//! Binds a field's current value, prior iteration, and sample storage.
//!
//! `values` aliases the external `DataField`'s storage; this
//! crate models that aliasing as shared, single-writer-at-a-time ownership
//! via `Rc<RefCell<Vector>>`.

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use crate::sample_storage::SampleStorage;
use crate::Vector;

/// A shared, single-writer-at-a-time value vector.
pub type SharedVector = Rc<RefCell<Vector>>;

/// Errors constructing or using a [`CouplingData`].
#[derive(Debug, thiserror::Error)]
pub enum CouplingDataError {
    /// `values`, `previousIteration`, and `oldValues` must agree on length
    /// once allocated.
    #[error("size mismatch: values has {values} entries, previousIteration has {previous}")]
    SizeMismatch {
        /// Length of `values`.
        values: usize,
        /// Length of `previousIteration`.
        previous: usize,
    },
}

/// Binds one field's current value, its snapshot from the start of the
/// current iteration, its extrapolation history, and (optionally) its
/// waveform storage.
pub struct CouplingData {
    /// Current vector, aliased with the external `DataField` storage.
    values: SharedVector,
    /// Snapshot from the start of the current iteration.
    previous_iteration: Vector,
    /// Columns `[current, t-1, ..., t-k]`, `k` = extrapolation order.
    old_values: Vec<Vector>,
    /// Per-field sample storage for waveform use: authoritative for
    /// within-window sub-stepping/interpolation only, never for
    /// extrapolation.
    storage: SampleStorage,
    /// Set by the producer participant; the receiver must supply an
    /// initial value before `initializeData` returns.
    pub requires_initialization: bool,
    /// `true` if this field participates in waveform sub-stepping; if
    /// `false`, extrapolation (`old_values`) is this field's sole source of
    /// truth across windows.
    pub uses_waveform: bool,
}

impl CouplingData {
    /// Construct a `CouplingData` with all columns of `old_values`
    /// initialized from `initial`.
    pub fn new(
        values: SharedVector,
        extrapolation_order: u8,
        requires_initialization: bool,
        uses_waveform: bool,
    ) -> Self {
        let initial = values.borrow().clone();
        let columns = extrapolation_order as usize + 1;
        Self {
            previous_iteration: initial.clone(),
            old_values: vec![initial; columns],
            values,
            storage: SampleStorage::new(),
            requires_initialization,
            uses_waveform,
        }
    }

    /// Read-only borrow of the current value.
    pub fn values(&self) -> Ref<'_, Vector> {
        self.values.borrow()
    }

    /// Mutable borrow of the current value.
    pub fn values_mut(&self) -> RefMut<'_, Vector> {
        self.values.borrow_mut()
    }

    /// The shared handle itself, for aliasing with an external `DataField`.
    pub fn shared_values(&self) -> SharedVector {
        self.values.clone()
    }

    /// The snapshot taken at the start of the current iteration.
    pub fn previous_iteration(&self) -> &Vector {
        &self.previous_iteration
    }

    /// Snapshot `values` into `previousIteration` at the start of a new
    /// iteration.
    pub fn store_iteration(&mut self) {
        self.previous_iteration = self.values.borrow().clone();
    }

    /// The extrapolation history, column 0 = most recently accepted value.
    pub fn old_values(&self) -> &[Vector] {
        &self.old_values
    }

    /// Shift extrapolation columns right by one and set column 0 to
    /// `accepted`. `accepted` must agree in length with the existing
    /// columns.
    pub fn shift_old_values(&mut self, accepted: Vector) -> Result<(), CouplingDataError> {
        if let Some(previous) = self.old_values.first() {
            if previous.len() != accepted.len() {
                return Err(CouplingDataError::SizeMismatch { values: accepted.len(), previous: previous.len() });
            }
        }
        for i in (1..self.old_values.len()).rev() {
            self.old_values[i] = self.old_values[i - 1].clone();
        }
        if let Some(first) = self.old_values.first_mut() {
            *first = accepted;
        }
        Ok(())
    }

    /// Read-only access to this field's waveform storage.
    pub fn storage(&self) -> &SampleStorage {
        &self.storage
    }

    /// Mutable access to this field's waveform storage.
    pub fn storage_mut(&mut self) -> &mut SampleStorage {
        &mut self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(x: f64) -> SharedVector {
        Rc::new(RefCell::new(Vector::from_vec(vec![x])))
    }

    #[test]
    fn store_iteration_snapshots_current_value() {
        let v = shared(1.0);
        let mut cd = CouplingData::new(v.clone(), 0, false, false);
        *v.borrow_mut() = Vector::from_vec(vec![2.0]);
        cd.store_iteration();
        assert_eq!(cd.previous_iteration()[0], 2.0);
    }

    #[test]
    fn shift_old_values_moves_all_columns() {
        let v = shared(1.0);
        let mut cd = CouplingData::new(v, 2, false, false);
        cd.shift_old_values(Vector::from_vec(vec![4.0])).unwrap();
        cd.shift_old_values(Vector::from_vec(vec![6.5])).unwrap();
        assert_eq!(cd.old_values()[0][0], 6.5);
        assert_eq!(cd.old_values()[1][0], 4.0);
        assert_eq!(cd.old_values()[2][0], 1.0);
    }

    #[test]
    fn shift_old_values_rejects_length_mismatch() {
        let v = shared(1.0);
        let mut cd = CouplingData::new(v, 1, false, false);
        let err = cd.shift_old_values(Vector::from_vec(vec![1.0, 2.0])).unwrap_err();
        assert!(matches!(err, CouplingDataError::SizeMismatch { values: 2, previous: 1 }));
    }

    #[test]
    fn aliasing_read_after_write_is_observed() {
        let v = shared(1.0);
        let cd = CouplingData::new(v.clone(), 0, false, false);
        *v.borrow_mut() = Vector::from_vec(vec![42.0]);
        assert_eq!(cd.values()[0], 42.0);
    }
}
