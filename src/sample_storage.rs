//! Ordered time -> value-vector store for one data field within a window.
//!
//! `SampleStorage` backs both sub-cycling (intermediate writes within an
//! open window) and the waveform interpolation layer (`crate::waveform`).
//! Keys are strictly increasing as written: `set` rejects a
//! write at a time strictly before the latest stored key.

use crate::Vector;

/// Errors from [`SampleStorage`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SampleStorageError {
    /// `set(t, _)` was called with `t` strictly less than the latest stored
    /// time.
    #[error("write at t={t} is before the latest stored time t={latest}")]
    InvalidTime {
        /// The rejected time.
        t: f64,
        /// The latest time already stored.
        latest: f64,
    },
    /// A read was attempted on a storage with no samples at all.
    #[error("sampled an empty storage")]
    NoData,
}

/// An ordered `t -> v` store, `t: f64` strictly increasing as inserted.
///
/// Internally a `Vec<(f64, Vector)>` kept sorted by insertion discipline
/// (`set` enforces non-decreasing `t`, so no re-sort is ever needed) rather
/// than a `BTreeMap`, since `f64` is not `Ord` and the insertion-order
/// invariant already gives us the ordering for free.
#[derive(Debug, Clone, Default)]
pub struct SampleStorage {
    samples: Vec<(f64, Vector)>,
}

impl SampleStorage {
    /// An empty store.
    pub fn new() -> Self {
        Self { samples: Vec::new() }
    }

    /// Insert or overwrite the sample at `t`. `t` must equal the latest
    /// stored time (overwrite) or be strictly greater (append); anything
    /// else is `InvalidTime`.
    pub fn set(&mut self, t: f64, v: Vector) -> Result<(), SampleStorageError> {
        match self.samples.last() {
            Some((latest, _)) if t < *latest => {
                Err(SampleStorageError::InvalidTime { t, latest: *latest })
            }
            Some((latest, _)) if t == *latest => {
                let last = self.samples.last_mut().expect("checked above");
                last.1 = v;
                Ok(())
            }
            _ => {
                self.samples.push((t, v));
                Ok(())
            }
        }
    }

    /// Discard every sample with `t` strictly before `t`.
    pub fn clear_all_before(&mut self, t: f64) {
        self.samples.retain(|(ti, _)| *ti >= t);
    }

    /// Discard every sample except the last one.
    pub fn clear_except_last(&mut self) {
        if let Some(last) = self.samples.pop() {
            self.samples.clear();
            self.samples.push(last);
        }
    }

    /// The earliest `(t, v)` pair, if any.
    pub fn first(&self) -> Option<(f64, &Vector)> {
        self.samples.first().map(|(t, v)| (*t, v))
    }

    /// The latest `(t, v)` pair, if any.
    pub fn last(&self) -> Option<(f64, &Vector)> {
        self.samples.last().map(|(t, v)| (*t, v))
    }

    /// `true` if no samples are stored.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Ascending-`t` iteration over the stored pairs.
    pub fn iter(&self) -> impl Iterator<Item = (f64, &Vector)> {
        self.samples.iter().map(|(t, v)| (*t, v))
    }

    /// The pair `(t_i, v_i)` with the greatest `t_i <= t`, and the pair with
    /// the smallest `t_j >= t` immediately after it, if both exist. Used by
    /// order-1 waveform interpolation to find the bracketing samples.
    pub(crate) fn bracket(&self, t: f64) -> Option<(&(f64, Vector), Option<&(f64, Vector)>)> {
        if self.samples.is_empty() {
            return None;
        }
        // Largest index whose time is <= t, or 0 if all times are > t
        // (endpoint clamping is the caller's responsibility).
        let idx = match self
            .samples
            .binary_search_by(|(ti, _)| ti.partial_cmp(&t).expect("t must not be NaN"))
        {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        Some((&self.samples[idx], self.samples.get(idx + 1)))
    }
}
