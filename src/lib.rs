//! Crate root: shared aliases, identifiers, and the module map of the
//! coupling core.
//!
//! This crate implements the four tightly-coupled subsystems that sit at the
//! center of a multi-physics coupling runtime: the coupling-scheme state
//! machine, the acceleration (quasi-Newton) engine, the waveform /
//! time-interpolation layer, and the M2N data-exchange layer. Mesh geometry,
//! spatial mapping, XML configuration parsing, and the participant-facing API
//! surface are external collaborators; this crate only exposes the narrow
//! contracts it needs from them (see [`mesh`] and [`config`]).
//!
//! ## Invariants
//!
//! - All field data is represented as `Vector = nalgebra::DVector<f64>`; a
//!   field of dimensionality `d` over a mesh with `k` vertices has vector
//!   length `d * k`.
//! - Every fallible operation returns a `Result` with a `thiserror`-typed
//!   error; nothing in this crate panics on bad external input. Invariant
//!   violations that indicate a bug in *this* crate may still assert.

#![deny(rust_2018_idioms)]
#![warn(missing_docs)]

/// Opaque mesh/vertex-partition facts the core needs to size and reduce
/// vectors.
pub mod mesh;
/// The configuration record external XML parsing hands to the core.
pub mod config;
/// Ordered time -> value-vector store for one field.
pub mod sample_storage;
/// Interpolation over a [`sample_storage::SampleStorage`].
pub mod waveform;
/// Binds a field's current value, prior iteration, and waveform storage.
pub mod coupling_data;
/// Typed, ordered block send/receive between participant process groups.
pub mod m2n;
/// Convergence predicates over (previous, current) value vectors.
pub mod convergence;
/// Diagonal preconditioning of stacked residual/value vectors.
pub mod preconditioner;
/// Incremental and block QR, column filtering, truncated SVD update.
pub mod qr;
/// The acceleration trait, and the two variants with no V/W history
/// (constant relaxation, Aitken).
pub mod acceleration;
/// Quasi-Newton variants that maintain V/W histories and (optionally) an
/// explicit Jacobian: IQN-ILS, IQN-IMVJ, Broyden.
pub mod quasi_newton;
/// Coupling-scheme state machine base: time/window bookkeeping, actions,
/// extrapolation, checkpoint requests.
pub mod coupling_scheme;
/// Serial (first/second participant) concrete coupling scheme.
pub mod serial_scheme;
/// Parallel concrete coupling scheme.
pub mod parallel_scheme;
/// Multi (controller/followers) concrete coupling scheme.
pub mod multi_scheme;
/// Composes several bi-couplings into one advance.
pub mod compositional_scheme;
/// Append-only text logs mirroring a per-participant iteration log and
/// convergence log.
pub mod iteration_log;

/// Dense real vector used for field values throughout the crate.
pub type Vector = nalgebra::DVector<f64>;
/// Dense real matrix used for stacked acceleration histories (V, W) and for
/// the QR/SVD kernels.
pub type Matrix = nalgebra::DMatrix<f64>;

/// Identifier of a registered data field. Callers mint these (typically
/// from configuration order); this crate never allocates one itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct DataId(pub u32);

/// Identifier of a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct MeshId(pub u32);

/// Per-vertex dimensionality of a data field, constrained to `{1, 2, 3}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimension(u8);

impl Dimension {
    /// Construct a dimension, rejecting anything outside `{1, 2, 3}`.
    pub fn new(d: u8) -> Option<Self> {
        matches!(d, 1..=3).then_some(Self(d))
    }

    /// The raw dimension value.
    #[inline]
    pub fn get(self) -> u8 {
        self.0
    }
}

/// Structured diagnostic context attached to fatal errors: current window,
/// iteration, and participant, when known.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// 1-based time window in which the error occurred, if known.
    pub time_window: Option<u64>,
    /// Iteration within the time window, if known.
    pub iteration: Option<u32>,
    /// Name of the participant reporting the error, if known.
    pub participant: Option<String>,
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "window={:?} iteration={:?} participant={:?}",
            self.time_window, self.iteration, self.participant
        )
    }
}
