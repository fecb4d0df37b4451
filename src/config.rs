//! The configuration record external XML parsing hands to the core. XML
//! parsing itself is out of scope; this module only defines the
//! already-parsed shape this crate consumes.
//!
//! Modeled as `serde`-(de)serializable structs so a collaborator can hand us
//! a record built from JSON/TOML/XML with equal ease.

use serde::{Deserialize, Serialize};

use crate::acceleration::{Accelerator, Aitken, ConstantRelaxation};
use crate::convergence::{ConvergenceConfigError, ConvergenceMeasure};
use crate::preconditioner::PreconditionerVariant;
use crate::quasi_newton::{Broyden, IqnImvj, IqnIls};
use crate::{qr::FilterKind, DataId, MeshId};

/// `maxTime` / `maxTimeWindows`: either a concrete bound or "undefined".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Bound<T> {
    /// No bound; the coupling runs until some other condition ends it.
    Undefined,
    /// A concrete bound.
    Value(T),
}

impl<T: PartialOrd> Bound<T> {
    /// `true` if `x` is still within bound, i.e. the bound does not yet
    /// forbid `x`.
    pub fn allows(&self, x: &T) -> bool {
        match self {
            Bound::Undefined => true,
            Bound::Value(limit) => x <= limit,
        }
    }
}

/// How `timeWindowSize` is determined.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TimeWindowSize {
    /// A fixed window size known up front.
    Fixed(f64),
    /// Take the dt offered by the first participant's first `advance` call
    /// as the window size for the run.
    FirstParticipant,
}

/// The kind of coupling scheme this configuration builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemeKind {
    /// Explicit serial coupling.
    SerialExplicit,
    /// Implicit serial coupling.
    SerialImplicit,
    /// Explicit parallel coupling.
    ParallelExplicit,
    /// Implicit parallel coupling.
    ParallelImplicit,
    /// Multi (controller + followers) coupling.
    Multi,
    /// Compositional coupling of sub-schemes.
    Compositional,
}

impl SchemeKind {
    /// `true` for the two implicit variants; implicit schemes require at
    /// least one convergence measure and enforce
    /// `maxIterations`.
    pub fn is_implicit(self) -> bool {
        matches!(
            self,
            SchemeKind::SerialImplicit | SchemeKind::ParallelImplicit
        )
    }
}

/// Which participant reads/writes a registered data item, and whether the
/// producer must initialize it before the first exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// The data field id.
    pub data_id: DataId,
    /// The mesh the data lives on.
    pub mesh_id: MeshId,
    /// `true` if this is a send (from this participant's perspective),
    /// `false` if a receive.
    pub is_send: bool,
    /// Whether the producer participant must supply a value before
    /// `initializeData` returns.
    pub requires_initialization: bool,
}

/// One convergence measure registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceMeasureConfig {
    /// Which data id this measure watches.
    pub data_id: DataId,
    /// If `true`, this measure alone being converged suffices for overall
    /// convergence.
    pub suffices: bool,
    /// The measure's kind and threshold.
    pub kind: ConvergenceMeasureKind,
}

/// The variant + threshold of a convergence measure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ConvergenceMeasureKind {
    /// Absolute(limit).
    Absolute { limit: f64 },
    /// Relative(fraction).
    Relative { fraction: f64 },
    /// ResidualRelative(fraction).
    ResidualRelative { fraction: f64 },
    /// MinIterations(n).
    MinIterations { n: u32 },
}

/// Preconditioner kind + parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum PreconditionerKind {
    /// Always frozen, weights == 1.
    Constant,
    /// Scales by the reciprocal norm of the current value.
    Value,
    /// Scales by the reciprocal norm of the residual.
    Residual,
    /// Scales by the reciprocal sum of residual magnitudes.
    ResidualSum,
}

impl From<PreconditionerKind> for PreconditionerVariant {
    fn from(kind: PreconditionerKind) -> Self {
        match kind {
            PreconditionerKind::Constant => PreconditionerVariant::Constant,
            PreconditionerKind::Value => PreconditionerVariant::ValueNorm,
            PreconditionerKind::Residual => PreconditionerVariant::ResidualNorm,
            PreconditionerKind::ResidualSum => PreconditionerVariant::ResidualSum,
        }
    }
}

/// IMVJ restart mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ImvjRestartMode {
    /// Carry the Jacobian across all windows.
    NoRestart,
    /// Drop the Jacobian at every window.
    Rs0,
    /// Rebuild from the last N windows of (V, W) via an IQN-ILS-like
    /// projection.
    RsLs {
        /// `reusedTimestepsAtRestart`.
        reused_timesteps_at_restart: u32,
    },
    /// Maintain a truncated SVD of the Jacobian.
    RsSvd {
        /// `truncationThreshold`.
        truncation_threshold: f64,
    },
    /// Keep a sliding window of `chunkSize` recent matrices.
    RsSlide {
        /// `chunkSize`.
        chunk_size: u32,
    },
}

/// Acceleration variant selection + shared parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccelerationConfig {
    /// Which variant to run.
    pub variant: AccelerationVariantConfig,
    /// `initialRelaxation` (omega-0).
    pub initial_relaxation: f64,
    /// `forceInitialRelaxation`.
    pub force_initial_relaxation: bool,
    /// `maxIterationsUsed` — column cap before the oldest are dropped.
    pub max_iterations_used: usize,
    /// `timestepsReused` — how many past windows' columns to keep; `0`
    /// means every window accumulated so far is reused, uncapped.
    pub timesteps_reused: usize,
    /// Column filter policy and its singularity limit.
    pub filter: FilterKind,
    /// Preconditioner selection.
    pub preconditioner: PreconditionerKind,
    /// `freezeAfter` — `maxNonConstTimesteps`.
    pub freeze_after: Option<u32>,
}

/// The acceleration variant an acceleration configuration selects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum AccelerationVariantConfig {
    /// No acceleration.
    None,
    /// Constant relaxation with the config's `initial_relaxation`.
    ConstantRelaxation,
    /// Aitken's Δ² acceleration.
    Aitken,
    /// IQN-ILS.
    IqnIls,
    /// IQN-IMVJ with the given restart mode.
    IqnImvj {
        /// Restart policy.
        restart: ImvjRestartMode,
        /// `alwaysBuildJacobian`.
        always_build_jacobian: bool,
    },
    /// Broyden's method (no cross-window reuse).
    Broyden,
}

/// The full coupling-scheme configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouplingConfig {
    /// `serial-explicit` ... `compositional`.
    pub kind: SchemeKind,
    /// `maxTime`.
    pub max_time: Bound<f64>,
    /// `maxTimeWindows`.
    pub max_time_windows: Bound<u64>,
    /// `timeWindowSize`.
    pub time_window_size: TimeWindowSize,
    /// `validDigits`, 1..=16.
    pub valid_digits: u8,
    /// `maxIterations`, required (>= 1) for implicit schemes.
    pub max_iterations: Option<u32>,
    /// `extrapolationOrder`, 0/1/2.
    pub extrapolation_order: u8,
    /// Names of the participants taking part (first/second, or
    /// controller + followers for multi).
    pub participants: Vec<String>,
    /// Which data items are exchanged, on which mesh, by whom.
    pub data: Vec<DataConfig>,
    /// Registered convergence measures (empty for explicit schemes).
    pub convergence_measures: Vec<ConvergenceMeasureConfig>,
    /// Acceleration configuration (absent for explicit schemes).
    pub acceleration: Option<AccelerationConfig>,
}

/// Errors validating a [`CouplingConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An implicit scheme was configured with no convergence measure.
    #[error("implicit scheme requires at least one convergence measure")]
    MissingConvergenceMeasure,
    /// `maxIterations` missing or zero on an implicit scheme.
    #[error("implicit scheme requires maxIterations >= 1")]
    MissingMaxIterations,
    /// `validDigits` outside `1..=16`.
    #[error("validDigits must be within 1..=16 (got {0})")]
    InvalidValidDigits(u8),
    /// Fewer than two participants registered.
    #[error("at least two participants are required (got {0})")]
    TooFewParticipants(usize),
    /// `extrapolationOrder` outside `0..=2`.
    #[error("extrapolationOrder must be within 0..=2 (got {0})")]
    InvalidExtrapolationOrder(u8),
}

impl CouplingConfig {
    /// Validate non-positive limits, missing convergence measures on
    /// implicit schemes, and other structural requirements. Fatal at
    /// initialize time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=16).contains(&self.valid_digits) {
            return Err(ConfigError::InvalidValidDigits(self.valid_digits));
        }
        if self.extrapolation_order > 2 {
            return Err(ConfigError::InvalidExtrapolationOrder(self.extrapolation_order));
        }
        if self.participants.len() < 2 {
            return Err(ConfigError::TooFewParticipants(self.participants.len()));
        }
        if self.kind.is_implicit() {
            if self.convergence_measures.is_empty() {
                return Err(ConfigError::MissingConvergenceMeasure);
            }
            match self.max_iterations {
                Some(n) if n >= 1 => {}
                _ => return Err(ConfigError::MissingMaxIterations),
            }
        }
        Ok(())
    }

    /// Build the running convergence measures this configuration
    /// registers, in declaration order, paired with the data id each
    /// watches and whether it alone suffices for overall convergence.
    pub fn build_convergence_measures(
        &self,
    ) -> Result<Vec<(DataId, bool, ConvergenceMeasure)>, ConvergenceConfigError> {
        self.convergence_measures
            .iter()
            .map(|m| {
                let measure = match m.kind {
                    ConvergenceMeasureKind::Absolute { limit } => ConvergenceMeasure::absolute(limit)?,
                    ConvergenceMeasureKind::Relative { fraction } => ConvergenceMeasure::relative(fraction)?,
                    ConvergenceMeasureKind::ResidualRelative { fraction } => {
                        ConvergenceMeasure::residual_relative(fraction)?
                    }
                    ConvergenceMeasureKind::MinIterations { n } => ConvergenceMeasure::min_iterations(n)?,
                };
                Ok((m.data_id, m.suffices, measure))
            })
            .collect()
    }

    /// Build the configured accelerator, or `None` for an explicit scheme
    /// (no `acceleration` block) or an explicit `AccelerationVariantConfig::None`.
    pub fn build_accelerator(&self) -> Option<Box<dyn Accelerator>> {
        let cfg = self.acceleration.as_ref()?;
        let accelerator: Box<dyn Accelerator> = match cfg.variant {
            AccelerationVariantConfig::None => return None,
            AccelerationVariantConfig::ConstantRelaxation => {
                Box::new(ConstantRelaxation::new(cfg.initial_relaxation))
            }
            AccelerationVariantConfig::Aitken => Box::new(Aitken::new(cfg.initial_relaxation)),
            AccelerationVariantConfig::IqnIls => {
                // `timestepsReused == 0` means "reuse every past window", not zero
                // columns; only a strictly positive count caps the history.
                let timesteps_reused = (cfg.timesteps_reused > 0).then_some(cfg.timesteps_reused);
                Box::new(
                    IqnIls::new(cfg.initial_relaxation, cfg.filter, cfg.max_iterations_used)
                        .with_force_initial_relaxation(cfg.force_initial_relaxation)
                        .with_timesteps_reused(timesteps_reused),
                )
            }
            AccelerationVariantConfig::IqnImvj { restart, always_build_jacobian } => Box::new(
                IqnImvj::new(cfg.initial_relaxation, cfg.filter, restart, always_build_jacobian, cfg.max_iterations_used)
                    .with_force_initial_relaxation(cfg.force_initial_relaxation),
            ),
            AccelerationVariantConfig::Broyden => {
                Box::new(Broyden::new(cfg.initial_relaxation).with_force_initial_relaxation(cfg.force_initial_relaxation))
            }
        };
        Some(accelerator)
    }

    /// The preconditioner variant and freeze-after-window count this
    /// configuration selects, or `None` if no acceleration is configured.
    pub fn preconditioner_settings(&self) -> Option<(PreconditionerVariant, Option<u32>)> {
        let cfg = self.acceleration.as_ref()?;
        Some((cfg.preconditioner.into(), cfg.freeze_after))
    }
}
