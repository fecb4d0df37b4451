//! Coupling-scheme state machine base: time/window bookkeeping, required
//! actions, extrapolation, and the common `advance` sequence. Concrete
//! schemes (`serial_scheme`, `parallel_scheme`, `multi_scheme`) supply the
//! variant-specific exchange/acceleration/convergence step via
//! [`ExchangeStep`].

use std::collections::{BTreeMap, HashSet};

use crate::config::{Bound, CouplingConfig, ConfigError, TimeWindowSize};
use crate::coupling_data::CouplingData;
use crate::iteration_log::{ConvergenceLog, ConvergenceRow, IterationLog, IterationRow};
use crate::m2n::M2NError;
use crate::{DataId, ErrorContext};

/// Well-known action tokens the solver must fulfill between `advance` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// The solver must supply initial values for send data before the
    /// first `advance`.
    WriteInitialData,
    /// The solver must checkpoint its state before the next `advance`.
    WriteIterationCheckpoint,
    /// The solver must roll its state back to the last checkpoint before
    /// continuing (an iteration did not converge).
    ReadIterationCheckpoint,
}

/// Top-level error type a coupling scheme reports. Wraps the leaf error
/// types, each paired with the window/iteration/participant context active
/// when the error occurred.
#[derive(Debug, thiserror::Error)]
pub enum CouplingSchemeError {
    /// Bad configuration, caught at `initialize` time.
    #[error("configuration error: {source} ({context})")]
    Config {
        /// The underlying validation failure.
        #[source]
        source: ConfigError,
        /// Window/iteration/participant context.
        context: ErrorContext,
    },
    /// `advance` was called with a required action still outstanding.
    #[error("advance called with action {action:?} still pending ({context})")]
    MissingAction {
        /// The unfulfilled action.
        action: ActionKind,
        /// Window/iteration/participant context.
        context: ErrorContext,
    },
    /// `advance` was called after `is_coupling_ongoing()` returned `false`,
    /// or before `initialize`.
    #[error("advance called while not initialized or coupling already ended ({context})")]
    NotAdvanceable {
        /// Window/iteration/participant context.
        context: ErrorContext,
    },
    /// The M2N transport failed; fatal.
    #[error("{source} ({context})")]
    Transport {
        /// The underlying transport failure.
        #[source]
        source: M2NError,
        /// Window/iteration/participant context.
        context: ErrorContext,
    },
    /// An acceleration step failed in a way that could not be recovered by
    /// falling back to constant relaxation.
    #[error("{source} ({context})")]
    Acceleration {
        /// The underlying acceleration failure.
        #[source]
        source: crate::acceleration::AccelerationError,
        /// Window/iteration/participant context.
        context: ErrorContext,
    },
    /// A registered data id was not found.
    #[error("unknown data id {0:?}")]
    UnknownData(DataId),
    /// Writing the iteration or convergence log failed.
    #[error("{source} ({context})")]
    IterationLog {
        /// The underlying log-writing failure.
        #[source]
        source: crate::iteration_log::IterationLogError,
        /// Window/iteration/participant context.
        context: ErrorContext,
    },
}

/// Result of one variant-specific exchange/acceleration/convergence step,
/// returned to [`CouplingScheme::advance`] so it can decide
/// accept-vs-roll-back.
pub struct StepOutcome {
    /// `true` if convergence was reached (or the scheme is explicit, which
    /// always reports converged after its single iteration).
    pub converged: bool,
    /// Number of history columns the acceleration step dropped via
    /// filtering, for the iteration log.
    pub deleted_columns: usize,
}

/// The variant-specific behavior a concrete coupling scheme supplies for
/// one implicit iteration (or the single explicit pass).
pub trait ExchangeStep {
    /// Perform this iteration's data exchange, run acceleration if
    /// configured, evaluate convergence, and report the outcome.
    fn step(&mut self, scheme: &mut CouplingScheme) -> Result<StepOutcome, CouplingSchemeError>;
}

/// Time/window/iteration/action state shared by every concrete coupling
/// scheme.
pub struct CouplingScheme {
    time: f64,
    time_window: u64,
    computed_part: f64,
    time_window_size: TimeWindowSize,
    resolved_window_size: Option<f64>,
    iterations: u32,
    total_iterations: u64,
    max_iterations: Option<u32>,
    max_time: Bound<f64>,
    max_time_windows: Bound<u64>,
    is_initialized: bool,
    is_time_window_complete: bool,
    has_data_been_exchanged: bool,
    actions: HashSet<ActionKind>,
    extrapolation_order: u8,
    fields: BTreeMap<DataId, CouplingData>,
    participant: String,
    iteration_log: Option<IterationLog>,
    convergence_log: Option<ConvergenceLog>,
    residual_accumulator: BTreeMap<DataId, (f64, u32)>,
}

impl CouplingScheme {
    /// Build from a validated configuration record. Registration of data
    /// items happens separately via [`Self::add_data_to_send`] /
    /// [`Self::add_data_to_receive`].
    pub fn new(config: &CouplingConfig, participant: &str) -> Result<Self, CouplingSchemeError> {
        config.validate().map_err(|source| CouplingSchemeError::Config {
            source,
            context: ErrorContext::default(),
        })?;
        Ok(Self {
            time: 0.0,
            time_window: 1,
            computed_part: 0.0,
            time_window_size: config.time_window_size,
            resolved_window_size: match config.time_window_size {
                TimeWindowSize::Fixed(w) => Some(w),
                TimeWindowSize::FirstParticipant => None,
            },
            iterations: 0,
            total_iterations: 0,
            max_iterations: config.max_iterations,
            max_time: config.max_time,
            max_time_windows: config.max_time_windows,
            is_initialized: false,
            is_time_window_complete: false,
            has_data_been_exchanged: false,
            actions: HashSet::new(),
            extrapolation_order: config.extrapolation_order,
            fields: BTreeMap::new(),
            participant: participant.to_string(),
            iteration_log: None,
            convergence_log: None,
            residual_accumulator: BTreeMap::new(),
        })
    }

    /// Attach the text logs this participant's iterations and per-iteration
    /// residuals are recorded to. Optional: a scheme with no logs attached
    /// still runs, it just doesn't persist anything.
    pub fn attach_logs(&mut self, iteration_log: IterationLog, convergence_log: ConvergenceLog) {
        self.iteration_log = Some(iteration_log);
        self.convergence_log = Some(convergence_log);
    }

    /// Record this iteration's per-data residual norms: appended to the
    /// convergence log immediately, and accumulated for the average
    /// convergence rate the iteration log reports once the window closes.
    /// Concrete schemes call this once per implicit iteration, after
    /// evaluating their convergence measures.
    pub fn record_residual_norms(&mut self, residual_norms: Vec<(DataId, f64)>) -> Result<(), CouplingSchemeError> {
        for (data_id, norm) in &residual_norms {
            let entry = self.residual_accumulator.entry(*data_id).or_insert((0.0, 0));
            entry.0 += norm;
            entry.1 += 1;
        }
        if let Some(log) = self.convergence_log.as_mut() {
            log.log_iteration(&ConvergenceRow {
                time_window: self.time_window,
                iteration: self.iterations + 1,
                residual_norms,
            })
            .map_err(|source| CouplingSchemeError::IterationLog { source, context: self.context() })?;
        }
        Ok(())
    }

    /// Register a field this participant sends.
    pub fn add_data_to_send(&mut self, data_id: DataId, values: crate::coupling_data::SharedVector, requires_initialization: bool) {
        self.register(data_id, values, requires_initialization, true);
    }

    /// Register a field this participant receives.
    pub fn add_data_to_receive(&mut self, data_id: DataId, values: crate::coupling_data::SharedVector, requires_initialization: bool) {
        self.register(data_id, values, requires_initialization, false);
    }

    fn register(&mut self, data_id: DataId, values: crate::coupling_data::SharedVector, requires_initialization: bool, is_send: bool) {
        let data = CouplingData::new(values, self.extrapolation_order, requires_initialization, false);
        if requires_initialization && is_send {
            self.actions.insert(ActionKind::WriteInitialData);
        }
        self.fields.insert(data_id, data);
    }

    /// Begin the run at `start_time`/`start_window`.
    pub fn initialize(&mut self, start_time: f64, start_window: u64) {
        self.time = start_time;
        self.time_window = start_window;
        self.is_initialized = true;
        self.actions.insert(ActionKind::WriteIterationCheckpoint);
    }

    /// `true` while a fixed-point unknown action token is still pending.
    pub fn is_action_required(&self, action: ActionKind) -> bool {
        self.actions.contains(&action)
    }

    /// Clear a fulfilled action.
    pub fn mark_action_fulfilled(&mut self, action: ActionKind) {
        self.actions.remove(&action);
    }

    /// `(time < maxTime or undefined) AND (timeWindow <= maxTimeWindows or undefined)`.
    pub fn is_coupling_ongoing(&self) -> bool {
        self.max_time.allows(&self.time) && self.max_time_windows.allows(&self.time_window)
    }

    /// Current simulation time.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Current (1-based) time window index.
    pub fn time_windows(&self) -> u64 {
        self.time_window
    }

    /// The resolved window size, if known yet (`FirstParticipant` is
    /// unresolved until the first `advance` call supplies a `dt`).
    pub fn time_window_size(&self) -> Option<f64> {
        self.resolved_window_size
    }

    /// Remaining time within the current window.
    pub fn this_time_window_remainder(&self) -> Option<f64> {
        self.resolved_window_size.map(|w| (w - self.computed_part).max(0.0))
    }

    /// The largest `dt` the solver may still take this window without
    /// overshooting.
    pub fn next_timestep_max_length(&self) -> Option<f64> {
        self.this_time_window_remainder()
    }

    /// `true` once an accepted window has just completed.
    pub fn is_time_window_complete(&self) -> bool {
        self.is_time_window_complete
    }

    /// `true` once data has been exchanged this `advance` call.
    pub fn has_data_been_exchanged(&self) -> bool {
        self.has_data_been_exchanged
    }

    /// Current iteration count within the (open) time window.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Registered field, if any.
    pub fn field(&self, data_id: DataId) -> Option<&CouplingData> {
        self.fields.get(&data_id)
    }

    /// Registered field, mutable.
    pub fn field_mut(&mut self, data_id: DataId) -> Option<&mut CouplingData> {
        self.fields.get_mut(&data_id)
    }

    /// Ids of every registered field, in registration order.
    pub fn data_ids(&self) -> impl Iterator<Item = DataId> + '_ {
        self.fields.keys().copied()
    }

    /// Drive one `advance(dt)` call through the common sequence: assert
    /// preconditions, sub-step accumulate, or run the variant-specific
    /// exchange at a window boundary and accept/roll back.
    pub fn advance<S: ExchangeStep>(&mut self, dt: f64, step: &mut S) -> Result<(), CouplingSchemeError> {
        if !self.is_initialized || !self.is_coupling_ongoing() {
            return Err(CouplingSchemeError::NotAdvanceable { context: self.context() });
        }
        const PRIORITY: [ActionKind; 3] = [
            ActionKind::WriteInitialData,
            ActionKind::ReadIterationCheckpoint,
            ActionKind::WriteIterationCheckpoint,
        ];
        if let Some(&action) = PRIORITY.iter().find(|a| self.actions.contains(a)) {
            return Err(CouplingSchemeError::MissingAction { action, context: self.context() });
        }

        self.has_data_been_exchanged = false;
        self.is_time_window_complete = false;

        if self.resolved_window_size.is_none() {
            self.resolved_window_size = Some(dt);
        }
        let window_size = self.resolved_window_size.unwrap();

        if self.computed_part + dt < window_size - 1e-12 {
            self.computed_part += dt;
            return Ok(());
        }

        let elapsed = self.computed_part + dt;
        self.time += elapsed;
        self.time_window += 1;

        for data in self.fields.values_mut() {
            data.store_iteration();
        }

        let outcome = step.step(self)?;
        self.has_data_been_exchanged = true;
        self.total_iterations += 1;

        let forced = self.max_iterations.map(|m| self.iterations + 1 >= m).unwrap_or(false);
        if outcome.converged || forced {
            if self.iteration_log.is_some() {
                let avg_conv_rate: Vec<(DataId, f64)> = self
                    .residual_accumulator
                    .iter()
                    .map(|(id, (sum, count))| (*id, sum / f64::from(*count)))
                    .collect();
                let row = IterationRow {
                    time_window: self.time_window,
                    total_iterations: self.total_iterations,
                    iterations: self.iterations + 1,
                    convergence: outcome.converged,
                    avg_conv_rate,
                    deleted_columns: outcome.deleted_columns,
                };
                self.iteration_log
                    .as_mut()
                    .unwrap()
                    .log_window(&row)
                    .map_err(|source| CouplingSchemeError::IterationLog { source, context: self.context() })?;
            }
            self.residual_accumulator.clear();
            self.shift_extrapolation();
            self.iterations = 0;
            self.actions.insert(ActionKind::WriteIterationCheckpoint);
            self.is_time_window_complete = true;
        } else {
            self.time -= elapsed;
            self.time_window -= 1;
            self.actions.insert(ActionKind::ReadIterationCheckpoint);
            self.iterations += 1;
        }

        self.computed_part = 0.0;
        Ok(())
    }

    /// Predict the next window's first-iteration value from the prior
    /// accepted windows: order 1 uses `2x^t - x^{t-1}`; order 2 uses
    /// `2.5x^t - 2x^{t-1} + 0.5x^{t-2}`.
    pub fn predict_extrapolation(&mut self) {
        if self.extrapolation_order == 0 {
            return;
        }
        for data in self.fields.values_mut() {
            let history = data.old_values();
            let predicted = match self.extrapolation_order {
                1 if history.len() >= 2 => Some(&history[0] * 2.0 - &history[1]),
                2 if history.len() >= 3 => {
                    Some(&history[0] * 2.5 - &history[1] * 2.0 + &history[2] * 0.5)
                }
                _ => None,
            };
            if let Some(predicted) = predicted {
                *data.values_mut() = predicted;
            }
        }
    }

    /// Shift every registered field's extrapolation history by one column.
    /// Every field is shifted unconditionally; there is no early `break`
    /// that would leave later fields' history stale.
    fn shift_extrapolation(&mut self) {
        for data in self.fields.values_mut() {
            let accepted = data.values().clone();
            data.shift_old_values(accepted).expect("accepted value always matches the field's own column width");
        }
        self.predict_extrapolation();
    }

    fn context(&self) -> ErrorContext {
        ErrorContext {
            time_window: Some(self.time_window),
            iteration: Some(self.iterations),
            participant: Some(self.participant.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchemeKind;
    use crate::Vector;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn base_config() -> CouplingConfig {
        CouplingConfig {
            kind: SchemeKind::SerialExplicit,
            max_time: Bound::Undefined,
            max_time_windows: Bound::Value(10),
            time_window_size: TimeWindowSize::Fixed(1.0),
            valid_digits: 10,
            max_iterations: None,
            extrapolation_order: 2,
            participants: vec!["A".into(), "B".into()],
            data: vec![],
            convergence_measures: vec![],
            acceleration: None,
        }
    }

    struct AlwaysConverges;
    impl ExchangeStep for AlwaysConverges {
        fn step(&mut self, _scheme: &mut CouplingScheme) -> Result<StepOutcome, CouplingSchemeError> {
            Ok(StepOutcome { converged: true, deleted_columns: 0 })
        }
    }

    fn shared(x: f64) -> crate::coupling_data::SharedVector {
        Rc::new(RefCell::new(Vector::from_vec(vec![x])))
    }

    #[test]
    fn is_coupling_ongoing_respects_max_time_windows() {
        let cfg = base_config();
        let mut scheme = CouplingScheme::new(&cfg, "A").unwrap();
        scheme.initialize(0.0, 1);
        assert!(scheme.is_coupling_ongoing());
    }

    #[test]
    fn advance_rejects_pending_write_initial_data() {
        let cfg = base_config();
        let mut scheme = CouplingScheme::new(&cfg, "A").unwrap();
        scheme.add_data_to_send(DataId(0), shared(1.0), true);
        scheme.initialize(0.0, 1);
        let mut step = AlwaysConverges;
        let err = scheme.advance(1.0, &mut step).unwrap_err();
        assert!(matches!(err, CouplingSchemeError::MissingAction { action: ActionKind::WriteInitialData, .. }));
    }

    #[test]
    fn sub_step_accumulates_without_exchanging() {
        let cfg = base_config();
        let mut scheme = CouplingScheme::new(&cfg, "A").unwrap();
        scheme.initialize(0.0, 1);
        scheme.mark_action_fulfilled(ActionKind::WriteIterationCheckpoint);
        let mut step = AlwaysConverges;
        scheme.advance(0.4, &mut step).unwrap();
        assert!(!scheme.has_data_been_exchanged());
        assert!(!scheme.is_time_window_complete());
    }

    #[test]
    fn shift_extrapolation_updates_every_field_without_early_break() {
        let cfg = base_config();
        let mut scheme = CouplingScheme::new(&cfg, "A").unwrap();
        scheme.add_data_to_send(DataId(0), shared(1.0), false);
        scheme.add_data_to_send(DataId(1), shared(2.0), false);
        scheme.add_data_to_send(DataId(2), shared(3.0), false);
        *scheme.field_mut(DataId(0)).unwrap().values_mut() = Vector::from_vec(vec![10.0]);
        *scheme.field_mut(DataId(1)).unwrap().values_mut() = Vector::from_vec(vec![20.0]);
        *scheme.field_mut(DataId(2)).unwrap().values_mut() = Vector::from_vec(vec![30.0]);
        scheme.shift_extrapolation();
        assert_eq!(scheme.field(DataId(0)).unwrap().old_values()[0][0], 10.0);
        assert_eq!(scheme.field(DataId(1)).unwrap().old_values()[0][0], 20.0);
        assert_eq!(scheme.field(DataId(2)).unwrap().old_values()[0][0], 30.0);
    }

    #[test]
    fn extrapolation_order_two_matches_formula() {
        let mut cfg = base_config();
        cfg.extrapolation_order = 2;
        let mut scheme = CouplingScheme::new(&cfg, "A").unwrap();
        scheme.add_data_to_send(DataId(0), shared(1.0), false);
        // old_values starts as [1,1,1]; accept 2.0, then 4.0, matching the
        // column history (t=1, t-1=2, t-2=4) before predicting.
        scheme.field_mut(DataId(0)).unwrap().shift_old_values(Vector::from_vec(vec![2.0])).unwrap();
        scheme.field_mut(DataId(0)).unwrap().shift_old_values(Vector::from_vec(vec![4.0])).unwrap();
        scheme.predict_extrapolation();
        let predicted = scheme.field(DataId(0)).unwrap().values()[0];
        assert!((predicted - (2.5 * 4.0 - 2.0 * 2.0 + 0.5 * 1.0)).abs() < 1e-12);
    }
}
