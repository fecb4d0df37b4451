//! End-to-end nonlinear fixed-point convergence through the full
//! `CouplingScheme` state machine: a custom `ExchangeStep` plays both the
//! "external solver" (evaluating a contracting map) and the acceleration
//! side, so the test exercises `coupling_data`, `quasi_newton`,
//! `preconditioner`, and `convergence` together the way a concrete scheme
//! would, without needing a second thread or transport.

use coupling_core::acceleration::{AccelerationError, Accelerator, StackedLayout};
use coupling_core::config::{
    Bound, ConvergenceMeasureConfig, ConvergenceMeasureKind, CouplingConfig, SchemeKind, TimeWindowSize,
};
use coupling_core::convergence::{ConvergenceMeasure, LocalNormReducer, NormReducer};
use coupling_core::coupling_scheme::{CouplingScheme, CouplingSchemeError, ExchangeStep, StepOutcome};
use coupling_core::preconditioner::{Preconditioner, PreconditionerVariant};
use coupling_core::qr::FilterKind;
use coupling_core::quasi_newton::IqnIls;
use coupling_core::{DataId, Matrix, Vector};
use std::cell::RefCell;
use std::rc::Rc;

fn contraction_map(x: &Vector) -> Vector {
    let a = Matrix::from_row_slice(
        4,
        4,
        &[0.2, 0.1, 0.0, 0.0, 0.1, 0.2, 0.1, 0.0, 0.0, 0.1, 0.2, 0.1, 0.0, 0.0, 0.1, 0.2],
    );
    let b = Vector::from_vec(vec![-1.0, 0.0, -1.0, -1.0]);
    &a * x + b
}

struct FixedPointStep {
    accelerator: Box<dyn Accelerator>,
    preconditioner: Preconditioner,
    measure: ConvergenceMeasure,
    reducer: Box<dyn NormReducer>,
    initialized: bool,
}

impl ExchangeStep for FixedPointStep {
    fn step(&mut self, scheme: &mut CouplingScheme) -> Result<StepOutcome, CouplingSchemeError> {
        if !self.initialized {
            self.accelerator.initialize(&StackedLayout::new(vec![4]));
            self.initialized = true;
        }

        let field = scheme.field_mut(DataId(0)).unwrap();
        let x_previous = field.previous_iteration().clone();
        let g_x = contraction_map(&x_previous);
        *field.values_mut() = g_x.clone();

        let r = &g_x - &x_previous;
        let next = self
            .accelerator
            .perform_acceleration(&x_previous, &r, &mut self.preconditioner)
            .map_err(|source: AccelerationError| CouplingSchemeError::Acceleration {
                source,
                context: Default::default(),
            })?;
        *field.values_mut() = next.clone();

        let converged = self.measure.measure(&x_previous, &next, self.reducer.as_ref());
        if converged {
            self.accelerator.on_time_window_complete();
            self.measure.reset();
        }
        Ok(StepOutcome { converged, deleted_columns: self.accelerator.deleted_columns() })
    }
}

fn implicit_config() -> CouplingConfig {
    CouplingConfig {
        kind: SchemeKind::SerialImplicit,
        max_time: Bound::Undefined,
        max_time_windows: Bound::Value(1),
        time_window_size: TimeWindowSize::Fixed(1.0),
        valid_digits: 10,
        max_iterations: Some(25),
        extrapolation_order: 0,
        participants: vec!["A".into(), "B".into()],
        data: vec![],
        convergence_measures: vec![ConvergenceMeasureConfig {
            data_id: DataId(0),
            suffices: true,
            kind: ConvergenceMeasureKind::Absolute { limit: 1e-8 },
        }],
        acceleration: None,
    }
}

#[test]
fn iqn_ils_converges_faster_than_constant_relaxation_through_the_scheme() {
    let cfg = implicit_config();
    let mut scheme = CouplingScheme::new(&cfg, "A").unwrap();
    scheme.add_data_to_send(DataId(0), Rc::new(RefCell::new(Vector::from_vec(vec![0.0, 0.0, 0.0, 0.0]))), false);
    scheme.initialize(0.0, 1);
    scheme.mark_action_fulfilled(coupling_core::coupling_scheme::ActionKind::WriteIterationCheckpoint);

    let mut step = FixedPointStep {
        accelerator: Box::new(IqnIls::new(0.1, FilterKind::NoFilter, 8)),
        preconditioner: Preconditioner::new(PreconditionerVariant::Constant, vec![4], None),
        measure: ConvergenceMeasure::absolute(1e-8).unwrap(),
        reducer: Box::new(LocalNormReducer),
        initialized: false,
    };

    let mut iterations = 0;
    loop {
        scheme.advance(1.0, &mut step).unwrap();
        iterations += 1;
        if scheme.is_time_window_complete() {
            break;
        }
        scheme.mark_action_fulfilled(coupling_core::coupling_scheme::ActionKind::ReadIterationCheckpoint);
        assert!(iterations < 25, "IQN-ILS failed to converge within maxIterations");
    }

    assert!(iterations < 20, "IQN-ILS should beat the 25-iteration cap by a comfortable margin, took {iterations}");
}
