//! Serial (first/second participant) concrete coupling scheme: a
//! round-trip exchange per window, with acceleration (if configured)
//! running on the second participant over the data it has just received
//! (the round trip's actual fixed-point unknown), not over the data it
//! computes and sends back.

use crate::acceleration::{AccelerationError, Accelerator, StackedLayout};
use crate::convergence::{ConvergenceMeasure, NormReducer};
use crate::coupling_scheme::{CouplingScheme, CouplingSchemeError, ExchangeStep, StepOutcome};
use crate::m2n::M2N;
use crate::preconditioner::Preconditioner;
use crate::{DataId, ErrorContext, MeshId, Vector};

/// Which side of the round-trip this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantRole {
    /// Sends first, receives last.
    First,
    /// Receives first, (optionally accelerates,) sends, and reports
    /// convergence.
    Second,
}

/// One registered data channel: its id, mesh, and per-vertex dimension.
#[derive(Debug, Clone, Copy)]
pub struct Channel {
    /// The field id.
    pub data_id: DataId,
    /// The mesh it lives on.
    pub mesh_id: MeshId,
    /// Per-vertex dimensionality.
    pub dimension: u8,
}

/// The serial (first/second participant) driver. Sub-cycling is permitted
/// on both sides independently; data is only exchanged at window
/// boundaries, which is exactly when [`ExchangeStep::step`] is invoked by
/// [`CouplingScheme::advance`].
pub struct SerialScheme<M: M2N> {
    role: ParticipantRole,
    transport: M,
    send: Vec<Channel>,
    receive: Vec<Channel>,
    measures: Vec<(DataId, bool, ConvergenceMeasure)>,
    accelerator: Option<Box<dyn Accelerator>>,
    preconditioner: Option<Preconditioner>,
    reducer: Box<dyn NormReducer>,
    initialized_acceleration: bool,
}

impl<M: M2N> SerialScheme<M> {
    /// Build a serial scheme driver. `measures` is empty and `accelerator`
    /// is `None` for an explicit scheme.
    pub fn new(
        role: ParticipantRole,
        transport: M,
        send: Vec<Channel>,
        receive: Vec<Channel>,
        measures: Vec<(DataId, bool, ConvergenceMeasure)>,
        accelerator: Option<Box<dyn Accelerator>>,
        preconditioner: Option<Preconditioner>,
        reducer: Box<dyn NormReducer>,
    ) -> Self {
        Self {
            role,
            transport,
            send,
            receive,
            measures,
            accelerator,
            preconditioner,
            reducer,
            initialized_acceleration: false,
        }
    }

    fn send_all(&mut self, scheme: &CouplingScheme, ctx: &ErrorContext) -> Result<(), CouplingSchemeError> {
        for ch in self.send.clone() {
            let field = scheme.field(ch.data_id).ok_or(CouplingSchemeError::UnknownData(ch.data_id))?;
            let values = field.values().clone();
            self.transport
                .send_block(ch.mesh_id, ch.dimension, &values)
                .map_err(|source| CouplingSchemeError::Transport { source, context: ctx.clone() })?;
        }
        Ok(())
    }

    fn receive_all(&mut self, scheme: &mut CouplingScheme, ctx: &ErrorContext) -> Result<(), CouplingSchemeError> {
        for ch in self.receive.clone() {
            let expected_len = scheme
                .field(ch.data_id)
                .ok_or(CouplingSchemeError::UnknownData(ch.data_id))?
                .values()
                .len();
            let received = self
                .transport
                .receive_block(ch.mesh_id, ch.dimension, expected_len)
                .map_err(|source| CouplingSchemeError::Transport { source, context: ctx.clone() })?;
            *scheme.field_mut(ch.data_id).unwrap().values_mut() = received;
        }
        Ok(())
    }

    fn stacked_receive_previous(&self, scheme: &CouplingScheme) -> Vector {
        let mut out = Vec::new();
        for ch in &self.receive {
            out.extend(scheme.field(ch.data_id).unwrap().previous_iteration().iter().copied());
        }
        Vector::from_vec(out)
    }

    fn stacked_receive_residual(&self, scheme: &CouplingScheme) -> Vector {
        let mut out = Vec::new();
        for ch in &self.receive {
            let field = scheme.field(ch.data_id).unwrap();
            let current = field.values();
            let previous = field.previous_iteration();
            out.extend(current.iter().zip(previous.iter()).map(|(c, p)| c - p));
        }
        Vector::from_vec(out)
    }

    fn scatter_into_receive_fields(&self, scheme: &mut CouplingScheme, stacked: &Vector) {
        let mut offset = 0;
        for ch in &self.receive {
            let field = scheme.field_mut(ch.data_id).unwrap();
            let len = field.values().len();
            *field.values_mut() = Vector::from_iterator(len, stacked.rows(offset, len).iter().copied());
            offset += len;
        }
    }
}

impl<M: M2N> ExchangeStep for SerialScheme<M> {
    fn step(&mut self, scheme: &mut CouplingScheme) -> Result<StepOutcome, CouplingSchemeError> {
        let ctx = ErrorContext {
            time_window: Some(scheme.time_windows()),
            iteration: Some(scheme.iterations()),
            participant: None,
        };

        let is_implicit = !self.measures.is_empty();

        match self.role {
            ParticipantRole::First => {
                self.send_all(scheme, &ctx)?;
                self.receive_all(scheme, &ctx)?;
                let converged = if is_implicit {
                    self.transport
                        .receive_bool()
                        .map_err(|source| CouplingSchemeError::Transport { source, context: ctx.clone() })?
                } else {
                    true
                };
                Ok(StepOutcome { converged, deleted_columns: 0 })
            }
            ParticipantRole::Second => {
                self.receive_all(scheme, &ctx)?;

                let mut deleted_columns = 0;
                if is_implicit {
                    if let Some(accelerator) = self.accelerator.as_mut() {
                        let sizes: Vec<usize> =
                            self.receive.iter().map(|ch| scheme.field(ch.data_id).unwrap().values().len()).collect();
                        let preconditioner =
                            self.preconditioner.get_or_insert_with(|| Preconditioner::new(
                                crate::preconditioner::PreconditionerVariant::Constant,
                                sizes.clone(),
                                None,
                            ));
                        if !self.initialized_acceleration {
                            accelerator.initialize(&StackedLayout::new(sizes));
                            self.initialized_acceleration = true;
                        }
                        let x = self.stacked_receive_previous(scheme);
                        let r = self.stacked_receive_residual(scheme);
                        let next = accelerator.perform_acceleration(&x, &r, preconditioner).map_err(
                            |source: AccelerationError| CouplingSchemeError::Acceleration { source, context: ctx.clone() },
                        )?;
                        self.scatter_into_receive_fields(scheme, &next);
                        deleted_columns = accelerator.deleted_columns();
                    }

                    let mut converged = true;
                    let mut residual_norms = Vec::with_capacity(self.measures.len());
                    let mut early_converged = None;
                    for (data_id, suffices, measure) in self.measures.iter_mut() {
                        let field = scheme.field(*data_id).ok_or(CouplingSchemeError::UnknownData(*data_id))?;
                        let old = field.previous_iteration().clone();
                        let new = field.values().clone();
                        let this_converged = measure.measure(&old, &new, self.reducer.as_ref());
                        residual_norms.push((*data_id, measure.residual_norm()));
                        if *suffices && this_converged && early_converged.is_none() {
                            early_converged = Some(true);
                        }
                        converged &= this_converged;
                    }
                    scheme.record_residual_norms(residual_norms)?;
                    let converged = early_converged.unwrap_or(converged);

                    self.send_all(scheme, &ctx)?;
                    self.transport
                        .send_bool(converged)
                        .map_err(|source| CouplingSchemeError::Transport { source, context: ctx.clone() })?;
                    if converged {
                        if let Some(accelerator) = self.accelerator.as_mut() {
                            accelerator.on_time_window_complete();
                        }
                        for (_, _, measure) in self.measures.iter_mut() {
                            measure.reset();
                        }
                    }
                    Ok(StepOutcome { converged, deleted_columns })
                } else {
                    self.send_all(scheme, &ctx)?;
                    Ok(StepOutcome { converged: true, deleted_columns: 0 })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Bound, CouplingConfig, SchemeKind, TimeWindowSize};
    use crate::convergence::LocalNormReducer;
    use crate::m2n::InProcessChannel;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn explicit_config() -> CouplingConfig {
        CouplingConfig {
            kind: SchemeKind::SerialExplicit,
            max_time: Bound::Undefined,
            max_time_windows: Bound::Value(5),
            time_window_size: TimeWindowSize::Fixed(1.0),
            valid_digits: 10,
            max_iterations: None,
            extrapolation_order: 0,
            participants: vec!["A".into(), "B".into()],
            data: vec![],
            convergence_measures: vec![],
            acceleration: None,
        }
    }

    #[test]
    fn explicit_round_trip_exchanges_scalar_value() {
        // `CouplingScheme` holds `Rc<RefCell<Vector>>` field handles, so it
        // is not `Send`; only the raw transport end crosses the thread
        // boundary here, playing the first participant's role directly
        // against the channel rather than through a second scheme.
        let cfg = explicit_config();
        let (scheme_transport, mut peer_transport) = InProcessChannel::pair();

        let peer = std::thread::spawn(move || {
            peer_transport.send_block(MeshId(0), 1, &Vector::from_vec(vec![1.0])).unwrap();
            peer_transport.receive_block(MeshId(0), 1, 1).unwrap()[0]
        });

        let mut scheme = CouplingScheme::new(&cfg, "B").unwrap();
        scheme.add_data_to_receive(DataId(0), Rc::new(RefCell::new(Vector::from_vec(vec![0.0]))), false);
        scheme.add_data_to_send(DataId(1), Rc::new(RefCell::new(Vector::from_vec(vec![5.0]))), false);
        scheme.initialize(0.0, 1);
        scheme.mark_action_fulfilled(crate::coupling_scheme::ActionKind::WriteIterationCheckpoint);

        let mut step = SerialScheme::new(
            ParticipantRole::Second,
            scheme_transport,
            vec![Channel { data_id: DataId(1), mesh_id: MeshId(0), dimension: 1 }],
            vec![Channel { data_id: DataId(0), mesh_id: MeshId(0), dimension: 1 }],
            vec![],
            None,
            None,
            Box::new(LocalNormReducer),
        );

        scheme.advance(1.0, &mut step).unwrap();

        assert_eq!(scheme.field(DataId(0)).unwrap().values()[0], 1.0);
        assert_eq!(peer.join().unwrap(), 5.0);
    }
}
