//! Multi (controller/followers) concrete coupling scheme: one controller
//! participant exchanges with each of N followers in a fixed order within
//! a window, then gathers each follower's local convergence signal,
//! aggregates them, and broadcasts the aggregate back to every follower.

use crate::acceleration::{AccelerationError, Accelerator, StackedLayout};
use crate::convergence::{ConvergenceMeasure, NormReducer};
use crate::coupling_scheme::{CouplingScheme, CouplingSchemeError, ExchangeStep, StepOutcome};
use crate::m2n::M2N;
use crate::preconditioner::{Preconditioner, PreconditionerVariant};
use crate::{DataId, ErrorContext, MeshId, Vector};

/// One registered data channel.
#[derive(Debug, Clone, Copy)]
pub struct Channel {
    /// The field id.
    pub data_id: DataId,
    /// The mesh it lives on.
    pub mesh_id: MeshId,
    /// Per-vertex dimensionality.
    pub dimension: u8,
}

/// A controller's connection to one follower: its transport and the
/// channels exchanged with it.
pub struct FollowerLink<M: M2N> {
    /// Transport to this follower.
    pub transport: M,
    /// Data the controller sends this follower.
    pub send: Vec<Channel>,
    /// Data the controller receives from this follower.
    pub receive: Vec<Channel>,
}

/// Which side of the controller/follower topology this process plays.
pub enum MultiRole<M: M2N> {
    /// Exchanges with every follower in a fixed order, then aggregates
    /// convergence.
    Controller {
        /// Followers, visited in this fixed order every window.
        followers: Vec<FollowerLink<M>>,
    },
    /// Exchanges once with the controller.
    Follower {
        /// Transport to the controller.
        transport: M,
        /// Data this follower sends the controller.
        send: Vec<Channel>,
        /// Data this follower receives from the controller.
        receive: Vec<Channel>,
    },
}

/// The multi (controller/followers) driver.
pub struct MultiScheme<M: M2N> {
    role: MultiRole<M>,
    measures: Vec<(DataId, bool, ConvergenceMeasure)>,
    accelerator: Option<Box<dyn Accelerator>>,
    preconditioner: Option<Preconditioner>,
    reducer: Box<dyn NormReducer>,
    initialized_acceleration: bool,
}

impl<M: M2N> MultiScheme<M> {
    /// Build a multi scheme driver. `measures` is empty and `accelerator`
    /// is `None` for an explicit scheme.
    pub fn new(
        role: MultiRole<M>,
        measures: Vec<(DataId, bool, ConvergenceMeasure)>,
        accelerator: Option<Box<dyn Accelerator>>,
        preconditioner: Option<Preconditioner>,
        reducer: Box<dyn NormReducer>,
    ) -> Self {
        Self {
            role,
            measures,
            accelerator,
            preconditioner,
            reducer,
            initialized_acceleration: false,
        }
    }

    fn send_all(transport: &mut M, channels: &[Channel], scheme: &CouplingScheme, ctx: &ErrorContext) -> Result<(), CouplingSchemeError> {
        for ch in channels {
            let field = scheme.field(ch.data_id).ok_or(CouplingSchemeError::UnknownData(ch.data_id))?;
            let values = field.values().clone();
            transport
                .send_block(ch.mesh_id, ch.dimension, &values)
                .map_err(|source| CouplingSchemeError::Transport { source, context: ctx.clone() })?;
        }
        Ok(())
    }

    fn receive_all(transport: &mut M, channels: &[Channel], scheme: &mut CouplingScheme, ctx: &ErrorContext) -> Result<(), CouplingSchemeError> {
        for ch in channels {
            let expected_len = scheme
                .field(ch.data_id)
                .ok_or(CouplingSchemeError::UnknownData(ch.data_id))?
                .values()
                .len();
            let received = transport
                .receive_block(ch.mesh_id, ch.dimension, expected_len)
                .map_err(|source| CouplingSchemeError::Transport { source, context: ctx.clone() })?;
            *scheme.field_mut(ch.data_id).unwrap().values_mut() = received;
        }
        Ok(())
    }

    fn evaluate_local_measures(&mut self, scheme: &mut CouplingScheme) -> Result<bool, CouplingSchemeError> {
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
        Ok(early_converged.unwrap_or(converged))
    }

    fn reset_measures(&mut self) {
        for (_, _, measure) in self.measures.iter_mut() {
            measure.reset();
        }
    }
}

impl<M: M2N> ExchangeStep for MultiScheme<M> {
    fn step(&mut self, scheme: &mut CouplingScheme) -> Result<StepOutcome, CouplingSchemeError> {
        let ctx = ErrorContext {
            time_window: Some(scheme.time_windows()),
            iteration: Some(scheme.iterations()),
            participant: None,
        };
        let is_implicit = !self.measures.is_empty();

        match &mut self.role {
            MultiRole::Controller { followers } => {
                for link in followers.iter_mut() {
                    Self::send_all(&mut link.transport, &link.send, scheme, &ctx)?;
                    Self::receive_all(&mut link.transport, &link.receive, scheme, &ctx)?;
                }

                if !is_implicit {
                    return Ok(StepOutcome { converged: true, deleted_columns: 0 });
                }

                let mut deleted_columns = 0;
                if let Some(accelerator) = self.accelerator.as_mut() {
                    let all_receive: Vec<Channel> = followers.iter().flat_map(|l| l.receive.iter().copied()).collect();
                    let sizes: Vec<usize> =
                        all_receive.iter().map(|ch| scheme.field(ch.data_id).unwrap().values().len()).collect();
                    let preconditioner = self
                        .preconditioner
                        .get_or_insert_with(|| Preconditioner::new(PreconditionerVariant::Constant, sizes.clone(), None));
                    if !self.initialized_acceleration {
                        accelerator.initialize(&StackedLayout::new(sizes));
                        self.initialized_acceleration = true;
                    }

                    let mut previous = Vec::new();
                    let mut residual = Vec::new();
                    for ch in &all_receive {
                        let field = scheme.field(ch.data_id).unwrap();
                        let current = field.values();
                        let prev = field.previous_iteration();
                        previous.extend(prev.iter().copied());
                        residual.extend(current.iter().zip(prev.iter()).map(|(c, p)| c - p));
                    }
                    let x = Vector::from_vec(previous);
                    let r = Vector::from_vec(residual);
                    let next = accelerator
                        .perform_acceleration(&x, &r, preconditioner)
                        .map_err(|source: AccelerationError| CouplingSchemeError::Acceleration { source, context: ctx.clone() })?;

                    let mut offset = 0;
                    for ch in &all_receive {
                        let field = scheme.field_mut(ch.data_id).unwrap();
                        let len = field.values().len();
                        *field.values_mut() = Vector::from_iterator(len, next.rows(offset, len).iter().copied());
                        offset += len;
                    }
                    deleted_columns = accelerator.deleted_columns();
                }

                let local_converged = self.evaluate_local_measures(scheme)?;

                let mut aggregate = local_converged;
                for link in followers.iter_mut() {
                    let follower_converged = link
                        .transport
                        .receive_bool()
                        .map_err(|source| CouplingSchemeError::Transport { source, context: ctx.clone() })?;
                    aggregate &= follower_converged;
                }
                for link in followers.iter_mut() {
                    link.transport
                        .send_bool(aggregate)
                        .map_err(|source| CouplingSchemeError::Transport { source, context: ctx.clone() })?;
                }

                if aggregate {
                    if let Some(accelerator) = self.accelerator.as_mut() {
                        accelerator.on_time_window_complete();
                    }
                    self.reset_measures();
                }
                Ok(StepOutcome { converged: aggregate, deleted_columns })
            }
            MultiRole::Follower { transport, send, receive } => {
                Self::send_all(transport, send, scheme, &ctx)?;
                Self::receive_all(transport, receive, scheme, &ctx)?;

                if !is_implicit {
                    return Ok(StepOutcome { converged: true, deleted_columns: 0 });
                }

                let local_converged = self.evaluate_local_measures(scheme)?;
                transport
                    .send_bool(local_converged)
                    .map_err(|source| CouplingSchemeError::Transport { source, context: ctx.clone() })?;
                let aggregate = transport
                    .receive_bool()
                    .map_err(|source| CouplingSchemeError::Transport { source, context: ctx.clone() })?;

                if aggregate {
                    self.reset_measures();
                }
                Ok(StepOutcome { converged: aggregate, deleted_columns: 0 })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Bound, CouplingConfig, SchemeKind, TimeWindowSize};
    use crate::convergence::LocalNormReducer;
    use crate::coupling_scheme::ActionKind;
    use crate::m2n::InProcessChannel;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn explicit_config() -> CouplingConfig {
        CouplingConfig {
            kind: SchemeKind::Multi,
            max_time: Bound::Undefined,
            max_time_windows: Bound::Value(5),
            time_window_size: TimeWindowSize::Fixed(1.0),
            valid_digits: 10,
            max_iterations: None,
            extrapolation_order: 0,
            participants: vec!["controller".into(), "follower-1".into()],
            data: vec![],
            convergence_measures: vec![],
            acceleration: None,
        }
    }

    #[test]
    fn explicit_controller_follower_round_trip() {
        let cfg = explicit_config();
        let (controller_transport, mut follower_peer) = InProcessChannel::pair();

        let peer = std::thread::spawn(move || {
            follower_peer.send_block(MeshId(0), 1, &Vector::from_vec(vec![7.0])).unwrap();
            follower_peer.receive_block(MeshId(0), 1, 1).unwrap()[0]
        });

        let mut scheme = CouplingScheme::new(&cfg, "controller").unwrap();
        scheme.add_data_to_receive(DataId(0), Rc::new(RefCell::new(Vector::from_vec(vec![0.0]))), false);
        scheme.add_data_to_send(DataId(1), Rc::new(RefCell::new(Vector::from_vec(vec![3.0]))), false);
        scheme.initialize(0.0, 1);
        scheme.mark_action_fulfilled(ActionKind::WriteIterationCheckpoint);

        let mut step = MultiScheme::new(
            MultiRole::Controller {
                followers: vec![FollowerLink {
                    transport: controller_transport,
                    send: vec![Channel { data_id: DataId(1), mesh_id: MeshId(0), dimension: 1 }],
                    receive: vec![Channel { data_id: DataId(0), mesh_id: MeshId(0), dimension: 1 }],
                }],
            },
            vec![],
            None,
            None,
            Box::new(LocalNormReducer),
        );

        scheme.advance(1.0, &mut step).unwrap();

        assert_eq!(scheme.field(DataId(0)).unwrap().values()[0], 7.0);
        assert_eq!(peer.join().unwrap(), 3.0);
    }
}
