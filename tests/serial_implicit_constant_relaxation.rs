//! End-to-end serial-implicit coupling: a real `CouplingScheme` driven
//! through several accept/roll-back iterations by `SerialScheme`, with
//! constant relaxation accelerating the second participant toward a target
//! value supplied by a peer running on its own thread over a real
//! `InProcessChannel`.

use coupling_core::acceleration::ConstantRelaxation;
use coupling_core::config::{Bound, ConvergenceMeasureConfig, ConvergenceMeasureKind, CouplingConfig, SchemeKind, TimeWindowSize};
use coupling_core::convergence::{ConvergenceMeasure, LocalNormReducer};
use coupling_core::coupling_scheme::{ActionKind, CouplingScheme};
use coupling_core::m2n::InProcessChannel;
use coupling_core::serial_scheme::{Channel, ParticipantRole, SerialScheme};
use coupling_core::{DataId, MeshId, Vector};
use std::cell::RefCell;
use std::rc::Rc;

const TARGET: f64 = 10.0;
const LIMIT: f64 = 1e-3;

fn implicit_config() -> CouplingConfig {
    CouplingConfig {
        kind: SchemeKind::SerialImplicit,
        max_time: Bound::Undefined,
        max_time_windows: Bound::Value(1),
        time_window_size: TimeWindowSize::Fixed(1.0),
        valid_digits: 10,
        max_iterations: Some(30),
        extrapolation_order: 0,
        participants: vec!["first".into(), "second".into()],
        data: vec![],
        convergence_measures: vec![ConvergenceMeasureConfig {
            data_id: DataId(0),
            suffices: true,
            kind: ConvergenceMeasureKind::Absolute { limit: LIMIT },
        }],
        acceleration: None,
    }
}

#[test]
fn constant_relaxation_converges_to_peers_target_within_one_window() {
    let cfg = implicit_config();
    let (second_transport, mut first_peer) = InProcessChannel::pair();

    let peer = std::thread::spawn(move || {
        let mut rounds = 0;
        loop {
            first_peer.send_block(MeshId(0), 1, &Vector::from_vec(vec![TARGET])).unwrap();
            first_peer.receive_block(MeshId(0), 1, 1).unwrap();
            rounds += 1;
            if first_peer.receive_bool().unwrap() {
                break;
            }
        }
        rounds
    });

    let mut scheme = CouplingScheme::new(&cfg, "second").unwrap();
    scheme.add_data_to_receive(DataId(0), Rc::new(RefCell::new(Vector::from_vec(vec![0.0]))), false);
    scheme.add_data_to_send(DataId(1), Rc::new(RefCell::new(Vector::from_vec(vec![0.0]))), false);
    scheme.initialize(0.0, 1);
    scheme.mark_action_fulfilled(ActionKind::WriteIterationCheckpoint);

    let measure = ConvergenceMeasure::absolute(LIMIT).unwrap();
    let mut step = SerialScheme::new(
        ParticipantRole::Second,
        second_transport,
        vec![Channel { data_id: DataId(1), mesh_id: MeshId(0), dimension: 1 }],
        vec![Channel { data_id: DataId(0), mesh_id: MeshId(0), dimension: 1 }],
        vec![(DataId(0), true, measure)],
        Some(Box::new(ConstantRelaxation::new(0.5))),
        None,
        Box::new(LocalNormReducer),
    );

    loop {
        scheme.advance(1.0, &mut step).unwrap();
        if scheme.is_time_window_complete() {
            break;
        }
        scheme.mark_action_fulfilled(ActionKind::ReadIterationCheckpoint);
    }

    let rounds = peer.join().unwrap();
    assert!(rounds > 1, "expected more than one iteration before convergence, got {rounds}");
    assert!(rounds < 30, "relaxation should converge well within maxIterations, took {rounds}");
    assert!((scheme.field(DataId(0)).unwrap().values()[0] - TARGET).abs() < LIMIT);
    assert_eq!(scheme.time_windows(), 2);
}
