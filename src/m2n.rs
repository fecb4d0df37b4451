//! Typed, ordered block send/receive between participant process groups.
//!
//! The transport connects two participant process groups A and B and
//! provides three typed channels: a scalar bool (convergence signal), a
//! bounded double, and a block of doubles tagged with `(mesh_id,
//! value_dimension)`. Ordering is FIFO per `(mesh_id, data_id)` channel:
//! the k-th send on one side pairs with the k-th receive on the other.
//! This module defines the `M2N` trait the coupling schemes drive, plus an
//! in-process implementation (`InProcessChannel`) pairing two ends with
//! `std::sync::mpsc`, used by this crate's own tests and suitable as a
//! reference for an out-of-process (MPI/sockets) implementation.

use std::sync::mpsc::{self, Receiver, Sender};

use crate::{MeshId, Vector};

/// Errors from an `M2N` exchange.
#[derive(Debug, thiserror::Error)]
pub enum M2NError {
    /// The remote end closed or was never connected.
    #[error("M2N transport failure: {0}")]
    TransportFailure(String),
    /// A received block's length did not match the expected `(mesh, dim)`
    /// size.
    #[error("block size mismatch: expected {expected}, got {got}")]
    SizeMismatch {
        /// Expected length.
        expected: usize,
        /// Actual length received.
        got: usize,
    },
}

/// Typed, ordered send/receive between two participant process groups.
///
/// Implementors must preserve FIFO pairing per `(mesh_id, data_id)` and must
/// not reorder across channels within one `advance`.
pub trait M2N {
    /// Send a scalar boolean (the convergence signal).
    fn send_bool(&mut self, value: bool) -> Result<(), M2NError>;
    /// Receive a scalar boolean.
    fn receive_bool(&mut self) -> Result<bool, M2NError>;
    /// Send a single bounded double.
    fn send_double(&mut self, value: f64) -> Result<(), M2NError>;
    /// Receive a single bounded double.
    fn receive_double(&mut self) -> Result<f64, M2NError>;
    /// Send a block of doubles tagged with `(mesh_id, value_dimension)`.
    fn send_block(&mut self, mesh_id: MeshId, dimension: u8, block: &Vector) -> Result<(), M2NError>;
    /// Receive a block of doubles tagged with `(mesh_id, value_dimension)`,
    /// expected to have length `expected_len`.
    fn receive_block(
        &mut self,
        mesh_id: MeshId,
        dimension: u8,
        expected_len: usize,
    ) -> Result<Vector, M2NError>;
    /// Whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}

/// A message carried over an [`InProcessChannel`]; tags block payloads with
/// their `(mesh_id, dimension)` so paired ends can validate framing.
enum Message {
    Bool(bool),
    Double(f64),
    Block { mesh_id: MeshId, dimension: u8, data: Vec<f64> },
}

/// One end of an in-process, channel-backed [`M2N`] connection, pairing two
/// participants within a single process for tests. FIFO ordering is
/// guaranteed by `std::sync::mpsc`'s own ordering.
pub struct InProcessChannel {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

impl InProcessChannel {
    /// Build a connected pair: `(a, b)` where sends on `a` are received on
    /// `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_ab, rx_ab) = mpsc::channel();
        let (tx_ba, rx_ba) = mpsc::channel();
        (
            Self { tx: tx_ab, rx: rx_ba },
            Self { tx: tx_ba, rx: rx_ab },
        )
    }

    fn send(&mut self, msg: Message) -> Result<(), M2NError> {
        self.tx
            .send(msg)
            .map_err(|_| M2NError::TransportFailure("peer disconnected".into()))
    }

    fn recv(&mut self) -> Result<Message, M2NError> {
        self.rx
            .recv()
            .map_err(|_| M2NError::TransportFailure("peer disconnected".into()))
    }
}

impl M2N for InProcessChannel {
    fn send_bool(&mut self, value: bool) -> Result<(), M2NError> {
        self.send(Message::Bool(value))
    }

    fn receive_bool(&mut self) -> Result<bool, M2NError> {
        match self.recv()? {
            Message::Bool(b) => Ok(b),
            _ => Err(M2NError::TransportFailure("expected bool message".into())),
        }
    }

    fn send_double(&mut self, value: f64) -> Result<(), M2NError> {
        self.send(Message::Double(value))
    }

    fn receive_double(&mut self) -> Result<f64, M2NError> {
        match self.recv()? {
            Message::Double(d) => Ok(d),
            _ => Err(M2NError::TransportFailure("expected double message".into())),
        }
    }

    fn send_block(&mut self, mesh_id: MeshId, dimension: u8, block: &Vector) -> Result<(), M2NError> {
        self.send(Message::Block {
            mesh_id,
            dimension,
            data: block.iter().copied().collect(),
        })
    }

    fn receive_block(
        &mut self,
        mesh_id: MeshId,
        dimension: u8,
        expected_len: usize,
    ) -> Result<Vector, M2NError> {
        match self.recv()? {
            Message::Block {
                mesh_id: got_mesh,
                dimension: got_dim,
                data,
            } => {
                if got_mesh.0 != mesh_id.0 || got_dim != dimension {
                    return Err(M2NError::TransportFailure(format!(
                        "channel mismatch: expected (mesh={}, dim={}), got (mesh={}, dim={})",
                        mesh_id.0, dimension, got_mesh.0, got_dim
                    )));
                }
                if data.len() != expected_len {
                    return Err(M2NError::SizeMismatch {
                        expected: expected_len,
                        got: data.len(),
                    });
                }
                Ok(Vector::from_vec(data))
            }
            _ => Err(M2NError::TransportFailure("expected block message".into())),
        }
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_round_trip() {
        let (mut a, mut b) = InProcessChannel::pair();
        a.send_bool(true).unwrap();
        assert!(b.receive_bool().unwrap());
    }

    #[test]
    fn double_round_trip() {
        let (mut a, mut b) = InProcessChannel::pair();
        a.send_double(3.25).unwrap();
        assert_eq!(b.receive_double().unwrap(), 3.25);
    }

    #[test]
    fn block_round_trip_fifo_order() {
        let (mut a, mut b) = InProcessChannel::pair();
        let mesh = MeshId(0);
        a.send_block(mesh, 1, &Vector::from_vec(vec![1.0, 2.0])).unwrap();
        a.send_block(mesh, 1, &Vector::from_vec(vec![3.0, 4.0])).unwrap();
        let first = b.receive_block(mesh, 1, 2).unwrap();
        let second = b.receive_block(mesh, 1, 2).unwrap();
        assert_eq!(first.as_slice(), &[1.0, 2.0]);
        assert_eq!(second.as_slice(), &[3.0, 4.0]);
    }

    #[test]
    fn block_size_mismatch_is_reported() {
        let (mut a, mut b) = InProcessChannel::pair();
        let mesh = MeshId(0);
        a.send_block(mesh, 1, &Vector::from_vec(vec![1.0, 2.0])).unwrap();
        let err = b.receive_block(mesh, 1, 3).unwrap_err();
        assert!(matches!(err, M2NError::SizeMismatch { expected: 3, got: 2 }));
    }

    #[test]
    fn disconnected_peer_is_transport_failure() {
        let (a, mut b) = InProcessChannel::pair();
        drop(a);
        assert!(matches!(
            b.receive_bool().unwrap_err(),
            M2NError::TransportFailure(_)
        ));
    }
}
