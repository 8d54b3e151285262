//! Error types for the skein protocol core.
//!
//! Session errors cover handshake and state transitions on one connection;
//! transport errors cover moving frames over a byte stream. Neither is ever
//! fatal to the worker: the owning connection is closed and everything else
//! carries on.

use std::{io, time::Duration};

use skein_proto::ProtocolError;
use thiserror::Error;

use crate::session::SessionState;

/// Errors raised by the [`Session`](crate::Session) state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation not valid in the current state
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when error occurred
        state: SessionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Frame not valid in the current state
    #[error("unexpected frame: received opcode {opcode:#06x} in state {state:?}")]
    UnexpectedFrame {
        /// Current state when frame was received
        state: SessionState,
        /// Opcode of the unexpected frame
        opcode: u16,
    },

    /// Hello did not arrive within the handshake timeout
    #[error("handshake timeout after {elapsed:?}")]
    HandshakeTimeout {
        /// How long we waited
        elapsed: Duration,
    },

    /// Frame or payload could not be parsed
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// Returns true if the peer may succeed by reconnecting.
    ///
    /// Protocol violations are never transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::HandshakeTimeout { .. })
    }
}

/// Errors raised while moving frames over a byte stream.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The underlying stream failed
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The peer sent bytes that are not a valid frame
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The stream ended in the middle of a frame
    #[error("stream closed mid-frame after {read} of {expected} bytes")]
    Truncated {
        /// Bytes required
        expected: usize,
        /// Bytes received before EOF
        read: usize,
    },

    /// The peer or the local side closed the connection
    #[error("connection closed")]
    Closed,
}
