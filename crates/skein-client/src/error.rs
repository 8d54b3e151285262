//! Client errors.

use skein_proto::ProtocolError;
use thiserror::Error;

/// Errors from [`Client::handle`](crate::Client::handle).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The server sent a frame that does not decode.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server sent a frame only clients may send.
    #[error("unexpected opcode from server: {opcode:#06x}")]
    UnexpectedFrame {
        /// Raw opcode
        opcode: u16,
    },
}
