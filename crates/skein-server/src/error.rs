//! Server error types.
//!
//! - [`DriverError`]: the Sans-IO driver was handed an event it cannot apply
//! - [`ClusterError`]: the worker <-> coordinator link failed
//! - [`ServerError`]: runtime startup and I/O failures
//!
//! Per-connection and per-request failures never surface here; the driver
//! turns them into actions (an `Error` frame, a withheld ack, a log line).

use std::fmt;

use skein_core::TransportError;
use skein_proto::ProtocolError;
use thiserror::Error;

use crate::storage::StorageError;

/// Errors from [`ServerDriver::process_event`](crate::ServerDriver::process_event).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Frame for a session the driver does not know.
    ///
    /// Transient: the session was just closed and a late frame raced it.
    #[error("session not found: {0}")]
    SessionNotFound(u64),

    /// Session id already in use.
    ///
    /// A logic bug in the runtime's id assignment.
    #[error("session already exists: {0}")]
    SessionAlreadyExists(u64),
}

/// Errors on the worker <-> coordinator link.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Frame I/O failed
    #[error("cluster transport error: {0}")]
    Transport(#[from] TransportError),

    /// Peer sent an unexpected or malformed frame
    #[error("cluster protocol error: {0}")]
    Protocol(String),

    /// The link is closed
    #[error("coordinator link closed")]
    Closed,

    /// A request got no reply in time
    #[error("coordinator request {request_id} timed out")]
    Timeout {
        /// Correlation id of the request
        request_id: u32,
    },
}

impl From<ProtocolError> for ClusterError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Errors that can occur in the server runtime.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, missing TLS certs, etc.).
    ///
    /// Fatal at startup. Fix configuration and restart.
    Config(String),

    /// Transport/network error.
    ///
    /// May be transient (network issues) or fatal (bind address in use).
    Transport(String),

    /// Storage could not be opened.
    Storage(StorageError),

    /// The coordinator link failed. Fatal for a worker; its supervisor
    /// restarts it.
    Cluster(ClusterError),

    /// Driver rejected an event.
    Driver(DriverError),

    /// Internal error (unexpected state, logic bug, etc.).
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
            Self::Cluster(err) => write!(f, "cluster error: {err}"),
            Self::Driver(err) => write!(f, "driver error: {err}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
            Self::Cluster(err) => Some(err),
            Self::Driver(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DriverError> for ServerError {
    fn from(err: DriverError) -> Self {
        Self::Driver(err)
    }
}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<ClusterError> for ServerError {
    fn from(err: ClusterError) -> Self {
        Self::Cluster(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
