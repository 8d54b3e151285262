//! Protocol core for the skein broadcast service.
//!
//! Pure logic shared by the worker runtime, the client and the simulation
//! harness: the per-connection [`Session`] state machine, the [`Environment`]
//! abstraction over time and randomness, and async frame I/O over any byte
//! stream.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod env;
pub mod error;
pub mod frame_io;
pub mod session;

pub use env::Environment;
pub use error::{SessionError, TransportError};
pub use frame_io::{read_frame, write_frame};
pub use session::{
    DEFAULT_HANDSHAKE_TIMEOUT, Session, SessionAction, SessionConfig, SessionState,
};
