//! Client
//!
//! Action-based client state machine for skein. Owns the client half of the
//! submission contract (dedup tokens, ack timeout, bounded retries) and of
//! recovery (offset tracking, duplicate suppression, resume on reconnect).
//!
//! # Architecture
//!
//! Same Sans-IO pattern as [`skein_core`]: the caller feeds
//! [`ClientEvent`]s and executes the returned [`ClientAction`]s.
//!
//! # Components
//!
//! - [`Client`]: the state machine
//! - [`SeenOffsets`]: which offsets were already delivered
//! - [`ClientEvent`] / [`ClientAction`]: inputs and outputs
//!
//! # Transport (optional)
//!
//! With the `transport` feature enabled, [`transport::connect`] opens a QUIC
//! connection and exposes it as a pair of frame channels.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod client;
mod error;
mod event;
mod seen;

#[cfg(feature = "transport")]
pub mod transport;

pub use client::{Client, ClientConfig, DEFAULT_ACK_TIMEOUT, DEFAULT_RETRIES};
pub use error::ClientError;
pub use event::{ClientAction, ClientEvent};
pub use seen::SeenOffsets;
pub use skein_core::Environment;
