//! Wire format for the skein broadcast service.
//!
//! Every message on every link (client <-> worker, worker <-> coordinator) is
//! a [`Frame`]: a fixed 16-byte binary header followed by a CBOR payload. The
//! header carries the opcode and a request id so the receiver can route and
//! correlate without touching the payload; [`Payload`] is the typed view.
//!
//! # Links
//!
//! - Client link: `Hello`, `Welcome`, `Notice`, `Submit`, `Ack`,
//!   `ChatMessage`, `RecoveryIncomplete`, `Error`
//! - Cluster link: `Register`, `AppendRequest`, `AppendReply`, `ReadRequest`,
//!   `ReadReply`, `Broadcast`

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod errors;
mod frame;
mod header;
mod opcode;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
pub use opcode::Opcode;
pub use payloads::{
    ErrorPayload, Payload,
    chat::{ChatMessage, RecoveryIncomplete, Submit},
    cluster::{AppendOutcome, AppendReply, AppendRequest, BroadcastEvent, ReadReply, ReadRequest, Register},
    session::{Hello, Notice, Welcome},
};

/// ALPN protocol identifier for QUIC connections.
pub const ALPN_PROTOCOL: &[u8] = b"skein";
