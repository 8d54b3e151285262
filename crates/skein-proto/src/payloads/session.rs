//! Session management payloads.

use serde::{Deserialize, Serialize};

/// Client handshake, the first frame a client sends.
///
/// `server_offset` is the client's recovery watermark: the highest offset such
/// that every message at or below it has been observed. Zero on a first
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Last observed log offset (0 = none)
    pub server_offset: u64,

    /// Transport-level session to resume, if the client held one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session: Option<u64>,
}

/// Server greeting.
///
/// Always the first frame a worker sends on a connection, before any replayed
/// or live chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    /// Session id assigned by the worker. Present it in a later `Hello` to
    /// resume within the recovery window.
    pub session_id: u64,

    /// Worker that accepted the connection
    pub worker_id: u32,

    /// Whether the worker restored the previous session transparently. When
    /// `true` no replay follows.
    pub recovered: bool,

    /// Human-readable greeting
    pub text: String,
}

/// Worker-local informational text.
///
/// Not logged, not replayed, not relayed to other workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Notice text
    pub text: String,
}
