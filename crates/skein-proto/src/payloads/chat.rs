//! Chat traffic payloads.

use serde::{Deserialize, Serialize};

/// Client chat submission.
///
/// The acknowledgement id lives in the frame header's `request_id`; the worker
/// echoes it in the `Ack` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submit {
    /// Message text
    pub content: String,

    /// Client-chosen dedup token. Absent tokens never deduplicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_token: Option<String>,
}

/// Chat message delivered to a client, live or replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message text
    pub content: String,

    /// Log offset assigned at append time
    pub offset: u64,
}

/// Recovery replay stopped before reaching the head of the log.
///
/// The client should treat everything after `resume_from` as possibly missing
/// and reconnect to retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryIncomplete {
    /// Last offset delivered by the replay
    pub resume_from: u64,

    /// Why the replay stopped
    pub reason: String,
}
