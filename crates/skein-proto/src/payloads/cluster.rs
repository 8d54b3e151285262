//! Worker <-> coordinator payloads.
//!
//! Requests carry a correlation id in the frame header's `request_id`; the
//! coordinator echoes it in the reply.

use serde::{Deserialize, Serialize};

use super::chat::ChatMessage;

/// First frame a worker sends after connecting to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    /// Worker identity, unique among live workers
    pub worker_id: u32,
}

/// Append a message to the shared log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    /// Message text
    pub content: String,

    /// Dedup token, if the client supplied one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_token: Option<String>,
}

/// Result of a log append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppendOutcome {
    /// Stored at `offset`.
    Appended {
        /// Newly assigned offset
        offset: u64,
    },
    /// The dedup token was already present; nothing was stored.
    Duplicate {
        /// Offset of the earlier record, when known
        offset: Option<u64>,
    },
    /// The log could not store the record.
    Failed {
        /// Failure description
        reason: String,
    },
}

/// Reply to [`AppendRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReply {
    /// What happened
    pub outcome: AppendOutcome,
}

/// Read records with offsets strictly greater than `after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    /// Exclusive lower bound
    pub after: u64,

    /// Maximum records to return
    pub limit: u32,
}

/// Reply to [`ReadRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadReply {
    /// Records in ascending offset order. Fewer than `limit` means the log
    /// head was reached.
    Messages(Vec<ChatMessage>),
    /// The log could not be read.
    Failed {
        /// Failure description
        reason: String,
    },
}

/// Chat message fan-out between workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    /// Message text
    pub content: String,

    /// Log offset of the message
    pub offset: u64,

    /// Worker whose client submitted the message
    pub origin: u32,
}
