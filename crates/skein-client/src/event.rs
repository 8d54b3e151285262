//! Client events and actions.

use skein_proto::Frame;

/// Events the caller feeds into the client.
///
/// Generic over `I` (Instant type) so simulations can drive the retry timer
/// with virtual time.
#[derive(Debug, Clone)]
pub enum ClientEvent<I = std::time::Instant> {
    /// A transport connection (re)opened. The client emits `Hello` and
    /// resends anything unacknowledged.
    Connected,

    /// The transport connection dropped.
    Disconnected,

    /// Frame received from server.
    FrameReceived(Frame),

    /// Application wants to send a chat message.
    Send {
        /// Message text
        content: String,
    },

    /// Time tick for ack timeouts.
    Tick {
        /// Current time from the environment.
        now: I,
    },
}

/// Actions the client produces for the caller to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Send a frame to the server.
    Send(Frame),

    /// Server greeting.
    Welcome {
        /// Server-side session id (presented on reconnect)
        session_id: u64,
        /// Worker that accepted the connection
        worker_id: u32,
        /// Whether the server resumed the previous session
        recovered: bool,
        /// Greeting text
        text: String,
    },

    /// Informational text from the server (join notices).
    Notice {
        /// Notice text
        text: String,
    },

    /// A chat message not seen before. Render it.
    Deliver {
        /// Message text
        content: String,
        /// Log offset
        offset: u64,
    },

    /// A submission was acknowledged. Stop retrying.
    Acknowledged {
        /// Request id of the submission
        request_id: u32,
        /// Its dedup token
        dedup_token: String,
    },

    /// A submission exhausted its retries without an ack.
    Unsent {
        /// Request id of the submission
        request_id: u32,
        /// Message text
        content: String,
        /// Its dedup token
        dedup_token: String,
    },

    /// The server could not replay everything after `resume_from`.
    RecoveryIncomplete {
        /// First offset that may be missing is `resume_from + 1`
        resume_from: u64,
        /// Why the replay stopped
        reason: String,
    },

    /// The server rejected something.
    ServerError {
        /// Error code
        code: u16,
        /// Description
        message: String,
    },

    /// Log message for debugging.
    Log {
        /// Log message.
        message: String,
    },
}
