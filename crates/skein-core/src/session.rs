//! Per-connection session state machine.
//!
//! Tracks what one client has observed and drives the submission and recovery
//! contracts for it. Uses the action pattern: methods take time and inputs as
//! parameters and return [`SessionAction`]s for the driver to execute, so the
//! machine is pure and tested without I/O.
//!
//! # State Machine
//!
//! ```text
//! ┌────────────┐  Hello (resumed)          ┌────────┐
//! │ Connecting │──────────────────────────>│ Active │
//! └────────────┘                           └────────┘
//!       │  Hello (fresh)  ┌────────────┐ replay done ^
//!       └────────────────>│ Recovering │─────────────┘
//!                         └────────────┘
//!       any state ── disconnect / timeout ──> Disconnected
//! ```
//!
//! # Ordering
//!
//! - Submissions from one connection are appended one at a time, in receipt
//!   order. The next `Append` is only emitted once the previous one completes.
//! - Replayed messages precede live ones: live messages that arrive while
//!   Recovering are held and flushed when the replay finishes.
//! - Every offset at or below the recovery floor was either reported seen by
//!   the client or delivered by the replay, so live copies of it are dropped.

use std::{
    collections::VecDeque,
    ops::Sub,
    time::{Duration, Instant},
};

use skein_proto::{ChatMessage, Frame, Payload, RecoveryIncomplete, Submit};

use crate::error::SessionError;

/// Time allowed between accepting a connection and receiving `Hello`.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Actions returned by the session state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Send this frame to the client
    Send(Frame),

    /// Append a submission to the log. Report the result through
    /// [`Session::append_completed`].
    Append {
        /// Client acknowledgement id
        request_id: u32,
        /// Message text
        content: String,
        /// Dedup token, if supplied
        dedup_token: Option<String>,
    },

    /// Read the next replay page. Report it through [`Session::replay_page`]
    /// or [`Session::replay_failed`].
    ReadReplay {
        /// Exclusive lower bound
        after: u64,
    },

    /// Close the connection
    Close {
        /// Reason for closing
        reason: String,
    },
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, waiting for `Hello`
    Connecting,
    /// Replaying missed messages from the log
    Recovering,
    /// Receiving live traffic
    Active,
    /// Gone. Terminal.
    Disconnected,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time allowed to receive `Hello`
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT }
    }
}

#[derive(Debug, Clone)]
struct PendingSubmit {
    request_id: u32,
    submit: Submit,
}

/// Session state machine for one client connection.
///
/// Generic over `Instant` so the simulation harness can drive it with virtual
/// time.
#[derive(Debug, Clone)]
pub struct Session<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    id: u64,
    state: SessionState,
    config: SessionConfig,
    accepted_at: I,
    /// Highest offset sent to the client
    last_observed_offset: u64,
    /// Offsets at or below this are never sent live
    floor: u64,
    recovered: bool,
    /// Live messages held while Recovering
    held: Vec<ChatMessage>,
    queue: VecDeque<PendingSubmit>,
    in_flight: Option<u32>,
}

impl<I> Session<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a session in [`SessionState::Connecting`].
    pub fn new(id: u64, now: I, config: SessionConfig) -> Self {
        Self {
            id,
            state: SessionState::Connecting,
            config,
            accepted_at: now,
            last_observed_offset: 0,
            floor: 0,
            recovered: false,
            held: Vec::new(),
            queue: VecDeque::new(),
            in_flight: None,
        }
    }

    /// Session id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Highest offset sent to (or reported seen by) the client.
    #[must_use]
    pub fn last_observed_offset(&self) -> u64 {
        self.last_observed_offset
    }

    /// Whether the transport resumed this session without replay.
    #[must_use]
    pub fn recovered(&self) -> bool {
        self.recovered
    }

    /// Whether the handshake has completed and the session is still live.
    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(self.state, SessionState::Recovering | SessionState::Active)
    }

    /// Submissions queued behind the in-flight one.
    #[must_use]
    pub fn queued_submissions(&self) -> usize {
        self.queue.len()
    }

    /// Complete the handshake.
    ///
    /// `last_observed_offset` is the client-supplied watermark. When
    /// `recovered` is false the session enters Recovering and asks for the
    /// first replay page; otherwise it goes straight to Active.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` if not Connecting
    pub fn establish(
        &mut self,
        last_observed_offset: u64,
        recovered: bool,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if self.state != SessionState::Connecting {
            return Err(SessionError::InvalidState { state: self.state, operation: "establish" });
        }

        self.last_observed_offset = last_observed_offset;
        self.floor = last_observed_offset;
        self.recovered = recovered;

        if recovered {
            self.state = SessionState::Active;
            return Ok(Vec::new());
        }

        self.state = SessionState::Recovering;
        Ok(vec![SessionAction::ReadReplay { after: last_observed_offset }])
    }

    /// Apply one replay page.
    ///
    /// Messages at or below the floor are skipped, the rest are sent in
    /// ascending offset order. When `exhausted` the held live messages are
    /// flushed and the session becomes Active; otherwise the next page is
    /// requested. Pages for a session that is no longer Recovering are
    /// ignored.
    pub fn replay_page(&mut self, messages: Vec<ChatMessage>, exhausted: bool) -> Vec<SessionAction> {
        if self.state != SessionState::Recovering {
            return Vec::new();
        }

        let mut actions = Vec::with_capacity(messages.len() + 1);
        let mut sorted = messages;
        sorted.sort_by_key(|message| message.offset);

        let mut progressed = false;
        for message in sorted {
            if message.offset <= self.floor {
                continue;
            }
            self.floor = message.offset;
            progressed = true;
            if let Some(action) = self.send_message(message) {
                actions.push(action);
            }
        }

        if exhausted || !progressed {
            actions.extend(self.finish_recovery());
        } else {
            actions.push(SessionAction::ReadReplay { after: self.floor });
        }

        actions
    }

    /// Replay read failed.
    ///
    /// The session proceeds with what it has. The client is told where the
    /// replay stopped so it can surface the gap.
    pub fn replay_failed(&mut self, reason: impl Into<String>) -> Vec<SessionAction> {
        if self.state != SessionState::Recovering {
            return Vec::new();
        }

        let mut actions = Vec::new();
        let notice = Payload::RecoveryIncomplete(RecoveryIncomplete {
            resume_from: self.floor,
            reason: reason.into(),
        });
        if let Ok(frame) = notice.into_frame(0) {
            actions.push(SessionAction::Send(frame));
        }
        actions.extend(self.finish_recovery());
        actions
    }

    /// Deliver a live chat message.
    ///
    /// Held while Recovering, dropped at or below the floor, dropped when not
    /// established.
    pub fn deliver(&mut self, message: ChatMessage) -> Vec<SessionAction> {
        match self.state {
            SessionState::Recovering => {
                self.held.push(message);
                Vec::new()
            },
            SessionState::Active if message.offset > self.floor => {
                self.send_message(message).into_iter().collect()
            },
            _ => Vec::new(),
        }
    }

    /// Queue a client submission.
    ///
    /// Emits `Append` immediately when nothing is in flight.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` if the handshake has not completed or
    ///   the session is gone
    pub fn submit(
        &mut self,
        request_id: u32,
        submit: Submit,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if !self.is_established() {
            return Err(SessionError::InvalidState { state: self.state, operation: "submit" });
        }

        self.queue.push_back(PendingSubmit { request_id, submit });
        Ok(self.next_append().into_iter().collect())
    }

    /// The in-flight append finished.
    ///
    /// `acknowledge` is true for a stored or duplicate record: the client gets
    /// an `Ack` echoing `request_id`. A failed append gets nothing and the
    /// client's retry timer takes over. Either way the next queued submission
    /// starts.
    pub fn append_completed(&mut self, request_id: u32, acknowledge: bool) -> Vec<SessionAction> {
        if self.in_flight != Some(request_id) {
            return Vec::new();
        }
        self.in_flight = None;

        if !self.is_established() {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if acknowledge && let Ok(frame) = Payload::Ack.into_frame(request_id) {
            actions.push(SessionAction::Send(frame));
        }
        actions.extend(self.next_append());
        actions
    }

    /// Periodic maintenance: handshake timeout.
    pub fn tick(&mut self, now: I) -> Vec<SessionAction> {
        if self.state != SessionState::Connecting {
            return Vec::new();
        }

        let elapsed = now - self.accepted_at;
        if elapsed <= self.config.handshake_timeout {
            return Vec::new();
        }

        self.disconnect();
        vec![SessionAction::Close {
            reason: SessionError::HandshakeTimeout { elapsed }.to_string(),
        }]
    }

    /// Mark the session gone. Queued submissions and held messages are
    /// dropped; later completions are ignored.
    pub fn disconnect(&mut self) {
        self.state = SessionState::Disconnected;
        self.queue.clear();
        self.held.clear();
    }

    fn finish_recovery(&mut self) -> Vec<SessionAction> {
        self.state = SessionState::Active;

        let mut held = std::mem::take(&mut self.held);
        held.sort_by_key(|message| message.offset);

        let mut actions = Vec::with_capacity(held.len());
        for message in held {
            if message.offset <= self.floor {
                continue;
            }
            if let Some(action) = self.send_message(message) {
                actions.push(action);
            }
        }
        actions
    }

    fn next_append(&mut self) -> Option<SessionAction> {
        if self.in_flight.is_some() {
            return None;
        }
        let next = self.queue.pop_front()?;
        self.in_flight = Some(next.request_id);
        Some(SessionAction::Append {
            request_id: next.request_id,
            content: next.submit.content,
            dedup_token: next.submit.dedup_token,
        })
    }

    fn send_message(&mut self, message: ChatMessage) -> Option<SessionAction> {
        self.last_observed_offset = self.last_observed_offset.max(message.offset);
        Payload::ChatMessage(message).into_frame(0).ok().map(SessionAction::Send)
    }
}
