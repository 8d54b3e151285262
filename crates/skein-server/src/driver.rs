//! Server driver.
//!
//! Ties together the per-connection [`Session`] state machines and the
//! [`ResumeCache`], and decides who receives what. Pure: the runtime feeds it
//! [`ServerEvent`]s (frames, log completions, relay traffic, ticks) and
//! executes the [`ServerAction`]s it returns. The same driver runs under the
//! QUIC runtime and the simulation harness.
//!
//! # Submission flow
//!
//! ```text
//! Submit ──> AppendToLog ──> AppendCompleted
//!                              ├─ Ok(offset)  ─> fan out locally, Ack, Publish
//!                              ├─ Duplicate   ─> Ack
//!                              └─ Unavailable ─> no Ack (client retries)
//! ```

use std::{collections::BTreeMap, time::Duration};

use skein_core::{
    Environment, Session, SessionAction, SessionConfig, SessionState,
};
use skein_proto::{
    BroadcastEvent, ChatMessage, ErrorPayload, Frame, Hello, Notice, Payload, Welcome,
};

use crate::{
    error::DriverError,
    log::LogError,
    resume::{DEFAULT_RECOVERY_WINDOW, DEFAULT_RESUME_BUFFER, ResumeCache},
};

/// Driver configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Identity of this worker within the deployment
    pub worker_id: u32,
    /// Per-session configuration (handshake timeout)
    pub session: SessionConfig,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// How long a dropped session stays resumable (zero disables resume)
    pub recovery_window: Duration,
    /// Live messages buffered per parked session
    pub resume_buffer: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            worker_id: 0,
            session: SessionConfig::default(),
            max_connections: 10_000,
            recovery_window: DEFAULT_RECOVERY_WINDOW,
            resume_buffer: DEFAULT_RESUME_BUFFER,
        }
    }
}

/// Events that the server driver processes.
///
/// Produced by the runtime (production or simulation).
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new connection was accepted
    ConnectionAccepted {
        /// Unique connection ID assigned by the runtime
        session_id: u64,
    },

    /// A frame was received from a connection
    FrameReceived {
        /// Connection that sent the frame
        session_id: u64,
        /// The received frame
        frame: Frame,
    },

    /// A log append requested by [`ServerAction::AppendToLog`] finished
    AppendCompleted {
        /// Submitting session
        session_id: u64,
        /// Client acknowledgement id
        request_id: u32,
        /// Message text, for fan-out
        content: String,
        /// Assigned offset or failure
        result: Result<u64, LogError>,
    },

    /// A replay page requested by [`ServerAction::ReadReplay`] arrived
    ReplayPage {
        /// Recovering session
        session_id: u64,
        /// Messages in ascending offset order
        messages: Vec<ChatMessage>,
        /// Whether the head of the log was reached
        exhausted: bool,
    },

    /// A replay read failed
    ReplayFailed {
        /// Recovering session
        session_id: u64,
        /// Failure description
        reason: String,
    },

    /// A broadcast event arrived from the relay fabric
    RelayReceived {
        /// The event
        event: BroadcastEvent,
    },

    /// A connection was closed (by peer or error)
    ConnectionClosed {
        /// Connection that was closed
        session_id: u64,
        /// Reason for closure
        reason: String,
    },

    /// Periodic tick for timeouts
    Tick,
}

/// Actions that the server driver produces.
///
/// Executed by runtime-specific code (production or simulation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    /// Send a frame to a specific session
    SendToSession {
        /// Target session ID
        session_id: u64,
        /// Frame to send
        frame: Frame,
    },

    /// Append a submission to the log, then report
    /// [`ServerEvent::AppendCompleted`]
    AppendToLog {
        /// Submitting session
        session_id: u64,
        /// Client acknowledgement id
        request_id: u32,
        /// Message text
        content: String,
        /// Dedup token, if supplied
        dedup_token: Option<String>,
    },

    /// Read one replay page after `after`, then report
    /// [`ServerEvent::ReplayPage`] or [`ServerEvent::ReplayFailed`]
    ReadReplay {
        /// Recovering session
        session_id: u64,
        /// Exclusive lower bound
        after: u64,
    },

    /// Hand an accepted message to the relay fabric for other workers
    Publish {
        /// The event
        event: BroadcastEvent,
    },

    /// Close a connection
    CloseConnection {
        /// Session to close
        session_id: u64,
        /// Reason for closure
        reason: String,
    },

    /// Log a message
    Log {
        /// Log level
        level: LogLevel,
        /// Message to log
        message: String,
    },
}

/// Log levels for server actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug information
    Debug,
    /// Informational message
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// Action-based server driver for one worker.
pub struct ServerDriver<E: Environment> {
    /// Live sessions, ordered by id so fan-out order is reproducible
    sessions: BTreeMap<u64, Session<E::Instant>>,
    /// Dropped sessions awaiting resume
    resume: ResumeCache<E::Instant>,
    /// Environment (time)
    env: E,
    /// Configuration
    config: DriverConfig,
}

impl<E: Environment> ServerDriver<E> {
    /// Create a new server driver.
    pub fn new(env: E, config: DriverConfig) -> Self {
        Self {
            sessions: BTreeMap::new(),
            resume: ResumeCache::new(config.recovery_window, config.resume_buffer),
            env,
            config,
        }
    }

    /// This worker's id.
    pub fn worker_id(&self) -> u32 {
        self.config.worker_id
    }

    /// Time a new connection has to send `Hello`.
    pub fn handshake_timeout(&self) -> Duration {
        self.config.session.handshake_timeout
    }

    /// Number of live connections (any state).
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions parked for resume.
    pub fn parked_count(&self) -> usize {
        self.resume.len()
    }

    /// A live session, if known.
    pub fn session(&self, session_id: u64) -> Option<&Session<E::Instant>> {
        self.sessions.get(&session_id)
    }

    /// Ids of sessions that completed the handshake.
    pub fn established_sessions(&self) -> impl Iterator<Item = u64> + '_ {
        self.sessions.iter().filter(|(_, s)| s.is_established()).map(|(id, _)| *id)
    }

    /// Process a server event and return actions to execute.
    pub fn process_event(&mut self, event: ServerEvent) -> Result<Vec<ServerAction>, DriverError> {
        match event {
            ServerEvent::ConnectionAccepted { session_id } => {
                self.handle_connection_accepted(session_id)
            },
            ServerEvent::FrameReceived { session_id, frame } => {
                self.handle_frame_received(session_id, &frame)
            },
            ServerEvent::AppendCompleted { session_id, request_id, content, result } => {
                Ok(self.handle_append_completed(session_id, request_id, content, result))
            },
            ServerEvent::ReplayPage { session_id, messages, exhausted } => {
                let Some(session) = self.sessions.get_mut(&session_id) else {
                    return Ok(Vec::new());
                };
                Ok(convert(session_id, session.replay_page(messages, exhausted)))
            },
            ServerEvent::ReplayFailed { session_id, reason } => {
                Ok(self.handle_replay_failed(session_id, reason))
            },
            ServerEvent::RelayReceived { event } => Ok(self.handle_relay_received(event)),
            ServerEvent::ConnectionClosed { session_id, reason } => {
                Ok(self.handle_connection_closed(session_id, &reason))
            },
            ServerEvent::Tick => Ok(self.handle_tick()),
        }
    }

    fn handle_connection_accepted(
        &mut self,
        session_id: u64,
    ) -> Result<Vec<ServerAction>, DriverError> {
        if self.sessions.contains_key(&session_id) {
            return Err(DriverError::SessionAlreadyExists(session_id));
        }

        if self.sessions.len() >= self.config.max_connections {
            let mut actions = error_frame(session_id, ErrorPayload::overloaded(self.config.max_connections));
            actions.push(ServerAction::CloseConnection {
                session_id,
                reason: "max connections exceeded".to_string(),
            });
            return Ok(actions);
        }

        let session = Session::new(session_id, self.env.now(), self.config.session.clone());
        self.sessions.insert(session_id, session);

        Ok(vec![ServerAction::Log {
            level: LogLevel::Debug,
            message: format!("connection {session_id:016x} accepted"),
        }])
    }

    fn handle_frame_received(
        &mut self,
        session_id: u64,
        frame: &Frame,
    ) -> Result<Vec<ServerAction>, DriverError> {
        if !self.sessions.contains_key(&session_id) {
            return Err(DriverError::SessionNotFound(session_id));
        }

        let payload = match Payload::from_frame(frame) {
            Ok(payload) => payload,
            Err(e) => {
                let reason = format!("undecodable frame: {e}");
                let mut actions = error_frame(session_id, ErrorPayload::invalid_payload(&reason));
                actions.extend(self.close_session(session_id, reason));
                return Ok(actions);
            },
        };

        match payload {
            Payload::Hello(hello) => Ok(self.handle_hello(session_id, &hello)),
            Payload::Submit(submit) => {
                let request_id = frame.header.request_id();
                let Some(session) = self.sessions.get_mut(&session_id) else {
                    return Err(DriverError::SessionNotFound(session_id));
                };
                match session.submit(request_id, submit) {
                    Ok(actions) => Ok(convert(session_id, actions)),
                    Err(e) => Ok(error_frame(session_id, ErrorPayload::frame_rejected(e.to_string()))),
                }
            },
            other => Ok(error_frame(
                session_id,
                ErrorPayload::frame_rejected(format!(
                    "opcode {:#06x} is not accepted from clients",
                    other.opcode().to_u16()
                )),
            )),
        }
    }

    /// Complete the handshake: greet, recover, and announce.
    ///
    /// Resume is granted only when the client already holds everything the
    /// old connection sent; anything less falls back to log replay.
    fn handle_hello(&mut self, session_id: u64, hello: &Hello) -> Vec<ServerAction> {
        let now = self.env.now();
        let worker_id = self.config.worker_id;

        match self.sessions.get(&session_id).map(Session::state) {
            Some(SessionState::Connecting) => {},
            Some(_) => {
                return error_frame(session_id, ErrorPayload::frame_rejected("duplicate Hello"));
            },
            None => return Vec::new(),
        }

        let resumed = hello
            .resume_session
            .and_then(|old| self.resume.take(old, now))
            .filter(|parked| hello.server_offset >= parked.last_observed_offset);
        let recovered = resumed.is_some();

        let mut actions = Vec::new();
        let welcome = Payload::Welcome(Welcome {
            session_id,
            worker_id,
            recovered,
            text: format!("Welcome to the chat! (worker {worker_id})"),
        });
        match welcome.into_frame(0) {
            Ok(frame) => actions.push(ServerAction::SendToSession { session_id, frame }),
            Err(e) => actions.push(ServerAction::Log {
                level: LogLevel::Error,
                message: format!("failed to encode welcome: {e}"),
            }),
        }

        let Some(session) = self.sessions.get_mut(&session_id) else {
            return actions;
        };
        let mut session_actions = match session.establish(hello.server_offset, recovered) {
            Ok(session_actions) => session_actions,
            Err(e) => {
                actions.extend(error_frame(session_id, ErrorPayload::frame_rejected(e.to_string())));
                return actions;
            },
        };
        if let Some(parked) = resumed {
            for message in parked.missed {
                session_actions.extend(session.deliver(message));
            }
        }
        actions.extend(convert(session_id, session_actions));

        let notice = Payload::Notice(Notice { text: format!("New user connected on worker {worker_id}") });
        match notice.into_frame(0) {
            Ok(frame) => {
                for other in self.established_sessions().filter(|id| *id != session_id) {
                    actions.push(ServerAction::SendToSession { session_id: other, frame: frame.clone() });
                }
            },
            Err(e) => actions.push(ServerAction::Log {
                level: LogLevel::Error,
                message: format!("failed to encode join notice: {e}"),
            }),
        }

        actions.push(ServerAction::Log {
            level: LogLevel::Info,
            message: format!(
                "session {session_id:016x} established (server_offset={}, recovered={recovered})",
                hello.server_offset
            ),
        });

        actions
    }

    fn handle_append_completed(
        &mut self,
        session_id: u64,
        request_id: u32,
        content: String,
        result: Result<u64, LogError>,
    ) -> Vec<ServerAction> {
        let (mut actions, acknowledge) = match result {
            Ok(offset) => {
                let mut actions = self.fan_out(&ChatMessage { content: content.clone(), offset });
                actions.push(ServerAction::Publish {
                    event: BroadcastEvent { content, offset, origin: self.config.worker_id },
                });
                (actions, true)
            },
            Err(LogError::Duplicate { token, offset }) => {
                let actions = vec![ServerAction::Log {
                    level: LogLevel::Debug,
                    message: format!("duplicate submission {token:?} (offset {offset:?}), acknowledging"),
                }];
                (actions, true)
            },
            Err(LogError::Unavailable(reason)) => {
                let actions = vec![ServerAction::Log {
                    level: LogLevel::Warn,
                    message: format!(
                        "append for session {session_id:016x} request {request_id} failed: {reason}"
                    ),
                }];
                (actions, false)
            },
        };

        if let Some(session) = self.sessions.get_mut(&session_id) {
            // Ack goes before the publish so the submitter hears back without
            // waiting on the relay.
            let session_actions = convert(session_id, session.append_completed(request_id, acknowledge));
            let publish_at = actions
                .iter()
                .position(|a| matches!(a, ServerAction::Publish { .. }))
                .unwrap_or(actions.len());
            actions.splice(publish_at..publish_at, session_actions);
        }

        actions
    }

    fn handle_replay_failed(&mut self, session_id: u64, reason: String) -> Vec<ServerAction> {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return Vec::new();
        };

        let mut actions = vec![ServerAction::Log {
            level: LogLevel::Warn,
            message: format!("replay for session {session_id:016x} failed: {reason}"),
        }];
        actions.extend(convert(session_id, session.replay_failed(reason)));
        actions
    }

    fn handle_relay_received(&mut self, event: BroadcastEvent) -> Vec<ServerAction> {
        if event.origin == self.config.worker_id {
            return Vec::new();
        }
        self.fan_out(&ChatMessage { content: event.content, offset: event.offset })
    }

    fn handle_connection_closed(&mut self, session_id: u64, reason: &str) -> Vec<ServerAction> {
        let Some(mut session) = self.sessions.remove(&session_id) else {
            return Vec::new();
        };

        let parked = session.state() == SessionState::Active;
        if parked {
            self.resume.park(session_id, session.last_observed_offset(), self.env.now());
        }
        session.disconnect();

        vec![ServerAction::Log {
            level: LogLevel::Debug,
            message: format!("session {session_id:016x} closed ({reason}), parked={parked}"),
        }]
    }

    fn handle_tick(&mut self) -> Vec<ServerAction> {
        let now = self.env.now();
        let mut actions = Vec::new();
        let mut closed = Vec::new();

        for (&session_id, session) in &mut self.sessions {
            let session_actions = session.tick(now);
            if session.state() == SessionState::Disconnected {
                closed.push(session_id);
            }
            actions.extend(convert(session_id, session_actions));
        }
        for session_id in closed {
            self.sessions.remove(&session_id);
        }

        let expired = self.resume.expire(now);
        if expired > 0 {
            actions.push(ServerAction::Log {
                level: LogLevel::Debug,
                message: format!("{expired} parked session(s) expired"),
            });
        }

        actions
    }

    /// Deliver a message to every local session and every parked one.
    fn fan_out(&mut self, message: &ChatMessage) -> Vec<ServerAction> {
        self.resume.record(message);

        let mut actions = Vec::new();
        for (&session_id, session) in &mut self.sessions {
            actions.extend(convert(session_id, session.deliver(message.clone())));
        }
        actions
    }

    fn close_session(&mut self, session_id: u64, reason: String) -> Vec<ServerAction> {
        if let Some(mut session) = self.sessions.remove(&session_id) {
            session.disconnect();
        }
        vec![ServerAction::CloseConnection { session_id, reason }]
    }
}

fn convert(session_id: u64, actions: Vec<SessionAction>) -> Vec<ServerAction> {
    actions
        .into_iter()
        .map(|action| match action {
            SessionAction::Send(frame) => ServerAction::SendToSession { session_id, frame },
            SessionAction::Append { request_id, content, dedup_token } => {
                ServerAction::AppendToLog { session_id, request_id, content, dedup_token }
            },
            SessionAction::ReadReplay { after } => ServerAction::ReadReplay { session_id, after },
            SessionAction::Close { reason } => ServerAction::CloseConnection { session_id, reason },
        })
        .collect()
}

fn error_frame(session_id: u64, error: ErrorPayload) -> Vec<ServerAction> {
    let message = error.message.clone();
    match Payload::Error(error).into_frame(0) {
        Ok(frame) => vec![ServerAction::SendToSession { session_id, frame }, ServerAction::Log {
            level: LogLevel::Warn,
            message: format!("rejected frame from session {session_id:016x}: {message}"),
        }],
        Err(e) => vec![ServerAction::Log {
            level: LogLevel::Error,
            message: format!("failed to encode error response: {e}"),
        }],
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use skein_proto::{Opcode, Submit};

    use super::*;

    /// Manually advanced clock.
    #[derive(Clone, Default)]
    struct TestEnv {
        now_ms: Arc<AtomicU64>,
    }

    impl TestEnv {
        fn advance(&self, by: Duration) {
            self.now_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        }
    }

    impl Environment for TestEnv {
        type Instant = Duration;

        fn now(&self) -> Duration {
            Duration::from_millis(self.now_ms.load(Ordering::SeqCst))
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(7);
        }
    }

    fn driver() -> (ServerDriver<TestEnv>, TestEnv) {
        let env = TestEnv::default();
        let config = DriverConfig { worker_id: 1, ..Default::default() };
        (ServerDriver::new(env.clone(), config), env)
    }

    fn hello(server_offset: u64, resume_session: Option<u64>) -> Frame {
        Payload::Hello(Hello { server_offset, resume_session }).into_frame(0).unwrap()
    }

    fn submit(request_id: u32, content: &str, token: &str) -> Frame {
        Payload::Submit(Submit { content: content.into(), dedup_token: Some(token.into()) })
            .into_frame(request_id)
            .unwrap()
    }

    fn connect(driver: &mut ServerDriver<TestEnv>, session_id: u64, server_offset: u64) -> Vec<ServerAction> {
        driver.process_event(ServerEvent::ConnectionAccepted { session_id }).unwrap();
        driver
            .process_event(ServerEvent::FrameReceived { session_id, frame: hello(server_offset, None) })
            .unwrap()
    }

    /// Connect and finish an empty replay.
    fn connect_active(driver: &mut ServerDriver<TestEnv>, session_id: u64) {
        connect(driver, session_id, 0);
        driver
            .process_event(ServerEvent::ReplayPage { session_id, messages: vec![], exhausted: true })
            .unwrap();
    }

    fn frames_to(actions: &[ServerAction], target: u64) -> Vec<Payload> {
        actions
            .iter()
            .filter_map(|a| match a {
                ServerAction::SendToSession { session_id, frame } if *session_id == target => {
                    Payload::from_frame(frame).ok()
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn welcome_is_first_then_replay_is_requested() {
        let (mut driver, _) = driver();
        let actions = connect(&mut driver, 1, 5);

        let ServerAction::SendToSession { session_id: 1, frame } = &actions[0] else {
            panic!("expected welcome first, got {actions:?}");
        };
        assert_eq!(frame.header.opcode_enum(), Some(Opcode::Welcome));
        assert!(actions.contains(&ServerAction::ReadReplay { session_id: 1, after: 5 }));
    }

    #[test]
    fn join_notice_goes_to_others_only() {
        let (mut driver, _) = driver();
        connect_active(&mut driver, 1);
        let actions = connect(&mut driver, 2, 0);

        assert!(matches!(frames_to(&actions, 1).as_slice(), [Payload::Notice(_)]));
        assert!(!frames_to(&actions, 2).iter().any(|p| matches!(p, Payload::Notice(_))));
        assert!(!actions.iter().any(|a| matches!(a, ServerAction::Publish { .. })));
    }

    #[test]
    fn rejects_when_max_connections_exceeded() {
        let env = TestEnv::default();
        let config = DriverConfig { max_connections: 1, ..Default::default() };
        let mut driver = ServerDriver::new(env, config);

        driver.process_event(ServerEvent::ConnectionAccepted { session_id: 1 }).unwrap();
        let actions = driver.process_event(ServerEvent::ConnectionAccepted { session_id: 2 }).unwrap();

        assert_eq!(driver.session_count(), 1);
        assert!(actions.iter().any(|a| matches!(a, ServerAction::CloseConnection { session_id: 2, .. })));
    }

    #[test]
    fn submit_before_hello_is_rejected() {
        let (mut driver, _) = driver();
        driver.process_event(ServerEvent::ConnectionAccepted { session_id: 1 }).unwrap();

        let actions = driver
            .process_event(ServerEvent::FrameReceived { session_id: 1, frame: submit(1, "x", "t") })
            .unwrap();
        assert!(matches!(frames_to(&actions, 1).as_slice(), [Payload::Error(_)]));
        assert!(!actions.iter().any(|a| matches!(a, ServerAction::AppendToLog { .. })));
    }

    #[test]
    fn appended_message_fans_out_acks_and_publishes() {
        let (mut driver, _) = driver();
        connect_active(&mut driver, 1);
        connect_active(&mut driver, 2);

        let actions = driver
            .process_event(ServerEvent::FrameReceived { session_id: 1, frame: submit(9, "hello", "tok1") })
            .unwrap();
        assert_eq!(actions, vec![ServerAction::AppendToLog {
            session_id: 1,
            request_id: 9,
            content: "hello".into(),
            dedup_token: Some("tok1".into()),
        }]);

        let actions = driver
            .process_event(ServerEvent::AppendCompleted {
                session_id: 1,
                request_id: 9,
                content: "hello".into(),
                result: Ok(1),
            })
            .unwrap();

        let expected = Payload::ChatMessage(ChatMessage { content: "hello".into(), offset: 1 });
        assert_eq!(frames_to(&actions, 2), vec![expected.clone()]);
        assert_eq!(frames_to(&actions, 1), vec![expected, Payload::Ack]);
        assert_eq!(actions.last(), Some(&ServerAction::Publish {
            event: BroadcastEvent { content: "hello".into(), offset: 1, origin: 1 },
        }));
    }

    #[test]
    fn duplicate_is_acked_without_broadcast() {
        let (mut driver, _) = driver();
        connect_active(&mut driver, 1);
        connect_active(&mut driver, 2);
        driver
            .process_event(ServerEvent::FrameReceived { session_id: 1, frame: submit(3, "hello", "tok1") })
            .unwrap();

        let actions = driver
            .process_event(ServerEvent::AppendCompleted {
                session_id: 1,
                request_id: 3,
                content: "hello".into(),
                result: Err(LogError::Duplicate { token: "tok1".into(), offset: Some(1) }),
            })
            .unwrap();

        assert_eq!(frames_to(&actions, 1), vec![Payload::Ack]);
        assert!(frames_to(&actions, 2).is_empty());
        assert!(!actions.iter().any(|a| matches!(a, ServerAction::Publish { .. })));
    }

    #[test]
    fn unavailable_log_withholds_ack() {
        let (mut driver, _) = driver();
        connect_active(&mut driver, 1);
        driver
            .process_event(ServerEvent::FrameReceived { session_id: 1, frame: submit(3, "hello", "tok1") })
            .unwrap();

        let actions = driver
            .process_event(ServerEvent::AppendCompleted {
                session_id: 1,
                request_id: 3,
                content: "hello".into(),
                result: Err(LogError::Unavailable("disk".into())),
            })
            .unwrap();

        assert!(frames_to(&actions, 1).is_empty());
    }

    #[test]
    fn own_relay_events_are_ignored() {
        let (mut driver, _) = driver();
        connect_active(&mut driver, 1);

        let own = BroadcastEvent { content: "x".into(), offset: 4, origin: 1 };
        assert!(driver.process_event(ServerEvent::RelayReceived { event: own }).unwrap().is_empty());

        let foreign = BroadcastEvent { content: "x".into(), offset: 4, origin: 2 };
        let actions = driver.process_event(ServerEvent::RelayReceived { event: foreign }).unwrap();
        assert_eq!(frames_to(&actions, 1), vec![Payload::ChatMessage(ChatMessage {
            content: "x".into(),
            offset: 4
        })]);
    }

    #[test]
    fn replay_for_closed_session_is_abandoned() {
        let (mut driver, _) = driver();
        connect(&mut driver, 1, 0);
        driver
            .process_event(ServerEvent::ConnectionClosed { session_id: 1, reason: "gone".into() })
            .unwrap();

        let actions = driver
            .process_event(ServerEvent::ReplayPage {
                session_id: 1,
                messages: vec![ChatMessage { content: "a".into(), offset: 1 }],
                exhausted: true,
            })
            .unwrap();
        assert!(actions.is_empty());
        assert_eq!(driver.parked_count(), 0, "recovering sessions are not resumable");
    }

    #[test]
    fn resumed_session_gets_missed_messages_without_replay() {
        let (mut driver, env) = driver();
        connect_active(&mut driver, 1);
        driver
            .process_event(ServerEvent::ConnectionClosed { session_id: 1, reason: "net".into() })
            .unwrap();
        assert_eq!(driver.parked_count(), 1);

        let event = BroadcastEvent { content: "missed".into(), offset: 1, origin: 2 };
        driver.process_event(ServerEvent::RelayReceived { event }).unwrap();
        env.advance(Duration::from_secs(5));

        driver.process_event(ServerEvent::ConnectionAccepted { session_id: 2 }).unwrap();
        let actions = driver
            .process_event(ServerEvent::FrameReceived { session_id: 2, frame: hello(0, Some(1)) })
            .unwrap();

        assert!(!actions.iter().any(|a| matches!(a, ServerAction::ReadReplay { .. })));
        let payloads = frames_to(&actions, 2);
        assert!(matches!(&payloads[0], Payload::Welcome(w) if w.recovered));
        assert_eq!(payloads[1], Payload::ChatMessage(ChatMessage { content: "missed".into(), offset: 1 }));
    }

    #[test]
    fn resume_after_window_falls_back_to_replay() {
        let (mut driver, env) = driver();
        connect_active(&mut driver, 1);
        driver
            .process_event(ServerEvent::ConnectionClosed { session_id: 1, reason: "net".into() })
            .unwrap();
        env.advance(Duration::from_secs(121));

        driver.process_event(ServerEvent::ConnectionAccepted { session_id: 2 }).unwrap();
        let actions = driver
            .process_event(ServerEvent::FrameReceived { session_id: 2, frame: hello(0, Some(1)) })
            .unwrap();

        assert!(actions.contains(&ServerAction::ReadReplay { session_id: 2, after: 0 }));
    }

    #[test]
    fn handshake_timeout_closes_on_tick() {
        let (mut driver, env) = driver();
        driver.process_event(ServerEvent::ConnectionAccepted { session_id: 1 }).unwrap();
        env.advance(Duration::from_secs(31));

        let actions = driver.process_event(ServerEvent::Tick).unwrap();
        assert!(actions.iter().any(|a| matches!(a, ServerAction::CloseConnection { session_id: 1, .. })));
        assert_eq!(driver.session_count(), 0);
    }

    #[test]
    fn frame_from_unknown_session_is_an_error() {
        let (mut driver, _) = driver();
        let result = driver.process_event(ServerEvent::FrameReceived { session_id: 9, frame: hello(0, None) });
        assert_eq!(result, Err(DriverError::SessionNotFound(9)));
    }
}
