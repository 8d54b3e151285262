//! Client state machine.
//!
//! Owns the client half of the submission contract: every message gets a
//! dedup token and a request id, stays pending until the server echoes that
//! request id in an `Ack`, and is resubmitted with the same token when the
//! ack does not arrive in time. The log's dedup check makes resubmission
//! idempotent, so a retry after a lost ack never duplicates the message.
//!
//! It also owns duplicate suppression on the receive side. Offsets may
//! arrive twice (replay overlapping live fan-out, redelivery after resume) or
//! out of order (relay interleaving across workers); [`SeenOffsets`] drops
//! the repeats and its watermark is what the next `Hello` reports.

use std::{collections::BTreeMap, time::Duration};

use skein_core::Environment;
use skein_proto::{Frame, Hello, Payload, Submit};

use crate::{ClientAction, ClientError, ClientEvent, SeenOffsets};

/// Default time to wait for an `Ack` before resubmitting.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of resubmissions before a message is reported unsent.
pub const DEFAULT_RETRIES: u32 = 3;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a submission may go unacknowledged before it is resent.
    pub ack_timeout: Duration,

    /// Resubmissions allowed after the first send.
    pub retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { ack_timeout: DEFAULT_ACK_TIMEOUT, retries: DEFAULT_RETRIES }
    }
}

/// A submission waiting for its ack.
#[derive(Debug, Clone)]
struct PendingSubmit<I> {
    content: String,
    dedup_token: String,
    retries_used: u32,
    /// `None` while it still has to go out on the current connection.
    sent_at: Option<I>,
}

/// Chat client state machine.
///
/// Pure: feed [`ClientEvent`]s to [`Client::handle`] and execute the returned
/// [`ClientAction`]s. Time comes from the environment so the retry timer runs
/// on virtual time in simulation.
pub struct Client<E: Environment> {
    env: E,
    config: ClientConfig,
    client_id: u64,
    counter: u64,
    next_request: u32,
    connected: bool,
    session_id: Option<u64>,
    seen: SeenOffsets,
    pending: BTreeMap<u32, PendingSubmit<E::Instant>>,
}

impl<E: Environment> Client<E> {
    /// Create a disconnected client with a random client id.
    pub fn new(env: E, config: ClientConfig) -> Self {
        let client_id = env.random_nonzero_u64();
        Self {
            env,
            config,
            client_id,
            counter: 0,
            next_request: 1,
            connected: false,
            session_id: None,
            seen: SeenOffsets::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Random id that prefixes every dedup token this client generates.
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Whether a transport connection is up.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Session id from the last `Welcome`.
    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    /// Offsets delivered so far.
    pub fn seen(&self) -> &SeenOffsets {
        &self.seen
    }

    /// Submissions still waiting for an ack.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Process one event.
    ///
    /// # Errors
    ///
    /// - `ClientError::Protocol` if a received frame does not decode
    /// - `ClientError::UnexpectedFrame` if the server sent a client-only or
    ///   cluster frame
    pub fn handle(&mut self, event: ClientEvent<E::Instant>) -> Result<Vec<ClientAction>, ClientError> {
        match event {
            ClientEvent::Connected => Ok(self.handle_connected()),
            ClientEvent::Disconnected => {
                self.handle_disconnected();
                Ok(Vec::new())
            },
            ClientEvent::FrameReceived(frame) => self.handle_frame(&frame),
            ClientEvent::Send { content } => Ok(self.handle_send(content)),
            ClientEvent::Tick { now } => Ok(self.handle_tick(now)),
        }
    }

    fn handle_connected(&mut self) -> Vec<ClientAction> {
        self.connected = true;

        let hello = Payload::Hello(Hello {
            server_offset: self.seen.watermark(),
            resume_session: self.session_id,
        });
        let mut actions = Vec::new();
        match hello.into_frame(0) {
            Ok(frame) => actions.push(ClientAction::Send(frame)),
            Err(e) => actions.push(ClientAction::Log { message: format!("failed to encode hello: {e}") }),
        }

        let now = self.env.now();
        let request_ids: Vec<u32> = self.pending.keys().copied().collect();
        for request_id in request_ids {
            actions.extend(self.transmit(request_id, now));
        }
        actions
    }

    fn handle_disconnected(&mut self) {
        self.connected = false;
        for pending in self.pending.values_mut() {
            pending.sent_at = None;
        }
    }

    fn handle_send(&mut self, content: String) -> Vec<ClientAction> {
        let request_id = self.allocate_request_id();
        self.counter += 1;
        let dedup_token = format!("{:016x}-{}", self.client_id, self.counter);

        self.pending
            .insert(request_id, PendingSubmit { content, dedup_token, retries_used: 0, sent_at: None });

        if !self.connected {
            return Vec::new();
        }
        let now = self.env.now();
        self.transmit(request_id, now)
    }

    fn handle_tick(&mut self, now: E::Instant) -> Vec<ClientAction> {
        let expired: Vec<u32> = self
            .pending
            .iter()
            // A tick may carry an instant older than the last transmit.
            .filter(|(_, p)| p.sent_at.is_some_and(|sent| now >= sent && now - sent >= self.config.ack_timeout))
            .map(|(id, _)| *id)
            .collect();

        let mut actions = Vec::new();
        for request_id in expired {
            let Some(pending) = self.pending.get_mut(&request_id) else {
                continue;
            };

            if pending.retries_used >= self.config.retries {
                if let Some(pending) = self.pending.remove(&request_id) {
                    actions.push(ClientAction::Unsent {
                        request_id,
                        content: pending.content,
                        dedup_token: pending.dedup_token,
                    });
                }
                continue;
            }

            pending.retries_used += 1;
            actions.push(ClientAction::Log {
                message: format!(
                    "no ack for request {request_id}, resending (attempt {})",
                    pending.retries_used + 1
                ),
            });
            actions.extend(self.transmit(request_id, now));
        }
        actions
    }

    fn handle_frame(&mut self, frame: &Frame) -> Result<Vec<ClientAction>, ClientError> {
        let request_id = frame.header.request_id();
        let action = match Payload::from_frame(frame)? {
            Payload::Welcome(welcome) => {
                self.session_id = Some(welcome.session_id);
                ClientAction::Welcome {
                    session_id: welcome.session_id,
                    worker_id: welcome.worker_id,
                    recovered: welcome.recovered,
                    text: welcome.text,
                }
            },
            Payload::Notice(notice) => ClientAction::Notice { text: notice.text },
            Payload::Ack => match self.pending.remove(&request_id) {
                Some(pending) => {
                    ClientAction::Acknowledged { request_id, dedup_token: pending.dedup_token }
                },
                None => ClientAction::Log { message: format!("ack for unknown request {request_id}") },
            },
            Payload::ChatMessage(message) => {
                if self.seen.insert(message.offset) {
                    ClientAction::Deliver { content: message.content, offset: message.offset }
                } else {
                    ClientAction::Log { message: format!("dropping duplicate offset {}", message.offset) }
                }
            },
            Payload::RecoveryIncomplete(notice) => ClientAction::RecoveryIncomplete {
                resume_from: notice.resume_from,
                reason: notice.reason,
            },
            Payload::Error(error) => ClientAction::ServerError { code: error.code, message: error.message },
            other => return Err(ClientError::UnexpectedFrame { opcode: other.opcode().to_u16() }),
        };
        Ok(vec![action])
    }

    /// Put a pending submission on the wire and restart its timer.
    fn transmit(&mut self, request_id: u32, now: E::Instant) -> Vec<ClientAction> {
        if !self.connected {
            if let Some(pending) = self.pending.get_mut(&request_id) {
                pending.sent_at = None;
            }
            return Vec::new();
        }
        let Some(pending) = self.pending.get_mut(&request_id) else {
            return Vec::new();
        };

        let submit = Payload::Submit(Submit {
            content: pending.content.clone(),
            dedup_token: Some(pending.dedup_token.clone()),
        });
        pending.sent_at = Some(now);

        match submit.into_frame(request_id) {
            Ok(frame) => vec![ClientAction::Send(frame)],
            Err(e) => vec![ClientAction::Log { message: format!("failed to encode submit: {e}") }],
        }
    }

    fn allocate_request_id(&mut self) -> u32 {
        // Zero is the "no request" id; skip it and anything still pending.
        loop {
            let id = self.next_request;
            self.next_request = self.next_request.wrapping_add(1);
            if id != 0 && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use skein_proto::{ChatMessage, ErrorPayload, Opcode, RecoveryIncomplete, Welcome};

    use super::*;

    #[derive(Clone, Default)]
    struct TestEnv {
        millis: Arc<AtomicU64>,
        seed: Arc<AtomicU64>,
    }

    impl TestEnv {
        fn advance(&self, duration: Duration) -> Duration {
            let millis = u64::try_from(duration.as_millis()).unwrap();
            Duration::from_millis(self.millis.fetch_add(millis, Ordering::SeqCst) + millis)
        }
    }

    impl Environment for TestEnv {
        type Instant = Duration;

        fn now(&self) -> Duration {
            Duration::from_millis(self.millis.load(Ordering::SeqCst))
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            std::future::ready(())
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            let value = self.seed.fetch_add(1, Ordering::SeqCst) + 0xABCD;
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = value.to_be_bytes()[i % 8];
            }
        }
    }

    fn client() -> (Client<TestEnv>, TestEnv) {
        let env = TestEnv::default();
        (Client::new(env.clone(), ClientConfig::default()), env)
    }

    fn frames(actions: &[ClientAction]) -> Vec<Payload> {
        actions
            .iter()
            .filter_map(|a| match a {
                ClientAction::Send(frame) => Some(Payload::from_frame(frame).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn incoming(payload: Payload, request_id: u32) -> ClientEvent<Duration> {
        ClientEvent::FrameReceived(payload.into_frame(request_id).unwrap())
    }

    fn submitted(actions: &[ClientAction]) -> Vec<(u32, Submit)> {
        actions
            .iter()
            .filter_map(|a| match a {
                ClientAction::Send(frame) if frame.header.opcode_enum() == Some(Opcode::Submit) => {
                    match Payload::from_frame(frame).unwrap() {
                        Payload::Submit(submit) => Some((frame.header.request_id(), submit)),
                        _ => None,
                    }
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn connect_sends_hello_with_watermark() {
        let (mut client, _) = client();
        let actions = client.handle(ClientEvent::Connected).unwrap();

        assert_eq!(
            frames(&actions),
            vec![Payload::Hello(Hello { server_offset: 0, resume_session: None })]
        );
    }

    #[test]
    fn reconnect_presents_session_and_contiguous_offset() {
        let (mut client, _) = client();
        client.handle(ClientEvent::Connected).unwrap();
        client
            .handle(incoming(
                Payload::Welcome(Welcome { session_id: 77, worker_id: 1, recovered: false, text: "hi".into() }),
                0,
            ))
            .unwrap();
        for offset in [1, 2, 4] {
            client
                .handle(incoming(Payload::ChatMessage(ChatMessage { content: "m".into(), offset }), 0))
                .unwrap();
        }
        client.handle(ClientEvent::Disconnected).unwrap();

        let actions = client.handle(ClientEvent::Connected).unwrap();
        assert_eq!(
            frames(&actions),
            vec![Payload::Hello(Hello { server_offset: 2, resume_session: Some(77) })]
        );
    }

    #[test]
    fn tokens_are_unique_and_prefixed_by_client_id() {
        let (mut client, _) = client();
        client.handle(ClientEvent::Connected).unwrap();

        let a = client.handle(ClientEvent::Send { content: "a".into() }).unwrap();
        let b = client.handle(ClientEvent::Send { content: "b".into() }).unwrap();
        let (id_a, sub_a) = submitted(&a).remove(0);
        let (id_b, sub_b) = submitted(&b).remove(0);

        assert_ne!(id_a, id_b);
        let prefix = format!("{:016x}-", client.client_id());
        assert_eq!(sub_a.dedup_token.unwrap(), format!("{prefix}1"));
        assert_eq!(sub_b.dedup_token.unwrap(), format!("{prefix}2"));
    }

    #[test]
    fn ack_clears_pending() {
        let (mut client, _) = client();
        client.handle(ClientEvent::Connected).unwrap();
        let actions = client.handle(ClientEvent::Send { content: "hello".into() }).unwrap();
        let (request_id, submit) = submitted(&actions).remove(0);

        let actions = client.handle(incoming(Payload::Ack, request_id)).unwrap();
        assert_eq!(
            actions,
            vec![ClientAction::Acknowledged { request_id, dedup_token: submit.dedup_token.unwrap() }]
        );
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn missing_ack_resends_same_token_then_gives_up() {
        let (mut client, env) = client();
        client.handle(ClientEvent::Connected).unwrap();
        let actions = client.handle(ClientEvent::Send { content: "hello".into() }).unwrap();
        let (request_id, first) = submitted(&actions).remove(0);

        for _ in 0..DEFAULT_RETRIES {
            let now = env.advance(DEFAULT_ACK_TIMEOUT);
            let actions = client.handle(ClientEvent::Tick { now }).unwrap();
            let resent = submitted(&actions);
            assert_eq!(resent, vec![(request_id, first.clone())]);
        }

        let now = env.advance(DEFAULT_ACK_TIMEOUT);
        let actions = client.handle(ClientEvent::Tick { now }).unwrap();
        assert_eq!(
            actions,
            vec![ClientAction::Unsent {
                request_id,
                content: "hello".into(),
                dedup_token: first.dedup_token.unwrap(),
            }]
        );
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn tick_before_timeout_does_nothing() {
        let (mut client, env) = client();
        client.handle(ClientEvent::Connected).unwrap();
        client.handle(ClientEvent::Send { content: "hello".into() }).unwrap();

        let now = env.advance(DEFAULT_ACK_TIMEOUT - Duration::from_millis(1));
        assert!(client.handle(ClientEvent::Tick { now }).unwrap().is_empty());
    }

    #[test]
    fn tick_older_than_last_transmit_is_ignored() {
        let (mut client, env) = client();
        env.advance(Duration::from_secs(5));
        client.handle(ClientEvent::Connected).unwrap();
        client.handle(ClientEvent::Send { content: "hello".into() }).unwrap();

        let stale = Duration::from_secs(1);
        assert!(client.handle(ClientEvent::Tick { now: stale }).unwrap().is_empty());
        assert_eq!(client.pending_count(), 1);

        let now = env.advance(DEFAULT_ACK_TIMEOUT);
        assert_eq!(submitted(&client.handle(ClientEvent::Tick { now }).unwrap()).len(), 1);
    }

    #[test]
    fn offline_sends_go_out_after_hello() {
        let (mut client, _) = client();
        assert!(client.handle(ClientEvent::Send { content: "queued".into() }).unwrap().is_empty());

        let actions = client.handle(ClientEvent::Connected).unwrap();
        let payloads = frames(&actions);
        assert!(matches!(payloads[0], Payload::Hello(_)));
        assert!(matches!(&payloads[1], Payload::Submit(s) if s.content == "queued"));
    }

    #[test]
    fn reconnect_resends_unacknowledged_with_same_token() {
        let (mut client, _) = client();
        client.handle(ClientEvent::Connected).unwrap();
        let actions = client.handle(ClientEvent::Send { content: "hello".into() }).unwrap();
        let before = submitted(&actions);

        client.handle(ClientEvent::Disconnected).unwrap();
        let actions = client.handle(ClientEvent::Connected).unwrap();
        assert_eq!(submitted(&actions), before);
    }

    #[test]
    fn duplicate_offsets_are_delivered_once() {
        let (mut client, _) = client();
        let message = Payload::ChatMessage(ChatMessage { content: "hello".into(), offset: 1 });

        let first = client.handle(incoming(message.clone(), 0)).unwrap();
        assert_eq!(first, vec![ClientAction::Deliver { content: "hello".into(), offset: 1 }]);

        let second = client.handle(incoming(message, 0)).unwrap();
        assert!(matches!(second.as_slice(), [ClientAction::Log { .. }]));
    }

    #[test]
    fn server_signals_are_surfaced() {
        let (mut client, _) = client();

        let actions = client
            .handle(incoming(
                Payload::RecoveryIncomplete(RecoveryIncomplete { resume_from: 4, reason: "down".into() }),
                0,
            ))
            .unwrap();
        assert_eq!(actions, vec![ClientAction::RecoveryIncomplete { resume_from: 4, reason: "down".into() }]);

        let actions = client.handle(incoming(Payload::Error(ErrorPayload::overloaded(1)), 0)).unwrap();
        assert!(matches!(
            actions.as_slice(),
            [ClientAction::ServerError { code: ErrorPayload::OVERLOADED, .. }]
        ));
    }

    #[test]
    fn cluster_frames_are_rejected() {
        let (mut client, _) = client();
        let result = client.handle(incoming(
            Payload::ReadRequest(skein_proto::ReadRequest { after: 0, limit: 1 }),
            0,
        ));
        assert!(matches!(result, Err(ClientError::UnexpectedFrame { .. })));
    }
}
