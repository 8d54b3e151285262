//! Whole-deployment simulation.
//!
//! [`SimCluster`] runs several [`ServerDriver`]s (one per worker) and several
//! [`Client`]s against one shared log, with no async runtime and no sockets.
//! Every frame, log call and relay hop is a queued work item processed in
//! FIFO order, so per-connection ordering holds the way it does on a QUIC
//! stream and a whole run replays exactly from its seed.
//!
//! Tests drive it with [`SimCluster::connect`], [`SimCluster::send`],
//! [`SimCluster::advance`] and friends, then step the queue either one item
//! at a time ([`SimCluster::step`]) or until nothing is left
//! ([`SimCluster::run_until_quiet`]).

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::Duration,
};

use skein_client::{Client, ClientAction, ClientConfig, ClientEvent};
use skein_core::Environment;
use skein_proto::{BroadcastEvent, Frame, Opcode, Payload};
use skein_server::{
    ChaoticStorage, DriverConfig, LogError, LogLevel, MemoryStorage, ServerAction, ServerDriver,
    ServerEvent, Storage, storage::StoredMessage,
};

use crate::SimEnv;

/// Deployment shape and fault rates.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Worker processes
    pub workers: usize,
    /// Clients
    pub clients: usize,
    /// Seed for ids and storage faults
    pub seed: u64,
    /// Probability a log call fails outright
    pub failure_rate: f64,
    /// Probability a committed append reports failure
    pub ack_loss_rate: f64,
    /// Records per replay page
    pub replay_page: usize,
    /// Template for every worker's driver config (`worker_id` is overwritten)
    pub driver: DriverConfig,
    /// Client config
    pub client: ClientConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            clients: 3,
            seed: 0,
            failure_rate: 0.0,
            ack_loss_rate: 0.0,
            replay_page: 4,
            driver: DriverConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

/// Kind of work item a [`SimCluster::step`] processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    /// Frame from a client reached its worker
    ToServer,
    /// Frame from a worker reached its client
    ToClient,
    /// Log append finished
    Append,
    /// Replay page read
    Replay,
    /// Broadcast reached another worker
    Relay,
    /// Worker closed a connection
    Close,
}

enum Work {
    ToServer { worker: usize, session_id: u64, frame: Frame },
    ToClient { client: usize, worker: usize, session_id: u64, frame: Frame },
    Append { worker: usize, session_id: u64, request_id: u32, content: String, dedup_token: Option<String> },
    Replay { worker: usize, session_id: u64, after: u64 },
    Relay { worker: usize, event: BroadcastEvent },
    Close { worker: usize, session_id: u64 },
}

impl Work {
    fn kind(&self) -> WorkKind {
        match self {
            Self::ToServer { .. } => WorkKind::ToServer,
            Self::ToClient { .. } => WorkKind::ToClient,
            Self::Append { .. } => WorkKind::Append,
            Self::Replay { .. } => WorkKind::Replay,
            Self::Relay { .. } => WorkKind::Relay,
            Self::Close { .. } => WorkKind::Close,
        }
    }
}

/// What one client observed. Everything invariants need to judge a run.
#[derive(Debug, Clone, Default)]
pub struct Observed {
    /// Delivered chat messages in arrival order
    pub delivered: Vec<(String, u64)>,
    /// Notices, tagged with the worker the client was connected to
    pub notices: Vec<(usize, String)>,
    /// Welcomes: worker id and recovered flag
    pub welcomes: Vec<(u32, bool)>,
    /// Every submission this client sent: token to content
    pub submitted: BTreeMap<String, String>,
    /// Acknowledged dedup tokens
    pub acked: Vec<String>,
    /// Dedup tokens given up on
    pub unsent: Vec<String>,
    /// `RecoveryIncomplete` signals
    pub incomplete: usize,
    /// Error codes from the server
    pub errors: Vec<u16>,
    /// Connections whose first frame was neither `Welcome` nor `Error`
    pub welcome_not_first: usize,
}

/// One simulated client.
pub struct SimClient {
    /// The state machine
    pub client: Client<SimEnv>,
    /// Live connection: worker index and session id
    pub connection: Option<(usize, u64)>,
    /// What it saw
    pub observed: Observed,
    /// No frame received yet on the current connection
    awaiting_first: bool,
}

/// Deterministic multi-worker deployment.
pub struct SimCluster {
    env: SimEnv,
    chaotic: ChaoticStorage<MemoryStorage>,
    store: MemoryStorage,
    chaos: bool,
    replay_page: usize,
    workers: Vec<ServerDriver<SimEnv>>,
    clients: Vec<SimClient>,
    links: HashMap<(usize, u64), usize>,
    queue: VecDeque<Work>,
}

impl SimCluster {
    /// Build a deployment. Clients start disconnected.
    pub fn new(config: ClusterConfig) -> Self {
        let env = SimEnv::with_seed(config.seed);
        let store = MemoryStorage::new();
        let chaotic =
            ChaoticStorage::with_seed(store.clone(), config.failure_rate, config.ack_loss_rate, config.seed);

        let workers = (0..config.workers)
            .map(|i| {
                let driver = DriverConfig { worker_id: i as u32, ..config.driver.clone() };
                ServerDriver::new(env.clone(), driver)
            })
            .collect();

        let clients = (0..config.clients)
            .map(|_| SimClient {
                client: Client::new(env.clone(), config.client.clone()),
                connection: None,
                observed: Observed::default(),
                awaiting_first: false,
            })
            .collect();

        Self {
            env,
            chaotic,
            store,
            chaos: true,
            replay_page: config.replay_page.max(1),
            workers,
            clients,
            links: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Shared environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Turn storage fault injection on or off.
    pub fn set_chaos(&mut self, enabled: bool) {
        self.chaos = enabled;
    }

    /// All clients.
    pub fn clients(&self) -> &[SimClient] {
        &self.clients
    }

    /// One client.
    pub fn client(&self, index: usize) -> &SimClient {
        &self.clients[index]
    }

    /// One worker's driver.
    pub fn worker(&self, index: usize) -> &ServerDriver<SimEnv> {
        &self.workers[index]
    }

    /// Number of workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Everything in the log, in offset order.
    pub fn log(&self) -> Vec<StoredMessage> {
        self.store.messages()
    }

    /// Highest offset in the log (0 if empty).
    pub fn head(&self) -> u64 {
        self.store.latest_offset().ok().flatten().unwrap_or(0)
    }

    /// Append directly to the log, bypassing every worker.
    pub fn append_offline(&mut self, content: &str) -> u64 {
        self.store.append(content, None).unwrap_or(0)
    }

    /// Queued work items.
    pub fn pending_work(&self) -> usize {
        self.queue.len()
    }

    /// Open a connection from `client` to `worker`, closing any current one.
    pub fn connect(&mut self, client: usize, worker: usize) {
        self.disconnect(client);

        let session_id = self.env.random_nonzero_u64();
        self.links.insert((worker, session_id), client);
        self.clients[client].connection = Some((worker, session_id));
        self.clients[client].awaiting_first = true;

        self.drive(worker, ServerEvent::ConnectionAccepted { session_id });
        self.feed_client(client, ClientEvent::Connected);
    }

    /// Drop `client`'s connection, as if the network went away.
    pub fn disconnect(&mut self, client: usize) {
        let Some((worker, session_id)) = self.clients[client].connection.take() else {
            return;
        };
        self.links.remove(&(worker, session_id));
        self.feed_client(client, ClientEvent::Disconnected);
        self.drive(worker, ServerEvent::ConnectionClosed { session_id, reason: "network lost".into() });
    }

    /// Have `client` submit `content`.
    pub fn send(&mut self, client: usize, content: &str) {
        self.feed_client(client, ClientEvent::Send { content: content.to_string() });
    }

    /// Move time forward and tick every worker and client.
    pub fn advance(&mut self, by: Duration) {
        let now = self.env.advance(by);
        for worker in 0..self.workers.len() {
            self.drive(worker, ServerEvent::Tick);
        }
        for client in 0..self.clients.len() {
            self.feed_client(client, ClientEvent::Tick { now });
        }
    }

    /// Process the oldest work item.
    pub fn step(&mut self) -> Option<WorkKind> {
        let work = self.queue.pop_front()?;
        let kind = work.kind();
        self.process(work);
        Some(kind)
    }

    /// Step until the queue is empty or `max_steps` ran. Returns steps taken.
    pub fn run_until_quiet(&mut self, max_steps: usize) -> usize {
        let mut steps = 0;
        while steps < max_steps && self.step().is_some() {
            steps += 1;
        }
        steps
    }

    /// Step until a work item of `kind` was processed.
    pub fn step_through(&mut self, kind: WorkKind) -> bool {
        while let Some(done) = self.step() {
            if done == kind {
                return true;
            }
        }
        false
    }

    fn process(&mut self, work: Work) {
        match work {
            Work::ToServer { worker, session_id, frame } => {
                if self.links.contains_key(&(worker, session_id)) {
                    self.drive(worker, ServerEvent::FrameReceived { session_id, frame });
                }
            },
            Work::ToClient { client, worker, session_id, frame } => {
                if self.links.get(&(worker, session_id)) == Some(&client) {
                    self.client_received(client, worker, frame);
                }
            },
            Work::Append { worker, session_id, request_id, content, dedup_token } => {
                let result = if self.chaos {
                    self.chaotic.append(&content, dedup_token.as_deref())
                } else {
                    self.store.append(&content, dedup_token.as_deref())
                }
                .map_err(LogError::from);
                self.drive(worker, ServerEvent::AppendCompleted { session_id, request_id, content, result });
            },
            Work::Replay { worker, session_id, after } => {
                let read = if self.chaos {
                    self.chaotic.load_after(after, self.replay_page)
                } else {
                    self.store.load_after(after, self.replay_page)
                };
                let event = match read {
                    Ok(records) => ServerEvent::ReplayPage {
                        session_id,
                        exhausted: records.len() < self.replay_page,
                        messages: records
                            .into_iter()
                            .map(|r| skein_proto::ChatMessage { content: r.content, offset: r.offset })
                            .collect(),
                    },
                    Err(e) => ServerEvent::ReplayFailed { session_id, reason: LogError::from(e).to_string() },
                };
                self.drive(worker, event);
            },
            Work::Relay { worker, event } => {
                self.drive(worker, ServerEvent::RelayReceived { event });
            },
            Work::Close { worker, session_id } => {
                if let Some(client) = self.links.remove(&(worker, session_id)) {
                    self.clients[client].connection = None;
                    self.feed_client(client, ClientEvent::Disconnected);
                    self.drive(worker, ServerEvent::ConnectionClosed { session_id, reason: "closed by worker".into() });
                }
            },
        }
    }

    fn drive(&mut self, worker: usize, event: ServerEvent) {
        let actions = match self.workers[worker].process_event(event) {
            Ok(actions) => actions,
            Err(e) => {
                tracing::debug!(worker, error = %e, "driver rejected event");
                return;
            },
        };

        for action in actions {
            match action {
                ServerAction::SendToSession { session_id, frame } => {
                    if let Some(&client) = self.links.get(&(worker, session_id)) {
                        self.queue.push_back(Work::ToClient { client, worker, session_id, frame });
                    }
                },
                ServerAction::AppendToLog { session_id, request_id, content, dedup_token } => {
                    self.queue.push_back(Work::Append { worker, session_id, request_id, content, dedup_token });
                },
                ServerAction::ReadReplay { session_id, after } => {
                    self.queue.push_back(Work::Replay { worker, session_id, after });
                },
                ServerAction::Publish { event } => {
                    for other in (0..self.workers.len()).filter(|&w| w != worker) {
                        self.queue.push_back(Work::Relay { worker: other, event: event.clone() });
                    }
                },
                ServerAction::CloseConnection { session_id, .. } => {
                    self.queue.push_back(Work::Close { worker, session_id });
                },
                ServerAction::Log { level, message } => match level {
                    LogLevel::Debug => tracing::debug!(worker, "{}", message),
                    LogLevel::Info => tracing::info!(worker, "{}", message),
                    LogLevel::Warn => tracing::warn!(worker, "{}", message),
                    LogLevel::Error => tracing::error!(worker, "{}", message),
                },
            }
        }
    }

    fn client_received(&mut self, client: usize, worker: usize, frame: Frame) {
        let sim = &mut self.clients[client];
        if std::mem::take(&mut sim.awaiting_first)
            && !matches!(frame.header.opcode_enum(), Some(Opcode::Welcome | Opcode::Error))
        {
            sim.observed.welcome_not_first += 1;
        }

        let event = ClientEvent::FrameReceived(frame);
        match sim.client.handle(event) {
            Ok(actions) => self.apply_client_actions(client, worker, actions),
            Err(e) => tracing::warn!(client, error = %e, "client rejected frame"),
        }
    }

    fn feed_client(&mut self, client: usize, event: ClientEvent<Duration>) {
        let worker = self.clients[client].connection.map_or(usize::MAX, |(w, _)| w);
        match self.clients[client].client.handle(event) {
            Ok(actions) => self.apply_client_actions(client, worker, actions),
            Err(e) => tracing::warn!(client, error = %e, "client rejected event"),
        }
    }

    fn apply_client_actions(&mut self, client: usize, worker: usize, actions: Vec<ClientAction>) {
        let sim = &mut self.clients[client];
        for action in actions {
            match action {
                ClientAction::Send(frame) => {
                    if let Ok(Payload::Submit(submit)) = Payload::from_frame(&frame)
                        && let Some(token) = submit.dedup_token
                    {
                        sim.observed.submitted.insert(token, submit.content);
                    }
                    if let Some((worker, session_id)) = sim.connection {
                        self.queue.push_back(Work::ToServer { worker, session_id, frame });
                    }
                },
                ClientAction::Welcome { worker_id, recovered, .. } => {
                    sim.observed.welcomes.push((worker_id, recovered));
                },
                ClientAction::Notice { text } => sim.observed.notices.push((worker, text)),
                ClientAction::Deliver { content, offset } => sim.observed.delivered.push((content, offset)),
                ClientAction::Acknowledged { dedup_token, .. } => sim.observed.acked.push(dedup_token),
                ClientAction::Unsent { dedup_token, .. } => sim.observed.unsent.push(dedup_token),
                ClientAction::RecoveryIncomplete { .. } => sim.observed.incomplete += 1,
                ClientAction::ServerError { code, .. } => sim.observed.errors.push(code),
                ClientAction::Log { message } => tracing::trace!(client, "{}", message),
            }
        }
    }
}
