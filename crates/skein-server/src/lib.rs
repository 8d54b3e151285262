//! skein broadcast worker, coordinator and supervisor.
//!
//! # Architecture
//!
//! The [`ServerDriver`] is pure: it turns [`ServerEvent`]s into
//! [`ServerAction`]s and never touches I/O. [`Server`] is the production
//! runtime around it. One event loop task owns the driver and the [`Hub`];
//! connection readers, log calls and the relay feed events into that loop, so
//! all per-worker state is touched from a single task.
//!
//! # Components
//!
//! - [`ServerDriver`]: submission, recovery and fan-out decisions
//! - [`Server`]: QUIC runtime executing driver actions
//! - [`MessageLog`]: durable log ([`LocalLog`] in-process, [`CoordinatorLink`]
//!   across processes)
//! - [`Relay`]: cross-worker broadcast ([`LocalRelay`], [`CoordinatorLink`])
//! - [`Coordinator`]: log authority and relay hub for multi-process mode
//! - [`Supervisor`]: restarts crashed worker processes with backoff

mod cluster;
mod driver;
mod error;
mod hub;
mod log;
mod relay;
mod resume;
pub mod storage;
mod supervisor;
mod system_env;
mod transport;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

pub use cluster::{Coordinator, CoordinatorConfig, CoordinatorLink, DEFAULT_REQUEST_TIMEOUT, LinkClosed};
pub use driver::{DriverConfig, LogLevel, ServerAction, ServerDriver, ServerEvent};
pub use error::{ClusterError, DriverError, ServerError};
pub use hub::{Hub, Outbound};
pub use log::{DEFAULT_REPLAY_PAGE, LocalLog, LogError, MessageLog, Replay};
pub use relay::{LocalRelay, LocalRelayHandle, Relay, RelayReceiver};
pub use resume::{DEFAULT_RECOVERY_WINDOW, DEFAULT_RESUME_BUFFER, ParkedSession, ResumeCache};
use skein_core::{Environment, read_frame};
pub use storage::{ChaoticStorage, MemoryStorage, RedbStorage, Storage, StorageError};
pub use supervisor::{RestartPolicy, Supervisor, SupervisorConfig};
pub use system_env::SystemEnv;
use tokio::sync::mpsc;
pub use transport::{QuinnConnection, QuinnTransport};

/// Interval between driver ticks (handshake timeouts, resume expiry).
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:4433")
    pub bind_address: String,
    /// Path to TLS certificate (PEM format)
    pub cert_path: Option<String>,
    /// Path to TLS private key (PEM format)
    pub key_path: Option<String>,
    /// Records fetched per replay page
    pub replay_page: usize,
    /// Driver tick interval
    pub tick_interval: Duration,
    /// Driver configuration (worker id, timeouts, limits)
    pub driver: DriverConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4433".to_string(),
            cert_path: None,
            key_path: None,
            replay_page: DEFAULT_REPLAY_PAGE,
            tick_interval: DEFAULT_TICK_INTERVAL,
            driver: DriverConfig::default(),
        }
    }
}

/// Inputs to the worker event loop.
enum Input {
    /// A connection opened its session stream
    Connected { session_id: u64, queue: mpsc::UnboundedSender<Outbound> },
    /// Anything else the driver consumes
    Event(ServerEvent),
}

/// Production worker.
///
/// Wraps [`ServerDriver`] with the QUIC transport, a [`MessageLog`] and a
/// [`Relay`].
pub struct Server {
    driver: ServerDriver<SystemEnv>,
    transport: QuinnTransport,
    log: Arc<dyn MessageLog>,
    relay: Arc<dyn Relay>,
    relay_rx: RelayReceiver,
    env: SystemEnv,
    replay_page: usize,
    tick_interval: Duration,
}

impl Server {
    /// Bind a worker.
    ///
    /// # Errors
    ///
    /// - `ServerError::Config` / `ServerError::Transport` if the QUIC
    ///   endpoint cannot be set up
    pub fn bind(
        config: ServerRuntimeConfig,
        log: Arc<dyn MessageLog>,
        relay: Arc<dyn Relay>,
        relay_rx: RelayReceiver,
    ) -> Result<Self, ServerError> {
        let env = SystemEnv::new();
        let transport = QuinnTransport::bind(
            &config.bind_address,
            config.cert_path.as_deref(),
            config.key_path.as_deref(),
        )?;
        let driver = ServerDriver::new(env.clone(), config.driver);

        Ok(Self {
            driver,
            transport,
            log,
            relay,
            relay_rx,
            env,
            replay_page: config.replay_page.max(1),
            tick_interval: config.tick_interval,
        })
    }

    /// Local address the worker is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Run until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> Result<(), ServerError> {
        let Self { mut driver, transport, log, relay, mut relay_rx, env, replay_page, tick_interval } = self;

        tracing::info!(
            worker_id = driver.worker_id(),
            addr = %transport.local_addr()?,
            "worker listening"
        );

        let transport = Arc::new(transport);
        let (inputs, mut inputs_rx) = mpsc::unbounded_channel::<Input>();
        let handshake_timeout = driver.handshake_timeout();

        let acceptor = tokio::spawn(accept_loop(Arc::clone(&transport), env, inputs.clone(), handshake_timeout));

        let mut hub = Hub::new();
        let executor = Executor { log, relay, inputs, replay_page };
        let mut tick = tokio::time::interval(tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            let event = tokio::select! {
                Some(input) = inputs_rx.recv() => match input {
                    Input::Connected { session_id, queue } => {
                        hub.insert(session_id, queue);
                        ServerEvent::ConnectionAccepted { session_id }
                    },
                    Input::Event(event) => {
                        if let ServerEvent::ConnectionClosed { session_id, .. } = &event {
                            hub.remove(*session_id);
                        }
                        event
                    },
                },
                Some(event) = relay_rx.recv() => ServerEvent::RelayReceived { event },
                _ = tick.tick() => ServerEvent::Tick,
                () = &mut shutdown => break,
            };

            match driver.process_event(event) {
                Ok(actions) => executor.execute(&mut hub, actions),
                Err(e) => tracing::warn!(error = %e, "driver rejected event"),
            }
        }

        tracing::info!(worker_id = driver.worker_id(), sessions = hub.len(), "worker shutting down");
        acceptor.abort();
        transport.close();
        Ok(())
    }
}

/// Executes driver actions against the hub, the log and the relay.
struct Executor {
    log: Arc<dyn MessageLog>,
    relay: Arc<dyn Relay>,
    inputs: mpsc::UnboundedSender<Input>,
    replay_page: usize,
}

impl Executor {
    fn execute(&self, hub: &mut Hub, actions: Vec<ServerAction>) {
        for action in actions {
            match action {
                ServerAction::SendToSession { session_id, frame } => {
                    if !hub.send(session_id, frame) {
                        tracing::trace!(session_id, "send to closed session dropped");
                    }
                },
                ServerAction::AppendToLog { session_id, request_id, content, dedup_token } => {
                    let log = Arc::clone(&self.log);
                    let inputs = self.inputs.clone();
                    tokio::spawn(async move {
                        let result = log.append(content.clone(), dedup_token).await;
                        let _ = inputs.send(Input::Event(ServerEvent::AppendCompleted {
                            session_id,
                            request_id,
                            content,
                            result,
                        }));
                    });
                },
                ServerAction::ReadReplay { session_id, after } => {
                    let mut replay = Replay::new(Arc::clone(&self.log), after, self.replay_page);
                    let inputs = self.inputs.clone();
                    tokio::spawn(async move {
                        let event = match replay.next_page().await {
                            Ok(page) => ServerEvent::ReplayPage {
                                session_id,
                                messages: page.unwrap_or_default(),
                                exhausted: replay.is_exhausted(),
                            },
                            Err(e) => ServerEvent::ReplayFailed { session_id, reason: e.to_string() },
                        };
                        let _ = inputs.send(Input::Event(event));
                    });
                },
                ServerAction::Publish { event } => {
                    if let Err(e) = self.relay.publish(event) {
                        tracing::warn!(error = %e, "relay publish failed");
                    }
                },
                ServerAction::CloseConnection { session_id, reason } => {
                    tracing::info!(session_id, %reason, "closing connection");
                    hub.close(session_id, reason);
                },
                ServerAction::Log { level, message } => match level {
                    LogLevel::Debug => tracing::debug!("{}", message),
                    LogLevel::Info => tracing::info!("{}", message),
                    LogLevel::Warn => tracing::warn!("{}", message),
                    LogLevel::Error => tracing::error!("{}", message),
                },
            }
        }
    }
}

async fn accept_loop(
    transport: Arc<QuinnTransport>,
    env: SystemEnv,
    inputs: mpsc::UnboundedSender<Input>,
    handshake_timeout: Duration,
) {
    loop {
        match transport.accept().await {
            Ok(connection) => {
                let session_id = env.random_nonzero_u64();
                let inputs = inputs.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(session_id, connection, inputs, handshake_timeout).await {
                        tracing::debug!(session_id, error = %e, "connection ended");
                    }
                });
            },
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }
}

/// Read frames from one client until its stream or connection ends.
async fn handle_connection(
    session_id: u64,
    connection: QuinnConnection,
    inputs: mpsc::UnboundedSender<Input>,
    handshake_timeout: Duration,
) -> Result<(), ServerError> {
    tracing::debug!(session_id, remote = %connection.remote_addr(), "connection accepted");

    let (send, mut recv) = tokio::time::timeout(handshake_timeout, connection.accept_bi())
        .await
        .map_err(|_| {
            connection.close("handshake timeout");
            ServerError::Transport("client never opened a session stream".to_string())
        })??;

    let (queue, queue_rx) = mpsc::unbounded_channel();
    tokio::spawn(hub::connection_writer(session_id, connection.clone(), send, queue_rx));

    if inputs.send(Input::Connected { session_id, queue }).is_err() {
        connection.close("shutting down");
        return Ok(());
    }

    let reason = loop {
        match read_frame(&mut recv).await {
            Ok(Some(frame)) => {
                if inputs.send(Input::Event(ServerEvent::FrameReceived { session_id, frame })).is_err() {
                    break "shutting down".to_string();
                }
            },
            Ok(None) => break "client finished stream".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    let _ = inputs.send(Input::Event(ServerEvent::ConnectionClosed { session_id, reason }));
    Ok(())
}
