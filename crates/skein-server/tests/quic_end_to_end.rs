//! End-to-end tests over real QUIC connections.
//!
//! Most workers run in-process and share one log and one `LocalRelay`. The
//! coordinated cases attach each worker to a TCP coordinator through its own
//! `CoordinatorLink`, the way `serve` wires worker processes.

use std::{sync::Arc, time::Duration};

use skein_client::{
    Client, ClientAction, ClientConfig, ClientEvent,
    transport::{self, ConnectedClient},
};
use skein_server::{
    Coordinator, CoordinatorConfig, CoordinatorLink, DEFAULT_REQUEST_TIMEOUT, DriverConfig, LocalLog,
    LocalRelay, MemoryStorage, MessageLog, Relay, Server, ServerRuntimeConfig, SystemEnv,
};
use tokio::{net::TcpListener, time::timeout};

const STEP: Duration = Duration::from_secs(5);

struct Deployment {
    log: Arc<LocalLog<MemoryStorage>>,
    relay: LocalRelay,
}

impl Deployment {
    fn new() -> Self {
        Self { log: Arc::new(LocalLog::new(MemoryStorage::new())), relay: LocalRelay::new() }
    }

    /// Start a worker and return its address.
    fn start_worker(&self, worker_id: u32) -> String {
        let config = worker_config(worker_id);
        let (relay, relay_rx) = self.relay.attach(worker_id);
        let log: Arc<dyn MessageLog> = self.log.clone();
        let server = Server::bind(config, log, Arc::new(relay), relay_rx).unwrap();
        let addr = server.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let _ = server.run(std::future::pending()).await;
        });
        addr
    }
}

fn worker_config(worker_id: u32) -> ServerRuntimeConfig {
    ServerRuntimeConfig {
        bind_address: "127.0.0.1:0".to_string(),
        tick_interval: Duration::from_millis(50),
        driver: DriverConfig { worker_id, ..DriverConfig::default() },
        ..ServerRuntimeConfig::default()
    }
}

/// Coordinator on a TCP port, workers attached over their own links.
struct Coordinated {
    coordinator: Coordinator<LocalLog<MemoryStorage>>,
    address: String,
}

impl Coordinated {
    async fn start() -> Self {
        let log = Arc::new(LocalLog::new(MemoryStorage::new()));
        let coordinator = Coordinator::new(log, &CoordinatorConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let serving = coordinator.clone();
        tokio::spawn(async move {
            let _ = serving.serve(listener).await;
        });
        Self { coordinator, address }
    }

    /// Start a worker whose log and relay are one coordinator link.
    async fn start_worker(&self, worker_id: u32) -> String {
        let (link, relay_rx, _closed) =
            CoordinatorLink::connect(&self.address, worker_id, DEFAULT_REQUEST_TIMEOUT).await.unwrap();
        let link = Arc::new(link);
        let log: Arc<dyn MessageLog> = link.clone();
        let relay: Arc<dyn Relay> = link;

        let server = Server::bind(worker_config(worker_id), log, relay, relay_rx).unwrap();
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = server.run(std::future::pending()).await;
        });
        addr
    }

    async fn wait_for_workers(&self, count: usize) {
        timeout(STEP, async {
            while self.coordinator.worker_count().await < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("workers never registered");
    }
}

/// A client state machine wired to a live connection.
struct Peer {
    client: Client<SystemEnv>,
    conn: ConnectedClient,
}

impl Peer {
    async fn connect(addr: &str) -> Self {
        let client = Client::new(SystemEnv::new(), ClientConfig::default());
        let conn = transport::connect(addr).await.unwrap();
        let mut peer = Self { client, conn };
        peer.feed(ClientEvent::Connected).await;
        peer
    }

    async fn reconnect(&mut self, addr: &str) {
        self.conn.stop();
        self.client.handle(ClientEvent::Disconnected).unwrap();
        self.conn = transport::connect(addr).await.unwrap();
        self.feed(ClientEvent::Connected).await;
    }

    /// Run the client on `event`, send its frames, return everything else.
    async fn feed(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        let mut rest = Vec::new();
        for action in self.client.handle(event).unwrap() {
            match action {
                ClientAction::Send(frame) => self.conn.to_server.send(frame).await.unwrap(),
                other => rest.push(other),
            }
        }
        rest
    }

    async fn send(&mut self, content: &str) {
        self.feed(ClientEvent::Send { content: content.to_string() }).await;
    }

    /// Next non-log action from the server.
    async fn next(&mut self) -> ClientAction {
        loop {
            let frame = timeout(STEP, self.conn.from_server.recv())
                .await
                .expect("timed out waiting for server")
                .expect("connection closed");
            let actions = self.feed(ClientEvent::FrameReceived(frame)).await;
            if let Some(action) =
                actions.into_iter().find(|a| !matches!(a, ClientAction::Log { .. }))
            {
                return action;
            }
        }
    }

    /// Skip actions until one matches.
    async fn until<T>(&mut self, mut pick: impl FnMut(ClientAction) -> Option<T>) -> T {
        loop {
            if let Some(value) = pick(self.next().await) {
                return value;
            }
        }
    }

    async fn welcome(&mut self) -> (u32, bool) {
        match self.next().await {
            ClientAction::Welcome { worker_id, recovered, .. } => (worker_id, recovered),
            other => panic!("expected welcome first, got {other:?}"),
        }
    }

    async fn delivered(&mut self) -> (String, u64) {
        self.until(|a| match a {
            ClientAction::Deliver { content, offset } => Some((content, offset)),
            _ => None,
        })
        .await
    }

    /// True if nothing but logs arrives within `wait`.
    async fn quiet_for(&mut self, wait: Duration) -> bool {
        match timeout(wait, self.conn.from_server.recv()).await {
            Err(_) => true,
            Ok(None) => true,
            Ok(Some(frame)) => self
                .feed(ClientEvent::FrameReceived(frame))
                .await
                .iter()
                .all(|a| matches!(a, ClientAction::Log { .. })),
        }
    }
}

#[tokio::test]
async fn welcome_then_ack_and_fanout() {
    let deployment = Deployment::new();
    let addr = deployment.start_worker(0);

    let mut alice = Peer::connect(&addr).await;
    assert_eq!(alice.welcome().await, (0, false));
    let mut bob = Peer::connect(&addr).await;
    bob.welcome().await;

    alice.send("hello").await;

    alice.until(|a| matches!(a, ClientAction::Acknowledged { .. }).then_some(())).await;
    assert_eq!(alice.client.seen().watermark(), 1);
    assert_eq!(bob.delivered().await, ("hello".to_string(), 1));
    assert_eq!(alice.client.pending_count(), 0);
}

#[tokio::test]
async fn join_notice_stays_on_its_worker() {
    let deployment = Deployment::new();
    let first = deployment.start_worker(0);
    let second = deployment.start_worker(1);

    let mut alice = Peer::connect(&first).await;
    alice.welcome().await;

    let mut remote = Peer::connect(&second).await;
    assert_eq!(remote.welcome().await.0, 1);
    assert!(alice.quiet_for(Duration::from_millis(300)).await);

    let mut local = Peer::connect(&first).await;
    local.welcome().await;
    let notice = alice.next().await;
    assert!(matches!(notice, ClientAction::Notice { text } if text.contains("worker 0")));
}

#[tokio::test]
async fn messages_cross_workers() {
    let deployment = Deployment::new();
    let first = deployment.start_worker(0);
    let second = deployment.start_worker(1);

    let mut alice = Peer::connect(&first).await;
    alice.welcome().await;
    let mut bob = Peer::connect(&second).await;
    bob.welcome().await;

    bob.send("from worker 1").await;
    assert_eq!(alice.delivered().await, ("from worker 1".to_string(), 1));

    alice.send("from worker 0").await;
    assert_eq!(bob.delivered().await, ("from worker 0".to_string(), 2));
}

#[tokio::test]
async fn reconnecting_client_receives_missed_messages_in_order() {
    let deployment = Deployment::new();
    let addr = deployment.start_worker(0);

    let mut alice = Peer::connect(&addr).await;
    alice.welcome().await;
    let mut bob = Peer::connect(&addr).await;
    bob.welcome().await;

    bob.send("m1").await;
    assert_eq!(alice.delivered().await.1, 1);

    alice.conn.stop();
    alice.client.handle(ClientEvent::Disconnected).unwrap();

    for text in ["m2", "m3", "m4"] {
        bob.send(text).await;
        bob.until(|a| matches!(a, ClientAction::Acknowledged { .. }).then_some(())).await;
    }

    alice.reconnect(&addr).await;
    alice.welcome().await;

    let mut missed = Vec::new();
    while missed.len() < 3 {
        missed.push(alice.delivered().await);
    }
    assert_eq!(
        missed,
        vec![("m2".to_string(), 2), ("m3".to_string(), 3), ("m4".to_string(), 4)]
    );
    assert_eq!(alice.client.seen().watermark(), 4);
}

#[tokio::test]
async fn fresh_client_replays_whole_log() {
    let deployment = Deployment::new();
    let addr = deployment.start_worker(0);

    let mut alice = Peer::connect(&addr).await;
    alice.welcome().await;
    for text in ["a", "b"] {
        alice.send(text).await;
        alice.until(|a| matches!(a, ClientAction::Acknowledged { .. }).then_some(())).await;
    }

    let mut late = Peer::connect(&addr).await;
    assert_eq!(late.welcome().await, (0, false));
    assert_eq!(late.delivered().await, ("a".to_string(), 1));
    assert_eq!(late.delivered().await, ("b".to_string(), 2));
}

#[tokio::test]
async fn coordinated_workers_share_offsets_and_broadcasts() {
    let cluster = Coordinated::start().await;
    let first = cluster.start_worker(0).await;
    let second = cluster.start_worker(1).await;
    cluster.wait_for_workers(2).await;

    let mut alice = Peer::connect(&first).await;
    assert_eq!(alice.welcome().await, (0, false));
    let mut bob = Peer::connect(&second).await;
    assert_eq!(bob.welcome().await, (1, false));

    alice.send("from worker 0").await;
    assert_eq!(bob.delivered().await, ("from worker 0".to_string(), 1));
    assert_eq!(alice.delivered().await, ("from worker 0".to_string(), 1));

    bob.send("from worker 1").await;
    assert_eq!(alice.delivered().await, ("from worker 1".to_string(), 2));
    assert_eq!(bob.delivered().await, ("from worker 1".to_string(), 2));

    // No further chat traffic for alice.
    assert!(alice.quiet_for(Duration::from_millis(300)).await);
    assert_eq!(alice.client.seen().watermark(), 2);

    let mut late = Peer::connect(&second).await;
    late.welcome().await;
    assert_eq!(late.delivered().await, ("from worker 0".to_string(), 1));
    assert_eq!(late.delivered().await, ("from worker 1".to_string(), 2));
}
