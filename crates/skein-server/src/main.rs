//! skein server binary.
//!
//! # Usage
//!
//! ```bash
//! # One process, one worker (development)
//! skein-server standalone --bind 0.0.0.0:4433 --db skein.redb
//!
//! # Coordinator + one worker per core on ports 4433, 4434, ...
//! skein-server serve --base-port 4433 --db skein.redb --cert cert.pem --key key.pem
//! ```
//!
//! `worker` is spawned by `serve` and not meant to be run by hand.

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use skein_core::SessionConfig;
use skein_server::{
    Coordinator, CoordinatorConfig, CoordinatorLink, DEFAULT_REQUEST_TIMEOUT, DriverConfig,
    LocalLog, LocalRelay, RedbStorage, Server, ServerError, ServerRuntimeConfig, Supervisor,
    SupervisorConfig, SystemEnv,
};
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// skein chat broadcast server
#[derive(Parser, Debug)]
#[command(name = "skein-server")]
#[command(about = "Real-time chat broadcast with durable recovery")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` overrides.
    #[arg(long, global = true, default_value = "info", env = "SKEIN_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Single process: one worker, local log, in-process relay
    Standalone {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:4433", env = "SKEIN_BIND")]
        bind: String,

        /// Log database path
        #[arg(long, default_value = "skein.redb", env = "SKEIN_DB")]
        db: PathBuf,

        #[command(flatten)]
        worker: WorkerArgs,
    },

    /// Coordinator plus supervised worker processes
    Serve {
        /// Host workers bind on
        #[arg(long, default_value = "0.0.0.0", env = "SKEIN_HOST")]
        host: String,

        /// Worker `i` listens on `base_port + i`
        #[arg(long, default_value = "4433", env = "SKEIN_BASE_PORT")]
        base_port: u16,

        /// Number of workers (defaults to available parallelism)
        #[arg(long, env = "SKEIN_WORKERS")]
        workers: Option<u32>,

        /// Coordinator listen address
        #[arg(long, default_value = "127.0.0.1:4400", env = "SKEIN_COORDINATOR")]
        coordinator: String,

        /// Log database path
        #[arg(long, default_value = "skein.redb", env = "SKEIN_DB")]
        db: PathBuf,

        /// Worker crashes tolerated per restart window
        #[arg(long, default_value = "5", env = "SKEIN_MAX_RESTARTS")]
        max_restarts: usize,

        #[command(flatten)]
        worker: WorkerArgs,
    },

    /// One worker attached to a coordinator (spawned by `serve`)
    #[command(hide = true)]
    Worker {
        /// Worker id
        #[arg(long)]
        worker_id: u32,

        /// Host to bind on
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to bind on
        #[arg(long)]
        port: u16,

        /// Coordinator address
        #[arg(long)]
        coordinator: String,

        #[command(flatten)]
        worker: WorkerArgs,
    },
}

/// Options shared by every worker.
#[derive(Args, Debug, Clone)]
struct WorkerArgs {
    /// Path to TLS certificate (PEM format)
    #[arg(short, long, env = "SKEIN_CERT")]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long, env = "SKEIN_KEY")]
    key: Option<String>,

    /// Maximum concurrent connections per worker
    #[arg(long, default_value = "10000", env = "SKEIN_MAX_CONNECTIONS")]
    max_connections: usize,

    /// Seconds a dropped session stays resumable (0 disables resume)
    #[arg(long, default_value = "120", env = "SKEIN_RECOVERY_WINDOW")]
    recovery_window_secs: u64,

    /// Seconds a new connection has to send its handshake
    #[arg(long, default_value = "30", env = "SKEIN_HANDSHAKE_TIMEOUT")]
    handshake_timeout_secs: u64,
}

impl WorkerArgs {
    fn runtime_config(&self, worker_id: u32, bind_address: String) -> ServerRuntimeConfig {
        ServerRuntimeConfig {
            bind_address,
            cert_path: self.cert.clone(),
            key_path: self.key.clone(),
            driver: DriverConfig {
                worker_id,
                max_connections: self.max_connections,
                recovery_window: Duration::from_secs(self.recovery_window_secs),
                session: SessionConfig { handshake_timeout: Duration::from_secs(self.handshake_timeout_secs) },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Flags forwarded to spawned workers.
    fn forward(&self) -> Vec<String> {
        let mut args = vec![
            "--max-connections".to_string(),
            self.max_connections.to_string(),
            "--recovery-window-secs".to_string(),
            self.recovery_window_secs.to_string(),
            "--handshake-timeout-secs".to_string(),
            self.handshake_timeout_secs.to_string(),
        ];
        if let (Some(cert), Some(key)) = (&self.cert, &self.key) {
            args.extend(["--cert".to_string(), cert.clone(), "--key".to_string(), key.clone()]);
        }
        args
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    match cli.command {
        Command::Standalone { bind, db, worker } => standalone(bind, db, &worker).await?,
        Command::Serve { host, base_port, workers, coordinator, db, max_restarts, worker } => {
            let workers = workers.unwrap_or_else(|| {
                std::thread::available_parallelism().map_or(1, |n| u32::try_from(n.get()).unwrap_or(1))
            });
            let supervisor = SupervisorConfig {
                workers,
                base_port,
                program: std::env::current_exe()?,
                args: [
                    vec![
                        "--log-level".to_string(),
                        cli.log_level.clone(),
                        "worker".to_string(),
                        "--host".to_string(),
                        host,
                        "--coordinator".to_string(),
                        coordinator.clone(),
                    ],
                    worker.forward(),
                ]
                .concat(),
                max_restarts,
                ..Default::default()
            };
            serve(coordinator, db, supervisor).await?;
        },
        Command::Worker { worker_id, host, port, coordinator, worker } => {
            run_worker(worker_id, format!("{host}:{port}"), &coordinator, &worker).await?;
        },
    }

    Ok(())
}

async fn standalone(bind: String, db: PathBuf, args: &WorkerArgs) -> Result<(), ServerError> {
    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("no TLS certificate provided, using self-signed certificate");
    }

    let storage = RedbStorage::open(&db)?;
    tracing::info!(db = %db.display(), "log opened");

    let relay = LocalRelay::new();
    let (handle, relay_rx) = relay.attach(0);

    let server = Server::bind(
        args.runtime_config(0, bind),
        Arc::new(LocalLog::new(storage)),
        Arc::new(handle),
        relay_rx,
    )?;
    tracing::info!(addr = %server.local_addr()?, "standalone server listening");

    server.run(shutdown_signal()).await
}

async fn serve(coordinator_address: String, db: PathBuf, supervisor: SupervisorConfig) -> Result<(), ServerError> {
    let storage = RedbStorage::open(&db)?;
    let config = CoordinatorConfig { bind_address: coordinator_address, ..Default::default() };
    let coordinator = Coordinator::new(Arc::new(LocalLog::new(storage)), &config);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(addr = %config.bind_address, db = %db.display(), workers = supervisor.workers, "coordinator listening");
    let coordinator_task = tokio::spawn(coordinator.serve(listener));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Supervisor::new(SystemEnv::new(), supervisor);
    let mut supervisor_task = tokio::spawn(supervisor.run(shutdown_rx));

    let finished = tokio::select! {
        () = shutdown_signal() => None,
        result = &mut supervisor_task => Some(result),
    };

    match finished {
        Some(result) => {
            result.map_err(|e| ServerError::Internal(e.to_string()))??;
            tracing::error!("all worker slots gave up");
        },
        None => {
            tracing::info!("shutdown requested, stopping workers");
            let _ = shutdown_tx.send(true);
            supervisor_task.await.map_err(|e| ServerError::Internal(e.to_string()))??;
        },
    }

    coordinator_task.abort();
    Ok(())
}

async fn run_worker(
    worker_id: u32,
    bind: String,
    coordinator: &str,
    args: &WorkerArgs,
) -> Result<(), ServerError> {
    let (link, relay_rx, closed) = CoordinatorLink::connect(coordinator, worker_id, DEFAULT_REQUEST_TIMEOUT).await?;
    let link = Arc::new(link);

    let server = Server::bind(args.runtime_config(worker_id, bind), link.clone(), link, relay_rx)?;

    tokio::select! {
        result = server.run(shutdown_signal()) => result,
        cause = closed => {
            let cause = cause.map_err(|e| ServerError::Internal(e.to_string()))?;
            tracing::error!(worker_id, error = %cause, "lost coordinator, exiting");
            Err(ServerError::Cluster(cause))
        },
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
