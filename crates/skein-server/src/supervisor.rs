//! Worker process supervision.
//!
//! One slot per worker. A slot restarts its worker whenever it exits, waiting
//! an exponential backoff between attempts, and gives up once the worker has
//! crashed `max_restarts` times inside `restart_window`.

use std::{
    collections::VecDeque,
    ops::Sub,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use skein_core::Environment;
use tokio::{process::Command, sync::watch, task::JoinSet};

use crate::error::ServerError;

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Number of worker slots
    pub workers: u32,
    /// Worker `i` listens on `base_port + i`
    pub base_port: u16,
    /// Executable to run for each worker
    pub program: PathBuf,
    /// Arguments common to every worker; slot arguments are appended
    pub args: Vec<String>,
    /// First restart delay
    pub backoff_base: Duration,
    /// Upper bound on the restart delay
    pub backoff_cap: Duration,
    /// Crashes tolerated inside `restart_window` before a slot gives up
    pub max_restarts: usize,
    /// Sliding window for counting crashes
    pub restart_window: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            base_port: 4433,
            program: PathBuf::from("skein-server"),
            args: vec!["worker".to_string()],
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
        }
    }
}

impl SupervisorConfig {
    /// Full argument list for one slot.
    pub fn slot_args(&self, slot: u32) -> Result<Vec<String>, ServerError> {
        let port = u16::try_from(u32::from(self.base_port) + slot).map_err(|_| {
            ServerError::Config(format!("worker {slot} port exceeds 65535 (base {})", self.base_port))
        })?;

        let mut args = self.args.clone();
        args.extend(["--worker-id".to_string(), slot.to_string(), "--port".to_string(), port.to_string()]);
        Ok(args)
    }
}

/// Bounded exponential backoff over a sliding crash window.
#[derive(Debug, Clone)]
pub struct RestartPolicy<I> {
    base: Duration,
    cap: Duration,
    max_restarts: usize,
    window: Duration,
    crashes: VecDeque<I>,
}

impl<I> RestartPolicy<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Policy from supervisor configuration.
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            base: config.backoff_base,
            cap: config.backoff_cap,
            max_restarts: config.max_restarts,
            window: config.restart_window,
            crashes: VecDeque::new(),
        }
    }

    /// Record a crash at `now`. Returns the delay before restarting, or
    /// `None` to give up.
    pub fn on_crash(&mut self, now: I) -> Option<Duration> {
        while let Some(&oldest) = self.crashes.front() {
            if now - oldest > self.window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        self.crashes.push_back(now);

        let recent = self.crashes.len();
        if recent > self.max_restarts {
            return None;
        }

        let exponent = u32::try_from(recent - 1).unwrap_or(u32::MAX).min(16);
        Some(self.base.saturating_mul(1 << exponent).min(self.cap))
    }

    /// Crashes inside the current window.
    pub fn recent_crashes(&self) -> usize {
        self.crashes.len()
    }
}

/// Keeps `workers` worker processes running.
pub struct Supervisor<E: Environment> {
    env: E,
    config: SupervisorConfig,
}

impl<E: Environment> Supervisor<E> {
    /// Create a supervisor.
    pub fn new(env: E, config: SupervisorConfig) -> Self {
        Self { env, config }
    }

    /// Run every slot until `shutdown` flips to true or all slots gave up.
    ///
    /// Workers are killed on shutdown.
    ///
    /// # Errors
    ///
    /// - `ServerError::Config` if a slot's port is out of range
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let mut slots = JoinSet::new();
        for slot in 0..self.config.workers {
            let args = self.config.slot_args(slot)?;
            let env = self.env.clone();
            let config = self.config.clone();
            let shutdown = shutdown.clone();
            slots.spawn(supervise_slot(env, config, slot, args, shutdown));
        }

        while slots.join_next().await.is_some() {}
        Ok(())
    }
}

async fn supervise_slot<E: Environment>(
    env: E,
    config: SupervisorConfig,
    slot: u32,
    args: Vec<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut policy = RestartPolicy::new(&config);

    loop {
        if *shutdown.borrow() {
            return;
        }

        match Command::new(&config.program).args(&args).stdin(Stdio::null()).kill_on_drop(true).spawn() {
            Ok(mut child) => {
                tracing::info!(slot, pid = child.id(), "worker started");
                tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) => tracing::warn!(slot, %status, "worker exited"),
                        Err(e) => tracing::warn!(slot, error = %e, "failed to wait for worker"),
                    },
                    _ = shutdown.changed() => {
                        if let Err(e) = child.kill().await {
                            tracing::warn!(slot, error = %e, "failed to kill worker");
                        }
                        tracing::info!(slot, "worker stopped");
                        return;
                    },
                }
            },
            Err(e) => tracing::error!(slot, error = %e, "failed to spawn worker"),
        }

        let Some(delay) = policy.on_crash(env.now()) else {
            tracing::error!(
                slot,
                crashes = policy.recent_crashes(),
                window = ?config.restart_window,
                "worker keeps crashing, giving up on slot"
            );
            return;
        };

        tracing::info!(slot, ?delay, "restarting worker");
        tokio::select! {
            () = env.sleep(delay) => {},
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SystemEnv;

    fn config(max_restarts: usize) -> SupervisorConfig {
        SupervisorConfig {
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(4),
            max_restarts,
            restart_window: Duration::from_secs(60),
            ..Default::default()
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut policy = RestartPolicy::<Duration>::new(&config(10));

        let delays: Vec<_> = (0..6).map(|i| policy.on_crash(Duration::from_secs(i)).unwrap()).collect();
        assert_eq!(delays, vec![
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(4),
            Duration::from_secs(4),
        ]);
    }

    #[test]
    fn gives_up_after_max_restarts_in_window() {
        let mut policy = RestartPolicy::<Duration>::new(&config(2));

        assert!(policy.on_crash(Duration::from_secs(0)).is_some());
        assert!(policy.on_crash(Duration::from_secs(1)).is_some());
        assert_eq!(policy.on_crash(Duration::from_secs(2)), None);
    }

    #[test]
    fn old_crashes_leave_the_window() {
        let mut policy = RestartPolicy::<Duration>::new(&config(2));

        policy.on_crash(Duration::from_secs(0));
        policy.on_crash(Duration::from_secs(1));
        let delay = policy.on_crash(Duration::from_secs(100));

        assert_eq!(delay, Some(Duration::from_millis(500)));
        assert_eq!(policy.recent_crashes(), 1);
    }

    #[test]
    fn slot_args_assign_consecutive_ports() {
        let config = SupervisorConfig { base_port: 5000, ..Default::default() };
        assert_eq!(config.slot_args(2).unwrap(), vec!["worker", "--worker-id", "2", "--port", "5002"]);

        let config = SupervisorConfig { base_port: u16::MAX, ..Default::default() };
        assert!(matches!(config.slot_args(1), Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn crashing_worker_slot_gives_up() {
        let config = SupervisorConfig {
            workers: 1,
            program: PathBuf::from("false"),
            args: Vec::new(),
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
            max_restarts: 2,
            ..Default::default()
        };
        let (_tx, rx) = watch::channel(false);

        let supervisor = Supervisor::new(SystemEnv::new(), config);
        tokio::time::timeout(Duration::from_secs(10), supervisor.run(rx))
            .await
            .expect("slot should give up")
            .unwrap();
    }
}
