//! Simulated environment: virtual clock and seeded randomness.

#![allow(clippy::disallowed_types, reason = "Synchronous RNG access only")]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use skein_core::Environment;

/// Deterministic [`Environment`].
///
/// Time is a [`Duration`] since the start of the run and only moves when the
/// test calls [`SimEnv::advance`]. Clones share the clock and the RNG, so one
/// seed fixes every session id and client id in a run.
#[derive(Clone)]
pub struct SimEnv {
    micros: Arc<AtomicU64>,
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEnv {
    /// Environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with an explicit seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            micros: Arc::new(AtomicU64::new(0)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }

    /// Move the clock forward. Returns the new time.
    pub fn advance(&self, by: Duration) -> Duration {
        let step = u64::try_from(by.as_micros()).unwrap_or(u64::MAX);
        let before = self.micros.fetch_add(step, Ordering::SeqCst);
        Duration::from_micros(before.saturating_add(step))
    }
}

impl Environment for SimEnv {
    type Instant = Duration;

    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        // Under turmoil, tokio's clock is the simulated one.
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        #[allow(clippy::expect_used)]
        self.rng.lock().expect("rng mutex poisoned").fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_only_moves_when_advanced() {
        let env = SimEnv::new();
        assert_eq!(env.now(), Duration::ZERO);
        assert_eq!(env.advance(Duration::from_millis(1500)), Duration::from_millis(1500));
        assert_eq!(env.now(), Duration::from_millis(1500));
    }

    #[test]
    fn same_seed_same_ids() {
        let a = SimEnv::with_seed(7);
        let b = SimEnv::with_seed(7);
        let ids_a: Vec<u64> = (0..4).map(|_| a.random_nonzero_u64()).collect();
        let ids_b: Vec<u64> = (0..4).map(|_| b.random_nonzero_u64()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn clones_share_clock() {
        let env = SimEnv::new();
        let other = env.clone();
        env.advance(Duration::from_secs(3));
        assert_eq!(other.now(), Duration::from_secs(3));
    }
}
