//! Production environment: wall-clock time, tokio sleep and OS entropy.
//!
//! Behaviour under `SystemEnv` is not reproducible. Deterministic runs use the
//! simulated environment from the harness instead.

use std::time::Duration;

use skein_core::Environment;

/// Production environment.
///
/// # Panics
///
/// `random_bytes` panics if the OS RNG fails. Session and client ids come
/// from it and a worker without entropy cannot hand out unique ids.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}
