//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (time, randomness). The
//! worker runs on the system clock and OS entropy; the simulation harness
//! substitutes a virtual clock and a seeded RNG so whole deployments replay
//! bit-for-bit.

use std::{fmt::Debug, time::Duration};

/// Abstract environment providing time, randomness, and async primitives.
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses OS entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production uses `std::time::Instant`, simulation uses a virtual
    /// duration since the start of the run.
    type Instant: Copy + Ord + Send + Sync + Debug + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only runtime code awaits this; state machines take time as input.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    ///
    /// Given the same seed, a simulated environment produces the same
    /// sequence.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    ///
    /// Used for session ids and client ids.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random non-zero `u64`.
    ///
    /// Zero is reserved as "no id" on the wire.
    fn random_nonzero_u64(&self) -> u64 {
        loop {
            let value = self.random_u64();
            if value != 0 {
                return value;
            }
        }
    }
}
