//! Chaotic storage wrapper for fault injection testing
//!
//! Randomly fails operations to exercise the no-ack/retry path. Besides plain
//! failures it can lose the acknowledgement of a committed append: the record
//! is stored but the caller sees an I/O error, which is exactly the case dedup
//! tokens exist for.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{Arc, Mutex};

use super::{Storage, StorageError, StoredMessage};

/// Chaotic storage wrapper that randomly injects failures
///
/// Delegates to an underlying storage implementation. Uses a seeded LCG so
/// chaos runs are reproducible.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Probability an operation fails before touching the store
    failure_rate: f64,
    /// Probability a successful append reports failure anyway
    ack_loss_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Operation counter
    operation_count: Arc<Mutex<usize>>,
}

/// Linear congruential generator: fast, deterministic, good enough for
/// fault injection.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }

    fn roll(&mut self, rate: f64) -> bool {
        self.next() < rate
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Create a chaotic wrapper with the default seed and no ack loss.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0.0, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit rates and seed for reproducible chaos.
    ///
    /// # Panics
    ///
    /// Panics if either rate is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, ack_loss_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );
        assert!(
            (0.0..=1.0).contains(&ack_loss_rate),
            "ack_loss_rate must be between 0.0 and 1.0, got {ack_loss_rate}"
        );

        Self {
            inner,
            failure_rate,
            ack_loss_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        #[allow(clippy::expect_used)]
        *self.operation_count.lock().expect("operation_count mutex poisoned")
    }

    fn increment_operation_count(&self) {
        #[allow(clippy::expect_used)]
        let mut count = self.operation_count.lock().expect("operation_count mutex poisoned");
        *count += 1;
    }

    fn roll(&self, rate: f64) -> bool {
        #[allow(clippy::expect_used)]
        self.rng.lock().expect("ChaoticRng mutex poisoned").roll(rate)
    }

    fn injected() -> StorageError {
        StorageError::Io("chaotic failure injection".to_string())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn append(&self, content: &str, dedup_token: Option<&str>) -> Result<u64, StorageError> {
        self.increment_operation_count();
        if self.roll(self.failure_rate) {
            return Err(Self::injected());
        }
        let offset = self.inner.append(content, dedup_token)?;
        if self.roll(self.ack_loss_rate) {
            return Err(StorageError::Io("chaotic ack loss after commit".to_string()));
        }
        Ok(offset)
    }

    fn load_after(&self, after: u64, limit: usize) -> Result<Vec<StoredMessage>, StorageError> {
        self.increment_operation_count();
        if self.roll(self.failure_rate) {
            return Err(Self::injected());
        }
        self.inner.load_after(after, limit)
    }

    fn latest_offset(&self) -> Result<Option<u64>, StorageError> {
        self.increment_operation_count();
        if self.roll(self.failure_rate) {
            return Err(Self::injected());
        }
        self.inner.latest_offset()
    }

    fn offset_for_token(&self, token: &str) -> Result<Option<u64>, StorageError> {
        self.increment_operation_count();
        if self.roll(self.failure_rate) {
            return Err(Self::injected());
        }
        self.inner.offset_for_token(token)
    }
}
