//! Storage abstraction for the durable message log.
//!
//! Trait-based so the worker runs on redb in production and on an in-memory
//! store in tests and simulation. The trait is synchronous; async callers go
//! through [`LocalLog`](crate::log::LocalLog), which moves calls onto tokio's
//! blocking pool.

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use serde::{Deserialize, Serialize};

pub use self::redb::RedbStorage;

/// One record of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Offset assigned at append time. Starts at 1.
    pub offset: u64,
    /// Message text
    pub content: String,
    /// Dedup token supplied by the submitter
    pub dedup_token: Option<String>,
}

/// Append-only message store with unique dedup tokens.
///
/// Must be Clone (shared between the log and test oracles), Send + Sync, and
/// synchronous. Implementations share internal state via Arc, so clones see
/// the same records.
///
/// # Invariants
///
/// - Offsets are assigned by the store, start at 1 and strictly increase.
///   An offset is never reused, even after a restart.
/// - At most one record carries a given dedup token.
/// - Offsets are assigned in commit order: once offset `n` is visible to a
///   reader, every stored offset below `n` is too.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Append a record and return its offset.
    ///
    /// # Errors
    ///
    /// - `StorageError::Duplicate` if `dedup_token` is already recorded
    /// - `StorageError::Io` if the write failed
    fn append(&self, content: &str, dedup_token: Option<&str>) -> Result<u64, StorageError>;

    /// Records with offset strictly greater than `after`, ascending, at most
    /// `limit` of them.
    fn load_after(&self, after: u64, limit: usize) -> Result<Vec<StoredMessage>, StorageError>;

    /// Highest assigned offset. `None` if nothing was ever stored.
    fn latest_offset(&self) -> Result<Option<u64>, StorageError>;

    /// Offset of the record carrying `token`, if any.
    fn offset_for_token(&self, token: &str) -> Result<Option<u64>, StorageError>;
}
