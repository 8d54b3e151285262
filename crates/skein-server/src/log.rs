//! Async durable log.
//!
//! [`MessageLog`] is what the worker runtime talks to. [`LocalLog`] wraps a
//! [`Storage`] backend in the same process; the coordinator link implements
//! the same trait over the network so workers never open the database
//! themselves.

use std::sync::Arc;

use async_trait::async_trait;
use skein_proto::ChatMessage;
use thiserror::Error;

use crate::storage::{Storage, StorageError};

/// Default number of records fetched per replay page.
pub const DEFAULT_REPLAY_PAGE: usize = 256;

/// Errors returned by a [`MessageLog`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// Dedup token already recorded. Benign: acknowledge the submitter.
    #[error("duplicate submission {token:?}")]
    Duplicate {
        /// The rejected token
        token: String,
        /// Offset of the earlier record, when known
        offset: Option<u64>,
    },

    /// The log could not be reached or failed. Withhold the ack.
    #[error("log unavailable: {0}")]
    Unavailable(String),
}

impl From<StorageError> for LogError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Duplicate { token, offset } => Self::Duplicate { token, offset: Some(offset) },
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Durable ordered log with dedup-token enforcement.
#[async_trait]
pub trait MessageLog: Send + Sync + 'static {
    /// Append a message and return its offset.
    ///
    /// # Errors
    ///
    /// - `LogError::Duplicate` if `dedup_token` is already recorded
    /// - `LogError::Unavailable` on any other failure
    async fn append(&self, content: String, dedup_token: Option<String>) -> Result<u64, LogError>;

    /// Up to `limit` messages with offset strictly greater than `after`, in
    /// ascending order.
    async fn read_after(&self, after: u64, limit: usize) -> Result<Vec<ChatMessage>, LogError>;
}

/// Lazy, paged, restartable read of everything after an offset.
///
/// Each [`next_page`](Replay::next_page) call reads the log again from the
/// cursor, so appends that land mid-replay may or may not show up. Restart
/// from any point with [`Replay::new`] and the last delivered offset.
pub struct Replay<L: MessageLog + ?Sized> {
    log: Arc<L>,
    cursor: u64,
    page_size: usize,
    exhausted: bool,
}

impl<L: MessageLog + ?Sized> Replay<L> {
    /// Replay messages with offset strictly greater than `after`.
    pub fn new(log: Arc<L>, after: u64, page_size: usize) -> Self {
        Self { log, cursor: after, page_size: page_size.max(1), exhausted: false }
    }

    /// Last offset handed out (or the start offset).
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Whether the head of the log was reached.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Next page in ascending order. `None` once the head was reached.
    ///
    /// Only an empty page marks the head: a log may return fewer records
    /// than asked for (the coordinator caps reads) with more still behind
    /// them. A failed read leaves the cursor where it was, so calling again
    /// retries the same page.
    pub async fn next_page(&mut self) -> Result<Option<Vec<ChatMessage>>, LogError> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self.log.read_after(self.cursor, self.page_size).await?;

        if page.is_empty() {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            debug_assert!(last.offset > self.cursor);
            self.cursor = last.offset;
        }

        Ok(Some(page))
    }
}

/// [`MessageLog`] over a [`Storage`] backend in this process.
///
/// Storage calls are synchronous, so they run on tokio's blocking pool.
#[derive(Clone)]
pub struct LocalLog<S: Storage> {
    storage: S,
}

impl<S: Storage> LocalLog<S> {
    /// Wrap a storage backend.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// The underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }
}

#[async_trait]
impl<S: Storage> MessageLog for LocalLog<S> {
    async fn append(&self, content: String, dedup_token: Option<String>) -> Result<u64, LogError> {
        let storage = self.storage.clone();
        let offset = tokio::task::spawn_blocking(move || {
            storage.append(&content, dedup_token.as_deref())
        })
        .await
        .map_err(|e| LogError::Unavailable(format!("storage task failed: {e}")))??;

        Ok(offset)
    }

    async fn read_after(&self, after: u64, limit: usize) -> Result<Vec<ChatMessage>, LogError> {
        let storage = self.storage.clone();
        let records = tokio::task::spawn_blocking(move || storage.load_after(after, limit))
            .await
            .map_err(|e| LogError::Unavailable(format!("storage task failed: {e}")))??;

        Ok(records
            .into_iter()
            .map(|record| ChatMessage { content: record.content, offset: record.offset })
            .collect())
    }
}
