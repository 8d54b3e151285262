#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use super::{Storage, StorageError, StoredMessage};

/// In-memory storage for tests and simulation.
///
/// Records live in a `Vec` in offset order, so `load_after` is a binary search
/// plus a slice copy. Uses `lock().expect()`, which panics on a poisoned mutex
/// - acceptable for test code.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

struct MemoryStorageInner {
    /// Records in ascending offset order
    messages: Vec<StoredMessage>,

    /// Dedup token -> offset
    tokens: HashMap<String, u64>,

    /// Next offset to assign
    next_offset: u64,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStorageInner {
                messages: Vec::new(),
                tokens: HashMap::new(),
                next_offset: 1,
            })),
        }
    }

    /// Number of stored records.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn message_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").messages.len()
    }

    /// Snapshot of every stored record.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn messages(&self) -> Vec<StoredMessage> {
        self.inner.lock().expect("Mutex poisoned").messages.clone()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    #[allow(clippy::expect_used)]
    fn append(&self, content: &str, dedup_token: Option<&str>) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        if let Some(token) = dedup_token
            && let Some(&offset) = inner.tokens.get(token)
        {
            return Err(StorageError::Duplicate { token: token.to_string(), offset });
        }

        let offset = inner.next_offset;
        inner.next_offset += 1;

        if let Some(token) = dedup_token {
            inner.tokens.insert(token.to_string(), offset);
        }
        inner.messages.push(StoredMessage {
            offset,
            content: content.to_string(),
            dedup_token: dedup_token.map(str::to_string),
        });

        debug_assert!(inner.messages.windows(2).all(|w| w[0].offset < w[1].offset));

        Ok(offset)
    }

    #[allow(clippy::expect_used)]
    fn load_after(&self, after: u64, limit: usize) -> Result<Vec<StoredMessage>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        let start = inner.messages.partition_point(|message| message.offset <= after);
        Ok(inner.messages[start..].iter().take(limit).cloned().collect())
    }

    #[allow(clippy::expect_used)]
    fn latest_offset(&self) -> Result<Option<u64>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.messages.last().map(|message| message.offset))
    }

    #[allow(clippy::expect_used)]
    fn offset_for_token(&self, token: &str) -> Result<Option<u64>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.tokens.get(token).copied())
    }
}
