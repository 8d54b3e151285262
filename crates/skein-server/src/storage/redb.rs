//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Each
//! append is one write transaction covering the record, its dedup token and
//! the offset counter, so a crash either keeps all three or none.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use super::{Storage, StorageError, StoredMessage};

/// Table: messages
/// Key: offset
/// Value: CBOR-encoded `StoredRecord`
const MESSAGES: TableDefinition<u64, &[u8]> = TableDefinition::new("messages");

/// Table: dedup_tokens
/// Key: dedup token
/// Value: offset of the record carrying it
const DEDUP_TOKENS: TableDefinition<&str, u64> = TableDefinition::new("dedup_tokens");

/// Table: meta
/// Key: "next_offset"
/// Value: next offset to assign
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_OFFSET_KEY: &str = "next_offset";

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    content: String,
    dedup_token: Option<String>,
}

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc). Redb
/// holds an exclusive lock on the file, so exactly one process opens it.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

fn io_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Io(e.to_string())
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates the tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io_error)?;

        let txn = db.begin_write().map_err(io_error)?;
        {
            let _ = txn.open_table(MESSAGES).map_err(io_error)?;
            let _ = txn.open_table(DEDUP_TOKENS).map_err(io_error)?;
            let _ = txn.open_table(META).map_err(io_error)?;
        }
        txn.commit().map_err(io_error)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl Storage for RedbStorage {
    fn append(&self, content: &str, dedup_token: Option<&str>) -> Result<u64, StorageError> {
        let record =
            StoredRecord { content: content.to_string(), dedup_token: dedup_token.map(str::to_string) };
        let mut bytes = Vec::with_capacity(content.len() + 32);
        ciborium::into_writer(&record, &mut bytes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let txn = self.db.begin_write().map_err(io_error)?;

        let offset = {
            let mut tokens = txn.open_table(DEDUP_TOKENS).map_err(io_error)?;
            if let Some(token) = dedup_token
                && let Some(existing) = tokens.get(token).map_err(io_error)?
            {
                // Dropping the transaction without commit aborts it.
                return Err(StorageError::Duplicate {
                    token: token.to_string(),
                    offset: existing.value(),
                });
            }

            let mut meta = txn.open_table(META).map_err(io_error)?;
            let offset = meta.get(NEXT_OFFSET_KEY).map_err(io_error)?.map_or(1, |v| v.value());
            meta.insert(NEXT_OFFSET_KEY, offset + 1).map_err(io_error)?;

            let mut messages = txn.open_table(MESSAGES).map_err(io_error)?;
            messages.insert(offset, bytes.as_slice()).map_err(io_error)?;

            if let Some(token) = dedup_token {
                tokens.insert(token, offset).map_err(io_error)?;
            }

            offset
        };

        txn.commit().map_err(io_error)?;

        Ok(offset)
    }

    fn load_after(&self, after: u64, limit: usize) -> Result<Vec<StoredMessage>, StorageError> {
        let Some(start) = after.checked_add(1) else {
            return Ok(Vec::new());
        };

        let txn = self.db.begin_read().map_err(io_error)?;
        let table = txn.open_table(MESSAGES).map_err(io_error)?;

        let mut messages = Vec::with_capacity(limit.min(1024));
        for result in table.range(start..).map_err(io_error)? {
            if messages.len() >= limit {
                break;
            }

            let (key, value) = result.map_err(io_error)?;
            let record: StoredRecord = ciborium::from_reader(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            messages.push(StoredMessage {
                offset: key.value(),
                content: record.content,
                dedup_token: record.dedup_token,
            });
        }

        Ok(messages)
    }

    fn latest_offset(&self) -> Result<Option<u64>, StorageError> {
        let txn = self.db.begin_read().map_err(io_error)?;
        let table = txn.open_table(MESSAGES).map_err(io_error)?;

        Ok(table.last().map_err(io_error)?.map(|(key, _)| key.value()))
    }

    fn offset_for_token(&self, token: &str) -> Result<Option<u64>, StorageError> {
        let txn = self.db.begin_read().map_err(io_error)?;
        let table = txn.open_table(DEDUP_TOKENS).map_err(io_error)?;

        Ok(table.get(token).map_err(io_error)?.map(|v| v.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("log.redb")).unwrap();

        assert_eq!(storage.append("a", Some("t1")).unwrap(), 1);
        assert_eq!(storage.append("b", None).unwrap(), 2);

        let page = storage.load_after(0, 10).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "a");
        assert_eq!(page[0].dedup_token.as_deref(), Some("t1"));
        assert_eq!(page[1].offset, 2);
    }

    #[test]
    fn duplicate_does_not_consume_an_offset() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("log.redb")).unwrap();

        storage.append("a", Some("t1")).unwrap();
        assert!(matches!(
            storage.append("a", Some("t1")),
            Err(StorageError::Duplicate { offset: 1, .. })
        ));
        assert_eq!(storage.append("b", None).unwrap(), 2);
    }

    #[test]
    fn load_after_max_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("log.redb")).unwrap();
        storage.append("a", None).unwrap();

        assert!(storage.load_after(u64::MAX, 10).unwrap().is_empty());
    }
}
