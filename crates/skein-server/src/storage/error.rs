//! Storage error types.

use thiserror::Error;

/// Errors returned by [`Storage`](super::Storage) implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The dedup token is already recorded. Nothing was written.
    ///
    /// Benign: the submitter is acknowledged as if the append succeeded.
    #[error("duplicate dedup token {token:?} (stored at offset {offset})")]
    Duplicate {
        /// The rejected token
        token: String,
        /// Offset of the record that already carries it
        offset: u64,
    },

    /// The backing store failed. The write may or may not have happened.
    #[error("storage i/o error: {0}")]
    Io(String),

    /// A stored record could not be encoded or decoded.
    #[error("storage serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Returns true if retrying the same operation may succeed.
    ///
    /// Duplicates are final: the record exists. Serialization errors mean a
    /// corrupt record and will not fix themselves.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
