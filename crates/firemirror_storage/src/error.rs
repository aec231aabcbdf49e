//! Error types for replica storage.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The persisted artifact failed validation.
    #[error("replica corrupted: {0}")]
    Corrupted(String),

    /// The snapshot could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Another owner holds the exclusivity handle.
    #[error("replica locked: another engine has exclusive access")]
    Locked,

    /// The operation needs the exclusivity handle, which is not held.
    #[error("replica not acquired for writing")]
    NotAcquired,
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}
