//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A document or snapshot could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The storage file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The connection is closed.
    #[error("storage connection is closed")]
    Closed,

    /// A document does not carry a string value at the primary path.
    #[error("document has no primary key at path '{path}'")]
    MissingPrimaryKey {
        /// The configured primary path.
        path: String,
    },

    /// Another connection holds the collection's exclusive lock.
    #[error("collection is locked by another connection: {path}")]
    Locked {
        /// Path of the lock file.
        path: PathBuf,
    },
}

impl StorageError {
    /// Creates a missing primary key error.
    pub fn missing_primary_key(path: impl Into<String>) -> Self {
        Self::MissingPrimaryKey { path: path.into() }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Returns a short stable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::Io(_) => "io",
            StorageError::Serialization(_) => "serialization",
            StorageError::Corrupted(_) => "corrupted",
            StorageError::Closed => "closed",
            StorageError::MissingPrimaryKey { .. } => "missing-primary-key",
            StorageError::Locked { .. } => "locked",
        }
    }
}
