//! Storage error types.

use thiserror::Error;

/// Errors that can occur in cache and persistence operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error (creating the cache directory, writing content).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The domain has no cache partition.
    #[error("Unknown domain: {0}")]
    UnknownDomain(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
