//! Error types for the contextual memory engine.

use thiserror::Error;

/// Failures reported by an external provider (embedding or generation).
///
/// These are always recovered locally: callers turn them into a "no result"
/// sentinel and carry on with reduced context.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    /// The provider could not be reached or refused the request.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    /// The provider answered, but the payload did not match the expected shape.
    #[error("malformed provider output: {0}")]
    Malformed(String),
}

/// Errors that can occur in the memory engine.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Database-related errors (SQLite).
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Invalid input provided by the caller.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// A note index that does not exist for the subject.
    #[error("Index {index} out of range ({len} notes)")]
    IndexOutOfRange { index: usize, len: usize },
    /// Embedding or generation failure that the caller asked to see.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    /// JSON encoding/decoding of persisted or exported data.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Configuration file could not be read or parsed.
    #[error("Config error: {0}")]
    Config(String),
}

impl MemoryError {
    /// True for errors caused by the caller (bad index, bad input).
    ///
    /// Validation errors go back to the caller and are not logged as faults.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            MemoryError::InvalidInput(_) | MemoryError::IndexOutOfRange { .. }
        )
    }
}
