//! Error types for the cache.

use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur in cache operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The record cannot be keyed (missing or malformed `id`).
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// The mutation queue has shut down.
    #[error("cache mutation queue is closed")]
    Closed,
}

impl From<tether_types::Error> for CacheError {
    fn from(e: tether_types::Error) -> Self {
        CacheError::InvalidRecord(e.to_string())
    }
}
