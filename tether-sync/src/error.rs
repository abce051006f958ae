//! Error types for the sync layer.

use tether_cache::CacheError;
use tether_remote::RemoteError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
///
/// `Clone` so one failed load can be delivered to every attached caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// No active session for an operation that requires one.
    #[error("not authorized")]
    NotAuthorized,

    /// The verification code was rejected.
    #[error("the code is invalid")]
    InvalidCode,

    /// A required entity is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transport or backend failure.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Malformed input (blob key, record, image).
    #[error("validation error: {0}")]
    Validation(String),

    /// Local cache failure.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// The load was superseded or cancelled.
    #[error("load cancelled")]
    Cancelled,

    /// Session persistence failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// Whether this is a cancellation rather than a failure. Cancellations
    /// are not meant to reach the user.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

impl From<tether_types::Error> for SyncError {
    fn from(e: tether_types::Error) -> Self {
        SyncError::Validation(e.to_string())
    }
}
