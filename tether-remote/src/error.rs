//! Error types for remote calls.

use thiserror::Error;

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors returned by remote collaborators.
///
/// Payloads are strings so that one error can be handed to every caller
/// waiting on the same request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The addressed row or blob does not exist (on paths where absence is
    /// not a normal outcome).
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing or rejected credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Non-success HTTP status.
    #[error("http error {status}: {message}")]
    Http { status: u16, message: String },

    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// The response body could not be interpreted.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The request was rejected before being sent.
    #[error("validation error: {0}")]
    Validation(String),

    /// Failure injected by the in-memory backend.
    #[error("injected failure: {0}")]
    Injected(String),
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        RemoteError::Serialization(e.to_string())
    }
}

impl From<tether_types::Error> for RemoteError {
    fn from(e: tether_types::Error) -> Self {
        RemoteError::Validation(e.to_string())
    }
}
