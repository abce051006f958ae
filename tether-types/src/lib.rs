//! Core type definitions for tether.
//!
//! This crate defines the types shared by the cache, the remote collaborators
//! and the sync layer:
//! - Entity identifiers (UUID)
//! - Flat field records as exchanged with the remote store
//! - Row-level remote changes pushed by the realtime feed
//! - Session and pending verification values
//! - Storage bucket paths

mod blob;
mod change;
mod ids;
mod record;
mod session;

pub use blob::{BlobPath, FileRef, ImageFormat};
pub use change::{ChangeKind, ChangeKinds, RemoteChange};
pub use ids::{EntityId, TableId};
pub use record::{ID_FIELD, Record};
pub use session::{Session, Verification};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("invalid blob key: {0}")]
    InvalidBlobKey(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl From<uuid::Error> for Error {
    fn from(e: uuid::Error) -> Self {
        Error::InvalidUuid(e.to_string())
    }
}
