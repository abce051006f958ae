//! Authenticated session and pending verification values.

use crate::EntityId;
use serde::{Deserialize, Serialize};

/// The authenticated user's session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Session {
    /// Identifier of the signed-in user's row.
    pub user_id: EntityId,
    /// Login used to sign in (a phone number for OTP sign-in).
    pub login: String,
}

impl Session {
    pub fn new(user_id: EntityId, login: impl Into<String>) -> Self {
        Self {
            user_id,
            login: login.into(),
        }
    }
}

/// A pending sign-in, produced by starting a sign-in and consumed by the
/// matching verify call. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Verification {
    /// Opaque handle issued by the auth layer.
    pub id: String,
    /// Login the verification was requested for.
    pub login: String,
}

impl Verification {
    pub fn new(id: impl Into<String>, login: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            login: login.into(),
        }
    }
}
