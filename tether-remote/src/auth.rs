//! Authentication seam.

use crate::error::RemoteResult;
use async_trait::async_trait;
use tether_types::EntityId;
use tokio::sync::broadcast;

/// State change pushed by the auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(EntityId),
    /// The credentials are gone: a manual sign-out, or a revocation the
    /// client did not ask for.
    SignedOut,
}

/// Remote authentication operations.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Sends a one-time code to `phone`. Returns the verification handle to
    /// pass to [`AuthApi::verify`].
    async fn request_verification(&self, phone: &str) -> RemoteResult<String>;

    /// Completes an OTP sign-in, returning the signed-in user id.
    async fn verify(&self, verification_id: &str, code: &str) -> RemoteResult<EntityId>;

    async fn sign_in_with_password(&self, phone: &str, password: &str) -> RemoteResult<EntityId>;

    async fn sign_up(&self, phone: &str, password: &str) -> RemoteResult<EntityId>;

    /// Ends the remote session. Local credentials are dropped even when the
    /// call fails.
    async fn sign_out(&self) -> RemoteResult<()>;

    /// Subscribes to auth state pushes.
    fn auth_events(&self) -> broadcast::Receiver<AuthEvent>;
}
