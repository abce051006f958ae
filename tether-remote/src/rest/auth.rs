use super::RestClient;
use crate::auth::{AuthApi, AuthEvent};
use crate::error::{RemoteError, RemoteResult};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::json;
use tether_types::EntityId;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: Option<String>,
    user: Option<AuthUser>,
    /// Sign-up without auto-confirm answers with the bare user.
    id: Option<EntityId>,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: EntityId,
}

/// [`AuthApi`] over the GoTrue HTTP API.
#[derive(Clone)]
pub struct RestAuth {
    client: RestClient,
}

impl RestAuth {
    pub fn new(client: RestClient) -> Self {
        Self { client }
    }

    /// Sends a sign-in style request and keeps the returned token.
    async fn start_session(&self, request: RequestBuilder) -> RemoteResult<EntityId> {
        let value = self.client.send_json(request).await?;
        let response: AuthResponse = serde_json::from_value(value)
            .map_err(|e| RemoteError::InvalidResponse(format!("failed to parse auth response: {e}")))?;
        let user_id = response
            .user
            .map(|u| u.id)
            .or(response.id)
            .ok_or_else(|| RemoteError::InvalidResponse("auth response has no user id".into()))?;

        if let Some(token) = response.access_token {
            self.client.set_access_token(token).await;
            info!(%user_id, "signed in");
            let _ = self.client.inner.events.send(AuthEvent::SignedIn(user_id));
        }
        Ok(user_id)
    }
}

#[async_trait]
impl AuthApi for RestAuth {
    async fn request_verification(&self, phone: &str) -> RemoteResult<String> {
        let request = self
            .client
            .request(Method::POST, "/auth/v1/otp")
            .await
            .json(&json!({ "phone": phone }));
        self.client.send(request).await?;
        // OTP verification is keyed by the phone number itself.
        Ok(phone.to_string())
    }

    async fn verify(&self, verification_id: &str, code: &str) -> RemoteResult<EntityId> {
        let request = self
            .client
            .request(Method::POST, "/auth/v1/verify")
            .await
            .json(&json!({ "type": "sms", "phone": verification_id, "token": code }));
        self.start_session(request).await
    }

    async fn sign_in_with_password(&self, phone: &str, password: &str) -> RemoteResult<EntityId> {
        let request = self
            .client
            .request(Method::POST, "/auth/v1/token")
            .await
            .query(&[("grant_type", "password")])
            .json(&json!({ "phone": phone, "password": password }));
        self.start_session(request).await
    }

    async fn sign_up(&self, phone: &str, password: &str) -> RemoteResult<EntityId> {
        let request = self
            .client
            .request(Method::POST, "/auth/v1/signup")
            .await
            .json(&json!({ "phone": phone, "password": password }));
        self.start_session(request).await
    }

    async fn sign_out(&self) -> RemoteResult<()> {
        if !self.client.is_authenticated().await {
            return Ok(());
        }
        let request = self.client.request(Method::POST, "/auth/v1/logout").await;
        let result = self.client.send(request).await.map(|_| ());

        // A 401 above already dropped the token and announced it.
        if self.client.take_token().await.is_some() {
            info!("signed out");
            let _ = self.client.inner.events.send(AuthEvent::SignedOut);
        }
        result
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.client.inner.events.subscribe()
    }
}
