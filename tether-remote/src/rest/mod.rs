//! HTTP adapter for a PostgREST / GoTrue / storage backend.
//!
//! One [`RestClient`] owns the HTTP client and the session token.
//! [`RestStore`] and [`RestAuth`] are views over it, so a token obtained by
//! signing in is used by every subsequent store request, and a `401` seen by
//! the store signs the auth side out.

mod auth;
mod store;

pub use auth::RestAuth;
pub use store::RestStore;

use crate::auth::AuthEvent;
use crate::error::{RemoteError, RemoteResult};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

/// Connection settings for the REST backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    /// Project URL, e.g. `https://abc.supabase.co`.
    pub base_url: String,
    /// Public API key sent as `apikey` on every request.
    pub api_key: String,
    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            api_key: String::new(),
            timeout_secs: 30,
        }
    }
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

struct Inner {
    config: RestConfig,
    http: Client,
    token: RwLock<Option<String>>,
    events: broadcast::Sender<AuthEvent>,
}

/// Shared HTTP client and session token.
#[derive(Clone)]
pub struct RestClient {
    inner: Arc<Inner>,
}

impl RestClient {
    pub fn new(config: RestConfig) -> RemoteResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to create HTTP client: {e}")))?;
        let (events, _) = broadcast::channel(16);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                http,
                token: RwLock::new(None),
                events,
            }),
        })
    }

    /// Row and blob operations.
    pub fn store(&self) -> RestStore {
        RestStore::new(self.clone())
    }

    /// Auth operations.
    pub fn auth(&self) -> RestAuth {
        RestAuth::new(self.clone())
    }

    pub fn config(&self) -> &RestConfig {
        &self.inner.config
    }

    /// Installs a token obtained elsewhere (e.g. a restored session).
    pub async fn set_access_token(&self, token: impl Into<String>) {
        *self.inner.token.write().await = Some(token.into());
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.token.read().await.is_some()
    }

    async fn take_token(&self) -> Option<String> {
        self.inner.token.write().await.take()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.inner.config.base_url.trim_end_matches('/'), path)
    }

    /// Starts a request carrying the API key and the session token (or the
    /// API key when signed out).
    async fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let bearer = self
            .inner
            .token
            .read()
            .await
            .clone()
            .unwrap_or_else(|| self.inner.config.api_key.clone());
        self.inner
            .http
            .request(method, self.url(path))
            .header("apikey", &self.inner.config.api_key)
            .bearer_auth(bearer)
    }

    async fn execute(&self, request: RequestBuilder) -> RemoteResult<Response> {
        request
            .send()
            .await
            .map_err(|e| RemoteError::Network(format!("request failed: {e}")))
    }

    /// Sends `request`, mapping non-success statuses to errors.
    async fn send(&self, request: RequestBuilder) -> RemoteResult<Response> {
        let response = self.execute(request).await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(self.error_from(response).await)
        }
    }

    async fn send_json(&self, request: RequestBuilder) -> RemoteResult<Value> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("failed to parse response: {e}")))
    }

    async fn error_from(&self, response: Response) -> RemoteError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body);
        debug!(status = status.as_u16(), %message, "request rejected");

        match status {
            StatusCode::UNAUTHORIZED => {
                self.revoke().await;
                RemoteError::Unauthorized(message)
            }
            StatusCode::FORBIDDEN => RemoteError::Unauthorized(message),
            StatusCode::NOT_FOUND => RemoteError::NotFound(message),
            _ => RemoteError::Http {
                status: status.as_u16(),
                message,
            },
        }
    }

    /// Drops a token the server no longer accepts and announces the
    /// sign-out.
    async fn revoke(&self) {
        if self.take_token().await.is_some() {
            warn!("session token rejected, signing out");
            let _ = self.inner.events.send(AuthEvent::SignedOut);
        }
    }
}

/// Extracts the human-readable message from an error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            ["message", "msg", "error_description", "error"]
                .iter()
                .find_map(|k| v.get(*k).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| body.to_string())
}

/// Extracts the PostgREST error code from an error body.
fn error_code(body: &str) -> Option<String> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .get("code")?
        .as_str()
        .map(str::to_string)
}

/// Percent-encodes each segment of a storage object name.
fn encode_path(name: &str) -> String {
    name.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
