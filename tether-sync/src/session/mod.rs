//! Session lifecycle.
//!
//! [`SessionController`] owns the current [`Session`] and moves between
//! three states:
//!
//! ```text
//! Anonymous --sign_in--> Authenticating --verify ok--> Authenticated
//!     ^                        |                            |
//!     +------ verify failed ---+                            |
//!     +------------- logout / forced sign-out --------------+
//! ```
//!
//! Components holding per-user state register a [`SessionScoped`] hook.
//! Hooks run after the state has been published, in registration order,
//! one transition at a time.

mod store;

pub use store::{FileSessionStore, MemorySessionStore, SessionStore};

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tether_remote::{AuthApi, AuthEvent, RemoteError};
use tether_types::{EntityId, Session, Verification};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where the controller stands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Anonymous,
    /// A code was requested and not yet verified.
    Authenticating(Verification),
    Authenticated(Session),
}

impl SessionState {
    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionState::Authenticated(session) => Some(session),
            _ => None,
        }
    }
}

/// Per-user state that follows the session.
#[async_trait]
pub trait SessionScoped: Send + Sync {
    /// Called once the controller is authenticated as `session`.
    async fn session_started(&self, session: &Session);

    /// Called once the controller is anonymous again. `session` is the one
    /// that ended.
    async fn session_ended(&self, session: &Session);
}

/// Owns the session and drives the registered scopes.
pub struct SessionController<A> {
    auth: Arc<A>,
    state: watch::Sender<SessionState>,
    scopes: Mutex<Vec<Arc<dyn SessionScoped>>>,
    store: Arc<dyn SessionStore>,
    /// Serializes transitions and the hooks they run.
    transition: tokio::sync::Mutex<()>,
}

impl<A: AuthApi + 'static> SessionController<A> {
    pub fn new(auth: Arc<A>) -> Self {
        Self::with_store(auth, Arc::new(MemorySessionStore::new()))
    }

    pub fn with_store(auth: Arc<A>, store: Arc<dyn SessionStore>) -> Self {
        let (state, _) = watch::channel(SessionState::Anonymous);
        Self {
            auth,
            state,
            scopes: Mutex::new(Vec::new()),
            store,
            transition: tokio::sync::Mutex::new(()),
        }
    }

    pub fn auth(&self) -> &Arc<A> {
        &self.auth
    }

    /// Registers a scope. It only sees transitions from now on.
    pub fn register(&self, scope: Arc<dyn SessionScoped>) {
        self.scopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(scope);
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Observes state changes. Receivers see the new state before any hook
    /// of the transition runs.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn session(&self) -> Option<Session> {
        self.state.borrow().session().cloned()
    }

    /// The current session, or [`SyncError::NotAuthorized`].
    pub fn active_session(&self) -> SyncResult<Session> {
        self.session().ok_or(SyncError::NotAuthorized)
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.borrow().session().is_some()
    }

    /// Resumes the persisted session, if there is one and nobody is signed
    /// in yet.
    pub async fn restore(&self) -> SyncResult<Option<Session>> {
        let _guard = self.transition.lock().await;
        if let Some(session) = self.session() {
            return Ok(Some(session));
        }
        let Some(session) = self.store.load().await? else {
            debug!("no session to restore");
            return Ok(None);
        };
        info!(user_id = %session.user_id, "restoring session");
        self.begin_locked(session.clone()).await;
        Ok(Some(session))
    }

    /// Requests a one-time code for `phone`.
    ///
    /// Moves an anonymous controller to `Authenticating`. An authenticated
    /// controller keeps its session until the code is verified.
    pub async fn sign_in(&self, phone: &str) -> SyncResult<Verification> {
        let id = self.auth.request_verification(phone).await?;
        let verification = Verification::new(id, phone);
        let _guard = self.transition.lock().await;
        self.state.send_if_modified(|state| match state {
            SessionState::Authenticated(_) => false,
            _ => {
                *state = SessionState::Authenticating(verification.clone());
                true
            }
        });
        debug!(phone, "verification requested");
        Ok(verification)
    }

    /// Completes a sign-in with the code sent for `verification`.
    ///
    /// A rejected code yields [`SyncError::InvalidCode`]. Any failure drops
    /// a pending verification.
    pub async fn verify(&self, verification: &Verification, code: &str) -> SyncResult<Session> {
        match self.auth.verify(&verification.id, code).await {
            Ok(user_id) => Ok(self.begin(user_id, &verification.login).await),
            Err(e) => {
                self.abandon_verification().await;
                warn!(login = %verification.login, error = %e, "verification failed");
                Err(match e {
                    RemoteError::Unauthorized(_) => SyncError::InvalidCode,
                    other => other.into(),
                })
            }
        }
    }

    pub async fn sign_in_with_password(&self, phone: &str, password: &str) -> SyncResult<Session> {
        let user_id = self.auth.sign_in_with_password(phone, password).await?;
        Ok(self.begin(user_id, phone).await)
    }

    /// Creates an account and signs into it.
    pub async fn sign_up(&self, phone: &str, password: &str) -> SyncResult<Session> {
        let user_id = self.auth.sign_up(phone, password).await?;
        Ok(self.begin(user_id, phone).await)
    }

    /// Signs out remotely and ends the local session.
    ///
    /// The local session ends even when the remote call fails; that failure
    /// is still returned. Logging out while anonymous does nothing.
    pub async fn logout(&self) -> SyncResult<()> {
        let remote = if self.is_logged_in() {
            self.auth.sign_out().await
        } else {
            Ok(())
        };
        self.end_session().await;
        remote.map_err(|e| {
            warn!(error = %e, "remote sign-out failed");
            e.into()
        })
    }

    /// Ends the local session without contacting the remote. Idempotent.
    pub async fn end_session(&self) {
        let _guard = self.transition.lock().await;
        self.end_locked().await;
    }

    /// Ends the session whenever the auth layer reports a sign-out, whether
    /// requested here or not.
    pub fn listen_for_sign_out(self: &Arc<Self>) -> AuthListener {
        let mut events = self.auth.auth_events();
        let controller = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(AuthEvent::SignedOut) => {
                        if controller.is_logged_in() {
                            info!("auth layer signed out");
                        }
                        controller.end_session().await;
                    }
                    Ok(AuthEvent::SignedIn(user_id)) => {
                        debug!(%user_id, "auth layer signed in");
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "auth events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("auth listener stopped");
        });
        AuthListener { task }
    }

    async fn abandon_verification(&self) {
        let _guard = self.transition.lock().await;
        self.state.send_if_modified(|state| {
            if matches!(state, SessionState::Authenticating(_)) {
                *state = SessionState::Anonymous;
                true
            } else {
                false
            }
        });
    }

    async fn begin(&self, user_id: EntityId, login: &str) -> Session {
        let session = Session::new(user_id, login);
        let _guard = self.transition.lock().await;
        self.begin_locked(session.clone()).await;
        session
    }

    async fn begin_locked(&self, session: Session) {
        if self.is_logged_in() {
            self.end_locked().await;
        }
        if let Err(e) = self.store.save(&session).await {
            warn!(error = %e, "failed to persist session");
        }
        self.state
            .send_replace(SessionState::Authenticated(session.clone()));
        info!(user_id = %session.user_id, "session started");

        for scope in self.scopes() {
            scope.session_started(&session).await;
        }
    }

    async fn end_locked(&self) {
        let previous = self.state.send_replace(SessionState::Anonymous);
        let SessionState::Authenticated(session) = previous else {
            return;
        };
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "failed to clear persisted session");
        }
        info!(user_id = %session.user_id, "session ended");

        for scope in self.scopes() {
            scope.session_ended(&session).await;
        }
    }

    fn scopes(&self) -> Vec<Arc<dyn SessionScoped>> {
        self.scopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Running forced sign-out listener. Stops when dropped.
#[derive(Debug)]
pub struct AuthListener {
    task: JoinHandle<()>,
}

impl AuthListener {
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for AuthListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
