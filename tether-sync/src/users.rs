//! User profiles and the signed-in user.
//!
//! [`UserRepository`] reads profiles from the [`LocalCache`], refreshes them
//! from the remote store, and keeps the current user's slot in step with
//! the session: cleared and cancelled when it ends, reloaded when it starts.
//!
//! Every write of the current user goes through a fresh load generation, so
//! a refresh that started earlier can never overwrite it.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::loadable::{LoadEngine, LoadHandle, LoadKey, LoadState, LoadTicket};
use crate::session::{SessionController, SessionScoped, SessionState};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tether_cache::{CachedEntity, LocalCache};
use tether_remote::{AuthApi, RemoteStore};
use tether_types::{BlobPath, EntityId, FileRef, Record, Session};
use tokio::sync::watch;
use tracing::{debug, info, warn};

type UserTicket = LoadTicket<LoadKey, Option<CachedEntity>>;

/// The session-scoped current-user slot.
struct CurrentUser<S> {
    remote: Arc<S>,
    cache: LocalCache,
    engine: LoadEngine<LoadKey, Option<CachedEntity>>,
    session: watch::Receiver<SessionState>,
    config: Arc<SyncConfig>,
}

impl<S> Clone for CurrentUser<S> {
    fn clone(&self) -> Self {
        Self {
            remote: self.remote.clone(),
            cache: self.cache.clone(),
            engine: self.engine.clone(),
            session: self.session.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: RemoteStore + 'static> CurrentUser<S> {
    fn key(&self, id: EntityId) -> LoadKey {
        LoadKey::new(self.config.users_table.clone(), id)
    }

    fn is_signed_in_as(&self, id: EntityId) -> bool {
        self.session
            .borrow()
            .session()
            .is_some_and(|session| session.user_id == id)
    }

    /// Fetches the user behind `ticket` and reconciles it.
    async fn fetch(&self, ticket: UserTicket, scoped: bool) -> SyncResult<Option<CachedEntity>> {
        let id = ticket.key().id;
        let record = self
            .remote
            .fetch_by_id(&self.config.users_table, id, &self.config.user_select)
            .await?;
        match record {
            Some(record) => self.reconcile(&ticket, record, scoped).await.map(Some),
            None => {
                debug!(%id, "user not found");
                Ok(None)
            }
        }
    }

    /// Writes `record` into the cache while `ticket` is current. A scoped
    /// write also requires the session to still belong to that user.
    async fn reconcile(
        &self,
        ticket: &UserTicket,
        record: Record,
        scoped: bool,
    ) -> SyncResult<CachedEntity> {
        let id = ticket.key().id;
        let write = ticket.apply(|| {
            (!scoped || self.is_signed_in_as(id)).then(|| self.cache.upsert(record))
        })?;
        match write {
            Some(write) => Ok(write.await?),
            None => {
                debug!(%id, "session changed, dropping user");
                Err(SyncError::Cancelled)
            }
        }
    }

    /// Starts a fresh fetch of the signed-in user.
    fn reload(&self, id: EntityId) -> LoadHandle<Option<CachedEntity>> {
        let this = self.clone();
        self.engine
            .reload(self.key(id), move |ticket| async move {
                this.fetch(ticket, true).await
            })
    }

    /// Installs a row the remote just returned for the signed-in user.
    fn install(&self, id: EntityId, record: Record) -> LoadHandle<Option<CachedEntity>> {
        let this = self.clone();
        self.engine
            .reload(self.key(id), move |ticket| async move {
                this.reconcile(&ticket, record, true).await.map(Some)
            })
    }

    fn current(&self) -> Option<CachedEntity> {
        let id = self.session.borrow().session()?.user_id;
        let loaded = self.engine.value(&self.key(id)).flatten()?;
        Some(self.cache.read(id).unwrap_or(loaded))
    }

    fn prime(&self, session: &Session) {
        let key = self.key(session.user_id);
        // Not cached means unknown, not absent.
        self.engine
            .set_value(&key, self.cache.read(session.user_id).map(Some));
        // Completion and failure are published through the slot state.
        let _ = self.reload(session.user_id);
    }
}

#[async_trait]
impl<S: RemoteStore + 'static> SessionScoped for CurrentUser<S> {
    async fn session_started(&self, session: &Session) {
        self.prime(session);
    }

    async fn session_ended(&self, session: &Session) {
        let key = self.key(session.user_id);
        self.engine.cancel_loading(&key);
        self.engine.set_value(&key, None);
        if let Err(e) = self.cache.remove(session.user_id).await {
            warn!(user_id = %session.user_id, error = %e, "failed to drop current user");
        }
    }
}

/// User profiles backed by the cache and the remote store.
pub struct UserRepository<S, A> {
    remote: Arc<S>,
    cache: LocalCache,
    session: Arc<SessionController<A>>,
    config: Arc<SyncConfig>,
    current: CurrentUser<S>,
}

impl<S, A> UserRepository<S, A>
where
    S: RemoteStore + 'static,
    A: AuthApi + 'static,
{
    /// Wires the repository to `session`. If a session is already active
    /// its user is loaded right away.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime while a session is active.
    pub fn new(
        remote: Arc<S>,
        cache: LocalCache,
        session: Arc<SessionController<A>>,
        config: SyncConfig,
    ) -> Self {
        let config = Arc::new(config);
        let current = CurrentUser {
            remote: remote.clone(),
            cache: cache.clone(),
            engine: LoadEngine::new(),
            session: session.subscribe(),
            config: config.clone(),
        };
        session.register(Arc::new(current.clone()));
        if let Some(active) = session.session() {
            current.prime(&active);
        }
        Self {
            remote,
            cache,
            session,
            config,
            current,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn session(&self) -> &Arc<SessionController<A>> {
        &self.session
    }

    /// Cached profile of `id`.
    pub fn user(&self, id: EntityId) -> Option<CachedEntity> {
        self.cache.read(id)
    }

    /// Fetches `id` and caches it. Concurrent calls for the same user share
    /// one fetch. A missing user is `Ok(None)`.
    pub async fn load_user(&self, id: EntityId) -> SyncResult<Option<CachedEntity>> {
        let this = self.current.clone();
        self.current
            .engine
            .load(self.current.key(id), move |ticket| async move {
                this.fetch(ticket, false).await
            })
            .await
    }

    /// Refreshes the signed-in user, superseding any refresh in flight.
    pub async fn update_current_user(&self) -> SyncResult<Option<CachedEntity>> {
        let session = self.session.active_session()?;
        self.current.reload(session.user_id).await
    }

    /// The signed-in user's profile, once loaded.
    pub fn current_user(&self) -> Option<CachedEntity> {
        self.current.current()
    }

    /// Watches the load state of the signed-in user.
    pub fn subscribe_current_user(
        &self,
    ) -> SyncResult<watch::Receiver<LoadState<Option<CachedEntity>>>> {
        let session = self.session.active_session()?;
        Ok(self.current.engine.watch(&self.current.key(session.user_id)))
    }

    /// Creates the signed-in user's profile. `fill` sets its fields; the id
    /// is always the session's user id.
    pub async fn create_user(
        &self,
        fill: impl FnOnce(&mut Record) + Send,
    ) -> SyncResult<CachedEntity> {
        let user_id = self.session.active_session()?.user_id;
        let mut fields = Record::new();
        fill(&mut fields);
        fields.set_id(user_id);

        let created = self.remote.insert(&self.config.users_table, fields).await?;
        info!(%user_id, "user created");
        self.current
            .install(user_id, created)
            .await?
            .ok_or_else(|| SyncError::NotFound("cannot create user".into()))
    }

    /// Like [`create_user`](Self::create_user), uploading `photo` first and
    /// storing its key in the photo field.
    pub async fn create_user_with_photo(
        &self,
        fill: impl FnOnce(&mut Record) + Send,
        photo: Option<Vec<u8>>,
    ) -> SyncResult<CachedEntity> {
        let user_id = self.session.active_session()?.user_id;
        let photo_key = match photo {
            Some(bytes) => Some(self.upload_photo(user_id, bytes).await?),
            None => None,
        };
        let field = self.config.photo_field.clone();
        self.create_user(move |fields| {
            fill(fields);
            fields.insert(field, photo_key);
        })
        .await
    }

    /// Applies `update` to a copy of the signed-in user and sends the full
    /// field set to the remote. The cache changes only once the remote
    /// accepted it.
    pub async fn edit_current_user(
        &self,
        update: impl FnOnce(&mut Record) + Send,
    ) -> SyncResult<CachedEntity> {
        let user = self.current_user().ok_or(SyncError::NotAuthorized)?;
        let mut fields = user.fields.clone();
        update(&mut fields);
        fields.set_id(user.id);

        let updated = self
            .remote
            .update(&self.config.users_table, user.id, fields)
            .await?;
        debug!(user_id = %user.id, "user updated");
        self.current
            .install(user.id, updated)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("user {}", user.id)))
    }

    /// Like [`edit_current_user`](Self::edit_current_user), replacing the
    /// profile photo when `photo` is given.
    pub async fn edit_current_user_with_photo(
        &self,
        photo: Option<Vec<u8>>,
        update: impl FnOnce(&mut Record) + Send,
    ) -> SyncResult<CachedEntity> {
        let user = self.current_user().ok_or(SyncError::NotAuthorized)?;
        let field = self.config.photo_field.clone();
        let photo_key = match photo {
            Some(bytes) => Value::String(self.upload_photo(user.id, bytes).await?),
            None => user.get(&field).cloned().unwrap_or(Value::Null),
        };
        self.edit_current_user(move |fields| {
            update(fields);
            fields.insert(field, photo_key);
        })
        .await
    }

    /// Deletes the signed-in user's profile, then logs out. A failed logout
    /// does not fail the deletion.
    pub async fn delete_account(&self) -> SyncResult<()> {
        let user_id = self.session.active_session()?.user_id;
        self.remote
            .delete(&self.config.users_table, user_id)
            .await?;
        info!(%user_id, "account deleted");
        if let Err(e) = self.session.logout().await {
            debug!(error = %e, "logout after account deletion failed");
        }
        Ok(())
    }

    /// Resolves the photo of `user` to a fetchable URL. Stored URLs are
    /// returned as-is; storage keys are signed.
    pub async fn profile_photo_url(&self, user: &CachedEntity) -> SyncResult<Option<String>> {
        let Some(key) = user
            .get_str(&self.config.photo_field)
            .filter(|key| !key.is_empty())
        else {
            return Ok(None);
        };
        match FileRef::parse(key)? {
            FileRef::Url(url) => Ok(Some(url)),
            FileRef::Blob(path) => {
                let url = self
                    .remote
                    .signed_url(&path, self.config.signed_url_ttl())
                    .await?;
                Ok(Some(url))
            }
        }
    }

    /// Replaces the stored photo of `user_id`. Returns the new storage key.
    async fn upload_photo(&self, user_id: EntityId, bytes: Vec<u8>) -> SyncResult<String> {
        if bytes.is_empty() {
            return Err(SyncError::Validation("empty profile image".into()));
        }
        let format = self.config.avatar_format;
        let path = BlobPath::profile_photo(self.config.avatars_bucket.clone(), user_id, format);

        if let Err(e) = self.remote.delete_blob(&path).await {
            debug!(key = %path.key(), error = %e, "no previous photo removed");
        }
        let stored = self
            .remote
            .upload_blob(&path, bytes, format.content_type())
            .await?;
        Ok(stored.key())
    }
}
