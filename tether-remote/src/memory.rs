//! In-process backend.
//!
//! [`MemoryRemote`] implements [`RemoteStore`], [`AuthApi`] and
//! [`RealtimeTransport`] over plain maps. Every call is logged, any
//! operation can be made to fail, fetches can be slowed down, and writes
//! are pushed to active realtime listeners the way the hosted backend
//! would push them.

use crate::auth::{AuthApi, AuthEvent};
use crate::error::{RemoteError, RemoteResult};
use crate::realtime::{
    ChannelId, EventSink, ListenerId, ListenerSpec, RealtimeTransport, RowEvent, RowEventKind,
};
use crate::store::RemoteStore;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tether_types::{BlobPath, EntityId, ID_FIELD, Record, TableId};
use tokio::sync::broadcast;
use tracing::debug;

/// Operation names used for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    FetchById,
    Update,
    Upsert,
    Insert,
    InsertMany,
    Delete,
    UploadBlob,
    DeleteBlob,
    SignedUrl,
    RequestVerification,
    Verify,
    SignIn,
    SignUp,
    SignOut,
    Activate,
}

/// One logged call.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    FetchById { table: TableId, id: EntityId, select: String },
    Update { table: TableId, id: EntityId, fields: Record },
    Upsert { table: TableId, id: EntityId, fields: Record },
    Insert { table: TableId, fields: Record },
    InsertMany { table: TableId, rows: Vec<Record> },
    Delete { table: TableId, id: EntityId },
    UploadBlob { path: BlobPath, content_type: String },
    DeleteBlob { path: BlobPath },
    SignedUrl { path: BlobPath },
    RequestVerification { phone: String },
    Verify { verification_id: String },
    SignIn { phone: String },
    SignUp { phone: String },
    SignOut,
    Listen { channel: ChannelId, spec: ListenerSpec },
    Unlisten { channel: ChannelId, listener: ListenerId },
    Activate { channel: ChannelId },
    Release { channel: ChannelId },
}

impl RemoteCall {
    /// The injectable operation this call belongs to, if any.
    pub fn op(&self) -> Option<RemoteOp> {
        Some(match self {
            RemoteCall::FetchById { .. } => RemoteOp::FetchById,
            RemoteCall::Update { .. } => RemoteOp::Update,
            RemoteCall::Upsert { .. } => RemoteOp::Upsert,
            RemoteCall::Insert { .. } => RemoteOp::Insert,
            RemoteCall::InsertMany { .. } => RemoteOp::InsertMany,
            RemoteCall::Delete { .. } => RemoteOp::Delete,
            RemoteCall::UploadBlob { .. } => RemoteOp::UploadBlob,
            RemoteCall::DeleteBlob { .. } => RemoteOp::DeleteBlob,
            RemoteCall::SignedUrl { .. } => RemoteOp::SignedUrl,
            RemoteCall::RequestVerification { .. } => RemoteOp::RequestVerification,
            RemoteCall::Verify { .. } => RemoteOp::Verify,
            RemoteCall::SignIn { .. } => RemoteOp::SignIn,
            RemoteCall::SignUp { .. } => RemoteOp::SignUp,
            RemoteCall::SignOut => RemoteOp::SignOut,
            RemoteCall::Activate { .. } => RemoteOp::Activate,
            RemoteCall::Listen { .. } | RemoteCall::Unlisten { .. } | RemoteCall::Release { .. } => {
                return None;
            }
        })
    }
}

#[derive(Debug, Clone)]
struct Failure {
    error: RemoteError,
    once: bool,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    bytes: Vec<u8>,
    content_type: String,
}

#[derive(Debug, Clone)]
struct Account {
    user_id: EntityId,
    password: Option<String>,
}

#[derive(Default)]
struct Channel {
    active: bool,
    listeners: Vec<(ListenerId, ListenerSpec, EventSink)>,
}

#[derive(Default)]
struct State {
    tables: HashMap<TableId, HashMap<EntityId, Record>>,
    blobs: HashMap<BlobPath, StoredBlob>,
    accounts: HashMap<String, Account>,
    pending_codes: HashMap<String, String>,
    signed_in: Option<EntityId>,
    channels: HashMap<ChannelId, Channel>,
    next_listener: u64,
    calls: Vec<RemoteCall>,
    failures: HashMap<RemoteOp, Failure>,
    fetch_delay: Option<Duration>,
}

impl State {
    /// Logs the call and returns the injected failure for it, if any.
    fn record(&mut self, call: RemoteCall) -> RemoteResult<()> {
        let op = call.op();
        self.calls.push(call);
        let Some(op) = op else {
            return Ok(());
        };
        match self.failures.get(&op) {
            Some(failure) => {
                let error = failure.error.clone();
                if failure.once {
                    self.failures.remove(&op);
                }
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn table(&mut self, table: &TableId) -> &mut HashMap<EntityId, Record> {
        self.tables.entry(table.clone()).or_default()
    }

    /// Delivers `event` to every matching listener on an active channel.
    fn publish(&mut self, event: RowEvent) {
        for channel in self.channels.values().filter(|c| c.active) {
            for (_, spec, sink) in &channel.listeners {
                if spec.accepts(&event) {
                    // A closed sink belongs to a subscription being torn down.
                    let _ = sink.send(event.clone());
                }
            }
        }
    }
}

/// In-process backend.
pub struct MemoryRemote {
    state: Mutex<State>,
    events: broadcast::Sender<AuthEvent>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Test controls ────────────────────────────────────────────

    /// Makes every call of `op` fail with `error` until [`recover`](Self::recover).
    pub fn fail(&self, op: RemoteOp, error: RemoteError) {
        self.state()
            .failures
            .insert(op, Failure { error, once: false });
    }

    /// Makes the next call of `op` fail with `error`.
    pub fn fail_once(&self, op: RemoteOp, error: RemoteError) {
        self.state()
            .failures
            .insert(op, Failure { error, once: true });
    }

    /// Clears an injected failure.
    pub fn recover(&self, op: RemoteOp) {
        self.state().failures.remove(&op);
    }

    /// Delays every `fetch_by_id` response. The row is read after the delay.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.state().fetch_delay = delay;
    }

    /// All calls so far, oldest first.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    /// Number of logged calls of `op`.
    pub fn call_count(&self, op: RemoteOp) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op() == Some(op))
            .count()
    }

    /// Writes a row without logging or pushing events.
    pub fn seed(&self, table: &TableId, record: Record) -> RemoteResult<EntityId> {
        let id = record.require_id()?;
        self.state().table(table).insert(id, record);
        Ok(id)
    }

    /// Current stored row.
    pub fn row(&self, table: &TableId, id: EntityId) -> Option<Record> {
        self.state().tables.get(table).and_then(|t| t.get(&id).cloned())
    }

    /// Stored blob bytes and content type.
    pub fn blob(&self, path: &BlobPath) -> Option<(Vec<u8>, String)> {
        self.state()
            .blobs
            .get(path)
            .map(|b| (b.bytes.clone(), b.content_type.clone()))
    }

    /// Pushes an event to listeners without touching stored rows.
    pub fn emit(&self, event: RowEvent) {
        self.state().publish(event);
    }

    /// Registers a password account, returning its user id.
    pub fn register_account(&self, phone: &str, password: &str) -> EntityId {
        let user_id = EntityId::new();
        self.state().accounts.insert(
            phone.to_string(),
            Account {
                user_id,
                password: Some(password.to_string()),
            },
        );
        user_id
    }

    /// The code most recently sent to `phone`.
    pub fn otp_code(&self, phone: &str) -> Option<String> {
        self.state().pending_codes.get(phone).cloned()
    }

    /// The user holding remote credentials.
    pub fn signed_in_user(&self) -> Option<EntityId> {
        self.state().signed_in
    }

    /// Revokes the session server-side and pushes `SignedOut`.
    pub fn force_sign_out(&self) {
        self.state().signed_in = None;
        debug!("forced sign-out");
        let _ = self.events.send(AuthEvent::SignedOut);
    }

    /// Whether `channel` is open.
    pub fn has_channel(&self, channel: &ChannelId) -> bool {
        self.state().channels.contains_key(channel)
    }

    /// Number of listeners registered on `channel`.
    pub fn listener_count(&self, channel: &ChannelId) -> usize {
        self.state()
            .channels
            .get(channel)
            .map_or(0, |c| c.listeners.len())
    }

    fn sign_in_as(&self, user_id: EntityId) {
        self.state().signed_in = Some(user_id);
        let _ = self.events.send(AuthEvent::SignedIn(user_id));
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_by_id(
        &self,
        table: &TableId,
        id: EntityId,
        select: &str,
    ) -> RemoteResult<Option<Record>> {
        let delay = {
            let mut state = self.state();
            state.record(RemoteCall::FetchById {
                table: table.clone(),
                id,
                select: select.to_string(),
            })?;
            state.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.row(table, id))
    }

    async fn update(&self, table: &TableId, id: EntityId, fields: Record) -> RemoteResult<Record> {
        let mut state = self.state();
        state.record(RemoteCall::Update {
            table: table.clone(),
            id,
            fields: fields.clone(),
        })?;
        let row = state
            .table(table)
            .get_mut(&id)
            .ok_or_else(|| RemoteError::NotFound(format!("{table}/{id}")))?;
        row.merge(&fields);
        row.set_id(id);
        let row = row.clone();
        state.publish(RowEvent::new(RowEventKind::Update, table.clone(), row.clone()));
        Ok(row)
    }

    async fn upsert(&self, table: &TableId, id: EntityId, fields: Record) -> RemoteResult<Record> {
        let mut state = self.state();
        state.record(RemoteCall::Upsert {
            table: table.clone(),
            id,
            fields: fields.clone(),
        })?;
        let rows = state.table(table);
        let kind = if rows.contains_key(&id) {
            RowEventKind::Update
        } else {
            RowEventKind::Insert
        };
        let row = rows.entry(id).or_default();
        row.merge(&fields);
        row.set_id(id);
        let row = row.clone();
        state.publish(RowEvent::new(kind, table.clone(), row.clone()));
        Ok(row)
    }

    async fn insert(&self, table: &TableId, fields: Record) -> RemoteResult<Record> {
        let mut state = self.state();
        state.record(RemoteCall::Insert {
            table: table.clone(),
            fields: fields.clone(),
        })?;
        let row = insert_row(state.table(table), fields)?;
        state.publish(RowEvent::new(RowEventKind::Insert, table.clone(), row.clone()));
        Ok(row)
    }

    async fn insert_many(&self, table: &TableId, rows: Vec<Record>) -> RemoteResult<Vec<Record>> {
        let mut state = self.state();
        state.record(RemoteCall::InsertMany {
            table: table.clone(),
            rows: rows.clone(),
        })?;
        // All rows or none.
        let mut staged = state.table(table).clone();
        let inserted = rows
            .into_iter()
            .map(|fields| insert_row(&mut staged, fields))
            .collect::<RemoteResult<Vec<_>>>()?;
        *state.table(table) = staged;
        for row in &inserted {
            state.publish(RowEvent::new(RowEventKind::Insert, table.clone(), row.clone()));
        }
        Ok(inserted)
    }

    async fn delete(&self, table: &TableId, id: EntityId) -> RemoteResult<()> {
        let mut state = self.state();
        state.record(RemoteCall::Delete {
            table: table.clone(),
            id,
        })?;
        if let Some(prior) = state.table(table).remove(&id) {
            state.publish(RowEvent::new(RowEventKind::Delete, table.clone(), prior));
        }
        Ok(())
    }

    async fn upload_blob(
        &self,
        path: &BlobPath,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> RemoteResult<BlobPath> {
        let mut state = self.state();
        state.record(RemoteCall::UploadBlob {
            path: path.clone(),
            content_type: content_type.to_string(),
        })?;
        state.blobs.insert(
            path.clone(),
            StoredBlob {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(path.clone())
    }

    async fn delete_blob(&self, path: &BlobPath) -> RemoteResult<()> {
        let mut state = self.state();
        state.record(RemoteCall::DeleteBlob { path: path.clone() })?;
        state.blobs.remove(path);
        Ok(())
    }

    async fn signed_url(&self, path: &BlobPath, ttl: Duration) -> RemoteResult<String> {
        let mut state = self.state();
        state.record(RemoteCall::SignedUrl { path: path.clone() })?;
        if !state.blobs.contains_key(path) {
            return Err(RemoteError::NotFound(path.key()));
        }
        Ok(format!("memory://{}?expires_in={}", path.key(), ttl.as_secs()))
    }
}

fn insert_row(rows: &mut HashMap<EntityId, Record>, mut fields: Record) -> RemoteResult<Record> {
    let id = if fields.contains(ID_FIELD) {
        fields.require_id()?
    } else {
        EntityId::new()
    };
    if rows.contains_key(&id) {
        return Err(RemoteError::Http {
            status: 409,
            message: format!("duplicate key value: {id}"),
        });
    }
    fields.set_id(id);
    rows.insert(id, fields.clone());
    Ok(fields)
}

#[async_trait]
impl AuthApi for MemoryRemote {
    async fn request_verification(&self, phone: &str) -> RemoteResult<String> {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        let mut state = self.state();
        state.record(RemoteCall::RequestVerification {
            phone: phone.to_string(),
        })?;
        state.pending_codes.insert(phone.to_string(), code);
        // The phone number doubles as the verification handle.
        Ok(phone.to_string())
    }

    async fn verify(&self, verification_id: &str, code: &str) -> RemoteResult<EntityId> {
        let user_id = {
            let mut state = self.state();
            state.record(RemoteCall::Verify {
                verification_id: verification_id.to_string(),
            })?;
            match state.pending_codes.get(verification_id) {
                Some(expected) if expected == code => {}
                _ => return Err(RemoteError::Unauthorized("token has expired or is invalid".into())),
            }
            state.pending_codes.remove(verification_id);
            state
                .accounts
                .entry(verification_id.to_string())
                .or_insert_with(|| Account {
                    user_id: EntityId::new(),
                    password: None,
                })
                .user_id
        };
        self.sign_in_as(user_id);
        Ok(user_id)
    }

    async fn sign_in_with_password(&self, phone: &str, password: &str) -> RemoteResult<EntityId> {
        let user_id = {
            let mut state = self.state();
            state.record(RemoteCall::SignIn {
                phone: phone.to_string(),
            })?;
            match state.accounts.get(phone) {
                Some(account) if account.password.as_deref() == Some(password) => account.user_id,
                _ => return Err(RemoteError::Unauthorized("invalid login credentials".into())),
            }
        };
        self.sign_in_as(user_id);
        Ok(user_id)
    }

    async fn sign_up(&self, phone: &str, password: &str) -> RemoteResult<EntityId> {
        let user_id = {
            let mut state = self.state();
            state.record(RemoteCall::SignUp {
                phone: phone.to_string(),
            })?;
            if state.accounts.contains_key(phone) {
                return Err(RemoteError::Http {
                    status: 422,
                    message: "user already registered".into(),
                });
            }
            let user_id = EntityId::new();
            state.accounts.insert(
                phone.to_string(),
                Account {
                    user_id,
                    password: Some(password.to_string()),
                },
            );
            user_id
        };
        self.sign_in_as(user_id);
        Ok(user_id)
    }

    async fn sign_out(&self) -> RemoteResult<()> {
        let (was_signed_in, result) = {
            let mut state = self.state();
            let result = state.record(RemoteCall::SignOut);
            (state.signed_in.take().is_some(), result)
        };
        if was_signed_in {
            let _ = self.events.send(AuthEvent::SignedOut);
        }
        result
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl RealtimeTransport for MemoryRemote {
    fn listen(&self, channel: &ChannelId, spec: ListenerSpec, sink: EventSink) -> ListenerId {
        let mut state = self.state();
        state.calls.push(RemoteCall::Listen {
            channel: channel.clone(),
            spec: spec.clone(),
        });
        state.next_listener += 1;
        let id = ListenerId(state.next_listener);
        state
            .channels
            .entry(channel.clone())
            .or_default()
            .listeners
            .push((id, spec, sink));
        id
    }

    fn unlisten(&self, channel: &ChannelId, listener: ListenerId) {
        let mut state = self.state();
        state.calls.push(RemoteCall::Unlisten {
            channel: channel.clone(),
            listener,
        });
        if let Some(ch) = state.channels.get_mut(channel) {
            ch.listeners.retain(|(id, _, _)| *id != listener);
        }
    }

    async fn activate(&self, channel: &ChannelId) -> RemoteResult<()> {
        let mut state = self.state();
        state.record(RemoteCall::Activate {
            channel: channel.clone(),
        })?;
        match state.channels.get_mut(channel) {
            Some(ch) => {
                ch.active = true;
                debug!(%channel, listeners = ch.listeners.len(), "channel active");
                Ok(())
            }
            None => Err(RemoteError::NotFound(format!("channel {channel}"))),
        }
    }

    fn release(&self, channel: &ChannelId) {
        let mut state = self.state();
        state.calls.push(RemoteCall::Release {
            channel: channel.clone(),
        });
        if state.channels.remove(channel).is_some() {
            debug!(%channel, "channel released");
        }
    }
}
