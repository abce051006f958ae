//! The cache handle and its mutation queue.
//!
//! `LocalCache` is a cheap clonable handle. Mutating methods enqueue a command
//! on an unbounded channel at call time and return a [`CacheOp`] that resolves
//! once the queue task has applied it. The queue task is the only writer of
//! the entity map; readers take a short read lock and clone.

use crate::entity::{CachedEntity, RowHandle};
use crate::error::{CacheError, CacheResult};
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::task::{Context, Poll};
use tether_types::{EntityId, Record, RemoteChange};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

const EVENT_CAPACITY: usize = 256;

/// Notification emitted after the queue applies a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Upserted(CachedEntity),
    Removed(EntityId),
    Cleared,
}

type EditFn = Box<dyn FnOnce(&mut Record) + Send>;

/// Row mutation carried by a remote change.
enum Applied {
    Upsert(EntityId, Record),
    Remove(EntityId),
}

/// Command sent to the mutation queue.
enum Command {
    Upsert {
        id: EntityId,
        record: Record,
        reply: oneshot::Sender<CachedEntity>,
    },
    UpsertMany {
        rows: Vec<(EntityId, Record)>,
        reply: oneshot::Sender<Vec<CachedEntity>>,
    },
    Edit {
        id: EntityId,
        edit: EditFn,
        reply: oneshot::Sender<Option<CachedEntity>>,
    },
    Remove {
        id: EntityId,
        reply: oneshot::Sender<bool>,
    },
    Apply {
        change: Applied,
        reply: oneshot::Sender<Option<CachedEntity>>,
    },
    Clear {
        reply: oneshot::Sender<usize>,
    },
    Barrier {
        reply: oneshot::Sender<()>,
    },
}

struct Shared {
    entities: RwLock<HashMap<EntityId, CachedEntity>>,
    events: broadcast::Sender<CacheEvent>,
}

/// A queryable store of entities keyed by identifier.
#[derive(Clone)]
pub struct LocalCache {
    name: Arc<str>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl LocalCache {
    /// Creates an empty cache and spawns its mutation queue.
    ///
    /// The queue stops once every clone of the handle is dropped.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(name: impl Into<String>) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            entities: RwLock::new(HashMap::new()),
            events,
        });
        let (commands, rx) = mpsc::unbounded_channel();

        let queue = MutationQueue {
            name: name.clone(),
            shared: shared.clone(),
            next_row: 1,
        };
        tokio::spawn(queue.run(rx));

        Self {
            name,
            shared,
            commands,
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    // ── Snapshot reads ───────────────────────────────────────────

    fn entities(&self) -> RwLockReadGuard<'_, HashMap<EntityId, CachedEntity>> {
        self.shared
            .entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the entity as of the last applied mutation.
    pub fn read(&self, id: EntityId) -> Option<CachedEntity> {
        self.entities().get(&id).cloned()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entities().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities().is_empty()
    }

    /// Identifiers of all cached entities, in row order.
    pub fn ids(&self) -> Vec<EntityId> {
        self.snapshot().into_iter().map(|e| e.id).collect()
    }

    /// All cached entities, in row order.
    pub fn snapshot(&self) -> Vec<CachedEntity> {
        let mut all: Vec<CachedEntity> = self.entities().values().cloned().collect();
        all.sort_by_key(|e| e.row);
        all
    }

    /// Entities matching `predicate`, in row order.
    pub fn find(&self, mut predicate: impl FnMut(&CachedEntity) -> bool) -> Vec<CachedEntity> {
        let mut found: Vec<CachedEntity> = self
            .entities()
            .values()
            .filter(|e| predicate(e))
            .cloned()
            .collect();
        found.sort_by_key(|e| e.row);
        found
    }

    /// Subscribes to mutations applied after this call.
    pub fn watch(&self) -> broadcast::Receiver<CacheEvent> {
        self.shared.events.subscribe()
    }

    // ── Queued mutations ─────────────────────────────────────────
    //
    // Each method enqueues immediately. The returned future only waits for
    // the result; dropping it does not withdraw the mutation.

    fn submit<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> CacheOp<T> {
        let (tx, rx) = oneshot::channel();
        match self.commands.send(command(tx)) {
            Ok(()) => CacheOp::pending(rx),
            Err(_) => CacheOp::ready(Err(CacheError::Closed)),
        }
    }

    /// Merges `record` into the entity with the record's `id`, creating it if
    /// absent. Fields not present in `record` keep their cached values.
    pub fn upsert(&self, record: Record) -> CacheOp<CachedEntity> {
        match record.require_id() {
            Ok(id) => self.submit(|reply| Command::Upsert { id, record, reply }),
            Err(e) => CacheOp::ready(Err(e.into())),
        }
    }

    /// Upserts several records as one queue entry. Nothing is applied if any
    /// record lacks a valid `id`.
    pub fn upsert_many(&self, records: Vec<Record>) -> CacheOp<Vec<CachedEntity>> {
        let rows: Result<Vec<_>, _> = records
            .into_iter()
            .map(|r| r.require_id().map(|id| (id, r)))
            .collect();
        match rows {
            Ok(rows) => self.submit(|reply| Command::UpsertMany { rows, reply }),
            Err(e) => CacheOp::ready(Err(e.into())),
        }
    }

    /// Runs `edit` against the cached fields of `id` inside the queue.
    /// Resolves to `None` when the entity is not cached. The `id` field is
    /// restored after the edit.
    pub fn edit(
        &self,
        id: EntityId,
        edit: impl FnOnce(&mut Record) + Send + 'static,
    ) -> CacheOp<Option<CachedEntity>> {
        let edit: EditFn = Box::new(edit);
        self.submit(|reply| Command::Edit { id, edit, reply })
    }

    /// Removes an entity. Resolves to whether anything was removed; removing
    /// an absent entity is not an error.
    pub fn remove(&self, id: EntityId) -> CacheOp<bool> {
        self.submit(|reply| Command::Remove { id, reply })
    }

    /// Applies a pushed row change: added and modified rows are upserted,
    /// removed rows are deleted. Resolves to the entity after an upsert.
    pub fn apply(&self, change: RemoteChange) -> CacheOp<Option<CachedEntity>> {
        let change = match change {
            RemoteChange::Added(record) | RemoteChange::Modified(record) => {
                record.require_id().map(|id| Applied::Upsert(id, record))
            }
            RemoteChange::Removed(record) => record.require_id().map(Applied::Remove),
        };
        match change {
            Ok(change) => self.submit(|reply| Command::Apply { change, reply }),
            Err(e) => CacheOp::ready(Err(e.into())),
        }
    }

    /// Removes every entity. Resolves to the number removed.
    pub fn clear(&self) -> CacheOp<usize> {
        self.submit(|reply| Command::Clear { reply })
    }

    /// Resolves once every mutation enqueued before this call is applied.
    pub fn flush(&self) -> CacheOp<()> {
        self.submit(|reply| Command::Barrier { reply })
    }
}

impl fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCache")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

/// Pending result of a queued cache mutation.
pub struct CacheOp<T> {
    inner: OpInner<T>,
}

enum OpInner<T> {
    Pending(oneshot::Receiver<T>),
    Ready(Option<CacheResult<T>>),
}

impl<T> CacheOp<T> {
    fn pending(rx: oneshot::Receiver<T>) -> Self {
        Self {
            inner: OpInner::Pending(rx),
        }
    }

    fn ready(result: CacheResult<T>) -> Self {
        Self {
            inner: OpInner::Ready(Some(result)),
        }
    }
}

impl<T> Unpin for CacheOp<T> {}

impl<T> Future for CacheOp<T> {
    type Output = CacheResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            OpInner::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.map_err(|_| CacheError::Closed)),
            OpInner::Ready(result) => Poll::Ready(result.take().unwrap_or(Err(CacheError::Closed))),
        }
    }
}

impl<T> fmt::Debug for CacheOp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner {
            OpInner::Pending(_) => "pending",
            OpInner::Ready(_) => "ready",
        };
        f.debug_struct("CacheOp").field("state", &state).finish()
    }
}

/// Owner of all writes to the entity map.
struct MutationQueue {
    name: Arc<str>,
    shared: Arc<Shared>,
    next_row: u64,
}

impl MutationQueue {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!(cache = %self.name, "mutation queue started");
        while let Some(command) = commands.recv().await {
            self.handle(command);
        }
        debug!(cache = %self.name, "mutation queue stopped");
    }

    // Replies are best-effort: the caller may have dropped its CacheOp.
    fn handle(&mut self, command: Command) {
        match command {
            Command::Upsert { id, record, reply } => {
                let _ = reply.send(self.upsert(id, record));
            }
            Command::UpsertMany { rows, reply } => {
                let applied = rows
                    .into_iter()
                    .map(|(id, record)| self.upsert(id, record))
                    .collect();
                let _ = reply.send(applied);
            }
            Command::Edit { id, edit, reply } => {
                let _ = reply.send(self.edit(id, edit));
            }
            Command::Remove { id, reply } => {
                let _ = reply.send(self.remove(id));
            }
            Command::Apply { change, reply } => {
                let result = match change {
                    Applied::Upsert(id, record) => Some(self.upsert(id, record)),
                    Applied::Remove(id) => {
                        self.remove(id);
                        None
                    }
                };
                let _ = reply.send(result);
            }
            Command::Clear { reply } => {
                let removed = {
                    let mut entities = self.write();
                    let n = entities.len();
                    entities.clear();
                    n
                };
                debug!(cache = %self.name, removed, "cache cleared");
                self.emit(CacheEvent::Cleared);
                let _ = reply.send(removed);
            }
            Command::Barrier { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<EntityId, CachedEntity>> {
        self.shared
            .entities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CacheEvent) {
        // No subscribers is fine.
        let _ = self.shared.events.send(event);
    }

    fn upsert(&mut self, id: EntityId, record: Record) -> CachedEntity {
        let now = Utc::now();
        let row = RowHandle(self.next_row);
        let (entity, created) = {
            let mut entities = self.write();
            match entities.get_mut(&id) {
                Some(existing) => {
                    existing.fields.merge(&record);
                    existing.fields.set_id(id);
                    existing.revision += 1;
                    existing.reconciled_at = now;
                    (existing.clone(), false)
                }
                None => {
                    let mut fields = record;
                    fields.set_id(id);
                    let entity = CachedEntity {
                        id,
                        fields,
                        row,
                        revision: 1,
                        reconciled_at: now,
                    };
                    entities.insert(id, entity.clone());
                    (entity, true)
                }
            }
        };
        if created {
            self.next_row += 1;
        }
        self.emit(CacheEvent::Upserted(entity.clone()));
        entity
    }

    fn edit(&mut self, id: EntityId, edit: EditFn) -> Option<CachedEntity> {
        let edited = {
            let mut entities = self.write();
            entities.get_mut(&id).map(|entity| {
                edit(&mut entity.fields);
                entity.fields.set_id(id);
                entity.revision += 1;
                entity.reconciled_at = Utc::now();
                entity.clone()
            })
        };
        if let Some(entity) = &edited {
            self.emit(CacheEvent::Upserted(entity.clone()));
        }
        edited
    }

    fn remove(&mut self, id: EntityId) -> bool {
        let removed = self.write().remove(&id).is_some();
        if removed {
            self.emit(CacheEvent::Removed(id));
        }
        removed
    }
}
