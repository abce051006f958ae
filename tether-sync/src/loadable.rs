//! Single-flight, cancellable loads.
//!
//! A [`LoadEngine`] tracks one slot per key. Each fetch started for a key
//! is a *generation* tagged with a number drawn from one monotonically
//! increasing counter. At most one generation per key is in flight; only
//! the in-flight generation may publish `Loaded` or `Failed`, and only it
//! may run reconciliation through its [`LoadTicket`].
//!
//! Two entry points decide what happens when a fetch is already running:
//! [`LoadEngine::load`] attaches to it, [`LoadEngine::reload`] aborts it and
//! starts a new generation. Callers attached to a superseded generation
//! follow the chain and receive the outcome of the generation that
//! replaced it.
//!
//! A slot is dropped once it is back to `Idle` with no value and no
//! watchers. Slots holding a value stay until it is cleared with
//! [`LoadEngine::set_value`].

use crate::error::{SyncError, SyncResult};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tether_types::{EntityId, TableId};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Key of an entity load: the entity kind (its table) plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoadKey {
    pub kind: TableId,
    pub id: EntityId,
}

impl LoadKey {
    pub fn new(kind: TableId, id: EntityId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for LoadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Observable state of one key.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadState<V> {
    Idle,
    Loading { generation: u64 },
    Loaded(V),
    Failed(SyncError),
}

impl<V> LoadState<V> {
    pub fn is_loading(&self) -> bool {
        matches!(self, LoadState::Loading { .. })
    }
}

/// What became of one generation.
#[derive(Clone)]
enum Outcome<V> {
    Pending,
    Settled(SyncResult<V>),
    /// Replaced by a newer generation, whose outcome channel is attached.
    Superseded(watch::Receiver<Outcome<V>>),
    Cancelled,
}

struct Flight<V> {
    generation: u64,
    outcome: watch::Sender<Outcome<V>>,
    task: AbortHandle,
}

struct Slot<V> {
    state: watch::Sender<LoadState<V>>,
    value: Option<V>,
    flight: Option<Flight<V>>,
}

impl<V> Slot<V> {
    fn new() -> Self {
        let (state, _) = watch::channel(LoadState::Idle);
        Self {
            state,
            value: None,
            flight: None,
        }
    }

    fn is_unused(&self) -> bool {
        self.flight.is_none() && self.value.is_none() && self.state.receiver_count() == 0
    }
}

struct Inner<K, V> {
    next_generation: u64,
    slots: HashMap<K, Slot<V>>,
}

impl<K: Eq + Hash, V> Inner<K, V> {
    fn is_current(&self, key: &K, generation: u64) -> bool {
        self.slots
            .get(key)
            .and_then(|slot| slot.flight.as_ref())
            .is_some_and(|flight| flight.generation == generation)
    }

    fn prune(&mut self, key: &K) {
        let idle = self.slots.get(key).is_some_and(Slot::is_unused);
        if idle {
            self.slots.remove(key);
        }
    }
}

/// Single-flight loader keyed by `K`, producing `V`.
pub struct LoadEngine<K, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
}

impl<K, V> Clone for LoadEngine<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Default for LoadEngine<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> LoadEngine<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_generation: 0,
                slots: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads `key`, attaching to the in-flight generation if there is one.
    /// `fetch` is only invoked when a new generation starts.
    ///
    /// The fetch runs on a spawned task from the moment this returns;
    /// dropping the handle does not stop it.
    pub fn load<F, Fut>(&self, key: K, fetch: F) -> LoadHandle<V>
    where
        F: FnOnce(LoadTicket<K, V>) -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<V>> + Send + 'static,
    {
        let mut inner = self.lock();
        let attached = inner
            .slots
            .get(&key)
            .and_then(|slot| slot.flight.as_ref())
            .map(|flight| {
                debug!(?key, generation = flight.generation, "joining in-flight load");
                flight.outcome.subscribe()
            });
        let outcome = match attached {
            Some(outcome) => outcome,
            None => self.start(&mut inner, key, fetch),
        };
        LoadHandle::new(outcome)
    }

    /// Starts a fresh generation for `key`. An in-flight generation is
    /// aborted, its result discarded, and its callers moved to the new one.
    pub fn reload<F, Fut>(&self, key: K, fetch: F) -> LoadHandle<V>
    where
        F: FnOnce(LoadTicket<K, V>) -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<V>> + Send + 'static,
    {
        let mut inner = self.lock();
        let previous = inner
            .slots
            .get_mut(&key)
            .and_then(|slot| slot.flight.take());
        let outcome = self.start(&mut inner, key.clone(), fetch);

        if let Some(previous) = previous {
            debug!(?key, generation = previous.generation, "superseding load");
            previous.task.abort();
            previous
                .outcome
                .send_replace(Outcome::Superseded(outcome.clone()));
        }
        LoadHandle::new(outcome)
    }

    fn start<F, Fut>(
        &self,
        inner: &mut Inner<K, V>,
        key: K,
        fetch: F,
    ) -> watch::Receiver<Outcome<V>>
    where
        F: FnOnce(LoadTicket<K, V>) -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<V>> + Send + 'static,
    {
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let (outcome_tx, outcome_rx) = watch::channel(Outcome::Pending);

        let ticket = LoadTicket {
            engine: self.clone(),
            key: key.clone(),
            generation,
        };
        let engine = self.clone();
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let result = AssertUnwindSafe(async move { fetch(ticket).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(SyncError::Storage("fetch panicked".into())));
            engine.finish(&task_key, generation, result);
        });

        let slot = inner.slots.entry(key.clone()).or_insert_with(Slot::new);
        slot.flight = Some(Flight {
            generation,
            outcome: outcome_tx,
            task: task.abort_handle(),
        });
        slot.state.send_replace(LoadState::Loading { generation });
        debug!(?key, generation, "load started");
        outcome_rx
    }

    /// Publishes the result of `generation` if it is still the current one.
    fn finish(&self, key: &K, generation: u64, result: SyncResult<V>) {
        let mut inner = self.lock();
        let Some(slot) = inner.slots.get_mut(key) else {
            return;
        };
        let Some(flight) = slot.flight.take_if(|f| f.generation == generation) else {
            debug!(?key, generation, "discarding stale load result");
            return;
        };

        match &result {
            Ok(value) => {
                slot.value = Some(value.clone());
                slot.state.send_replace(LoadState::Loaded(value.clone()));
                debug!(?key, generation, "load finished");
            }
            // A fetch that gave up on its own is not a failure.
            Err(error) if error.is_cancelled() => {
                debug!(?key, generation, "load abandoned by fetch");
                slot.state.send_replace(match &slot.value {
                    Some(value) => LoadState::Loaded(value.clone()),
                    None => LoadState::Idle,
                });
            }
            Err(error) => {
                warn!(?key, generation, %error, "load failed");
                slot.state.send_replace(LoadState::Failed(error.clone()));
            }
        }
        let abandoned = matches!(&result, Err(e) if e.is_cancelled());
        flight.outcome.send_replace(Outcome::Settled(result));
        if abandoned {
            inner.prune(key);
        }
    }

    /// Drops the in-flight generation of `key` without side effects.
    /// Its result, if it still arrives, is discarded and attached callers
    /// resolve to [`SyncError::Cancelled`]. The state returns to `Idle`.
    pub fn cancel_loading(&self, key: &K) -> bool {
        let mut inner = self.lock();
        let Some(slot) = inner.slots.get_mut(key) else {
            return false;
        };
        let Some(flight) = slot.flight.take() else {
            return false;
        };
        debug!(?key, generation = flight.generation, "load cancelled");
        flight.task.abort();
        flight.outcome.send_replace(Outcome::Cancelled);
        slot.state.send_replace(LoadState::Idle);
        inner.prune(key);
        true
    }

    /// Cancels every in-flight generation. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut inner = self.lock();
        let mut cancelled = 0;
        for slot in inner.slots.values_mut() {
            if let Some(flight) = slot.flight.take() {
                flight.task.abort();
                flight.outcome.send_replace(Outcome::Cancelled);
                slot.state.send_replace(LoadState::Idle);
                cancelled += 1;
            }
        }
        inner.slots.retain(|_, slot| !slot.is_unused());
        if cancelled > 0 {
            debug!(cancelled, "all loads cancelled");
        }
        cancelled
    }

    /// Current state of `key`.
    pub fn state(&self, key: &K) -> LoadState<V> {
        self.lock()
            .slots
            .get(key)
            .map_or(LoadState::Idle, |slot| slot.state.borrow().clone())
    }

    /// Last loaded (or explicitly set) value of `key`. Kept while a newer
    /// generation is loading.
    pub fn value(&self, key: &K) -> Option<V> {
        self.lock().slots.get(key).and_then(|slot| slot.value.clone())
    }

    /// Overwrites the value of `key`. When nothing is in flight the state
    /// follows: `Loaded(v)` for `Some(v)`, `Idle` for `None`.
    pub fn set_value(&self, key: &K, value: Option<V>) {
        let mut inner = self.lock();
        let slot = inner.slots.entry(key.clone()).or_insert_with(Slot::new);
        if slot.flight.is_none() {
            slot.state.send_replace(match &value {
                Some(v) => LoadState::Loaded(v.clone()),
                None => LoadState::Idle,
            });
        }
        slot.value = value;
        inner.prune(key);
    }

    /// Watches the state of `key`.
    pub fn watch(&self, key: &K) -> watch::Receiver<LoadState<V>> {
        self.lock()
            .slots
            .entry(key.clone())
            .or_insert_with(Slot::new)
            .state
            .subscribe()
    }

    pub fn is_loading(&self, key: &K) -> bool {
        self.lock()
            .slots
            .get(key)
            .is_some_and(|slot| slot.flight.is_some())
    }

    /// Number of keys the engine holds state for.
    pub fn tracked(&self) -> usize {
        self.lock().slots.len()
    }

    /// Number of keys with a generation in flight.
    pub fn in_flight(&self) -> usize {
        self.lock()
            .slots
            .values()
            .filter(|slot| slot.flight.is_some())
            .count()
    }
}

/// Capability handed to a fetch: lets it reconcile only while its
/// generation is current.
pub struct LoadTicket<K, V> {
    engine: LoadEngine<K, V>,
    key: K,
    generation: u64,
}

impl<K, V> LoadTicket<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.engine.lock().is_current(&self.key, self.generation)
    }

    /// Runs `f` atomically with respect to cancellation: either the
    /// generation is current and `f` runs before any later cancel, or `f`
    /// does not run and this returns [`SyncError::Cancelled`].
    ///
    /// `f` runs with the engine locked and must not call back into it.
    /// Enqueueing a cache mutation here orders it before the mutations a
    /// cancelling caller enqueues afterwards.
    pub fn apply<T>(&self, f: impl FnOnce() -> T) -> SyncResult<T> {
        let inner = self.engine.lock();
        if inner.is_current(&self.key, self.generation) {
            Ok(f())
        } else {
            debug!(key = ?self.key, generation = self.generation, "skipping stale reconcile");
            Err(SyncError::Cancelled)
        }
    }
}

/// Outcome of a load, as seen by one caller.
///
/// Resolves to the result of the generation the caller joined, or of the
/// generation that superseded it. Resolves to [`SyncError::Cancelled`] when
/// the load is cancelled.
pub struct LoadHandle<V> {
    inner: BoxFuture<'static, SyncResult<V>>,
}

impl<V: Clone + Send + Sync + 'static> LoadHandle<V> {
    fn new(outcome: watch::Receiver<Outcome<V>>) -> Self {
        Self {
            inner: Box::pin(follow(outcome)),
        }
    }
}

async fn follow<V: Clone + Send + Sync>(mut outcome: watch::Receiver<Outcome<V>>) -> SyncResult<V> {
    loop {
        let settled = outcome
            .wait_for(|o| !matches!(o, Outcome::Pending))
            .await
            .map(|o| o.clone());
        match settled {
            Ok(Outcome::Settled(result)) => return result,
            Ok(Outcome::Superseded(next)) => outcome = next,
            Ok(Outcome::Cancelled | Outcome::Pending) | Err(_) => return Err(SyncError::Cancelled),
        }
    }
}

impl<V> Future for LoadHandle<V> {
    type Output = SyncResult<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.as_mut().poll(cx)
    }
}

impl<V> fmt::Debug for LoadHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadHandle").finish_non_exhaustive()
    }
}
