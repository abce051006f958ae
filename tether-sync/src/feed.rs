//! Realtime change feed.
//!
//! [`ChangeFeed::subscribe`] opens (or joins) the channel of a table,
//! registers one listener per requested change kind and only then
//! activates the channel. The returned [`Subscription`] yields
//! [`RemoteChange`]s until it is cancelled or dropped.
//!
//! Channels are shared between subscriptions to the same table and
//! released when the last of them goes away. The feed is best-effort: it
//! does not replay events missed while disconnected.

use crate::error::{SyncError, SyncResult};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tether_cache::LocalCache;
use tether_remote::{
    ChannelId, EventSink, Filter, ListenerId, ListenerSpec, RealtimeTransport, RowEvent,
    RowEventKind,
};
use tether_types::{ChangeKind, ChangeKinds, RemoteChange, TableId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Channel naming for the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Prefix of every channel name; the table name is appended.
    pub channel_prefix: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            channel_prefix: "realtime:public".to_string(),
        }
    }
}

impl FeedConfig {
    /// The channel carrying events of `table`.
    pub fn channel_for(&self, table: &TableId) -> ChannelId {
        ChannelId::new(format!("{}:{}", self.channel_prefix, table))
    }
}

fn wire_kind(kind: ChangeKind) -> RowEventKind {
    match kind {
        ChangeKind::Added => RowEventKind::Insert,
        ChangeKind::Modified => RowEventKind::Update,
        ChangeKind::Removed => RowEventKind::Delete,
    }
}

struct FeedShared<T> {
    transport: Arc<T>,
    config: FeedConfig,
    /// Number of live subscriptions per open channel.
    channels: Mutex<HashMap<ChannelId, usize>>,
}

impl<T: RealtimeTransport> FeedShared<T> {
    fn channels(&self) -> MutexGuard<'_, HashMap<ChannelId, usize>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts a new subscription on `channel` and registers its listeners.
    fn attach(
        &self,
        channel: &ChannelId,
        specs: impl IntoIterator<Item = ListenerSpec>,
        sink: &EventSink,
    ) -> Vec<ListenerId> {
        let mut channels = self.channels();
        *channels.entry(channel.clone()).or_insert(0) += 1;
        specs
            .into_iter()
            .map(|spec| self.transport.listen(channel, spec, sink.clone()))
            .collect()
    }

    /// Removes a subscription's listeners and releases the channel if it
    /// was the last one.
    ///
    /// The count and the transport change under one lock, so a concurrent
    /// [`attach`](Self::attach) sees the channel either still open or
    /// already released.
    fn detach(&self, channel: &ChannelId, listeners: &[ListenerId]) {
        let mut channels = self.channels();
        for listener in listeners {
            self.transport.unlisten(channel, *listener);
        }
        match channels.get_mut(channel) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                channels.remove(channel);
                debug!(%channel, "releasing channel");
                self.transport.release(channel);
            }
            None => {}
        }
    }
}

/// Per-table realtime subscriptions over a transport.
pub struct ChangeFeed<T> {
    shared: Arc<FeedShared<T>>,
}

impl<T> Clone for ChangeFeed<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: RealtimeTransport + 'static> ChangeFeed<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self::with_config(transport, FeedConfig::default())
    }

    pub fn with_config(transport: Arc<T>, config: FeedConfig) -> Self {
        Self {
            shared: Arc::new(FeedShared {
                transport,
                config,
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of subscriptions currently holding `table`'s channel.
    pub fn subscribers(&self, table: &TableId) -> usize {
        let channel = self.shared.config.channel_for(table);
        self.shared.channels().get(&channel).copied().unwrap_or(0)
    }

    /// Subscribes to changes of `table` matching `filter`.
    ///
    /// Every listener is registered before the channel is activated. If
    /// activation fails the listeners are removed again.
    pub async fn subscribe(
        &self,
        table: TableId,
        filter: Option<Filter>,
        kinds: ChangeKinds,
    ) -> SyncResult<Subscription> {
        if kinds.is_empty() {
            return Err(SyncError::Validation("no change kinds requested".into()));
        }
        let channel = self.shared.config.channel_for(&table);
        let (sink, events) = mpsc::unbounded_channel();

        let specs = kinds.iter().map(|kind| ListenerSpec {
            table: table.clone(),
            kind: wire_kind(kind),
            filter: filter.clone(),
        });
        let listeners = self.shared.attach(&channel, specs, &sink);
        // Only the listeners keep the sink open from here on.
        drop(sink);

        let shared = self.shared.clone();
        let teardown_channel = channel.clone();
        let mut subscription = Subscription {
            table: table.clone(),
            events,
            teardown: Some(Box::new(move || {
                shared.detach(&teardown_channel, &listeners);
            })),
        };

        if let Err(e) = self.shared.transport.activate(&channel).await {
            warn!(%channel, error = %e, "channel activation failed");
            subscription.cancel();
            return Err(e.into());
        }
        debug!(%channel, %table, ?filter, "subscribed");
        Ok(subscription)
    }
}

type Teardown = Box<dyn FnOnce() + Send + Sync>;

/// A live subscription. Yields changes in delivery order.
///
/// Cancelling is idempotent and also happens on drop. After cancellation
/// the stream yields whatever was already delivered, then ends.
pub struct Subscription {
    table: TableId,
    events: mpsc::UnboundedReceiver<RowEvent>,
    teardown: Option<Teardown>,
}

impl Subscription {
    pub fn table(&self) -> &TableId {
        &self.table
    }

    pub fn is_active(&self) -> bool {
        self.teardown.is_some()
    }

    /// Next change, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<RemoteChange> {
        self.events.recv().await.map(RowEvent::into_change)
    }

    /// Unregisters the listeners and releases the channel if no other
    /// subscription holds it.
    pub fn cancel(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
            debug!(table = %self.table, "subscription cancelled");
        }
    }

    /// Applies every change to `cache` in arrival order on a spawned task.
    pub fn mirror_into(mut self, cache: LocalCache) -> MirrorHandle {
        let table = self.table.clone();
        let task = tokio::spawn(async move {
            while let Some(change) = self.next().await {
                if let Err(e) = cache.apply(change).await {
                    warn!(%table, error = %e, "dropping change");
                }
            }
            debug!(%table, "mirror stopped");
        });
        MirrorHandle { task }
    }
}

impl Stream for Subscription {
    type Item = RemoteChange;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RemoteChange>> {
        self.get_mut()
            .events
            .poll_recv(cx)
            .map(|event| event.map(RowEvent::into_change))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("table", &self.table)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Owns a [`Subscription::mirror_into`] pump. Stopping it (or dropping it)
/// cancels the subscription.
#[derive(Debug)]
pub struct MirrorHandle {
    task: JoinHandle<()>,
}

impl MirrorHandle {
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for MirrorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
