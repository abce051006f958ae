//! Realtime transport seam.
//!
//! A transport multiplexes row event listeners over named channels. The
//! caller registers every listener on a channel first and then activates
//! it, so no event can fall between two registrations.

use crate::error::{RemoteError, RemoteResult};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tether_types::{Record, RemoteChange, TableId};
use tokio::sync::mpsc;

/// Name of a realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle of one registered listener, unique per transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Wire-level kind of a row event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowEventKind {
    Insert,
    Update,
    Delete,
}

/// A row event as delivered by the transport.
///
/// `record` is the full row for inserts and updates and the prior row for
/// deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct RowEvent {
    pub kind: RowEventKind,
    pub table: TableId,
    pub record: Record,
}

impl RowEvent {
    pub fn new(kind: RowEventKind, table: TableId, record: Record) -> Self {
        Self {
            kind,
            table,
            record,
        }
    }

    /// Converts the event into the typed change consumers see.
    pub fn into_change(self) -> RemoteChange {
        match self.kind {
            RowEventKind::Insert => RemoteChange::Added(self.record),
            RowEventKind::Update => RemoteChange::Modified(self.record),
            RowEventKind::Delete => RemoteChange::Removed(self.record),
        }
    }
}

/// Server-side row filter in `column=eq.value` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Filter {
    pub column: String,
    pub value: String,
}

impl Filter {
    /// Equality filter on `column`.
    pub fn eq(column: impl Into<String>, value: impl fmt::Display) -> Self {
        Self {
            column: column.into(),
            value: value.to_string(),
        }
    }

    /// Parses `column=eq.value`. Only equality is supported.
    pub fn parse(expr: &str) -> RemoteResult<Self> {
        let invalid = || RemoteError::Validation(format!("unsupported filter: {expr}"));
        let (column, rest) = expr.split_once('=').ok_or_else(invalid)?;
        let value = rest.strip_prefix("eq.").ok_or_else(invalid)?;
        if column.is_empty() {
            return Err(invalid());
        }
        Ok(Self::eq(column, value))
    }

    /// Whether `record` passes the filter. Non-string values compare by
    /// their JSON text; a missing or null column never matches.
    pub fn matches(&self, record: &Record) -> bool {
        match record.get(&self.column) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => *s == self.value,
            Some(other) => other.to_string() == self.value,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// What a listener wants to receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    pub table: TableId,
    pub kind: RowEventKind,
    pub filter: Option<Filter>,
}

impl ListenerSpec {
    /// Whether `event` should be delivered to this listener.
    pub fn accepts(&self, event: &RowEvent) -> bool {
        self.table == event.table
            && self.kind == event.kind
            && self.filter.as_ref().is_none_or(|f| f.matches(&event.record))
    }
}

/// Destination of delivered events.
pub type EventSink = mpsc::UnboundedSender<RowEvent>;

/// Channel-multiplexed row event delivery.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Registers a listener on `channel`, opening the channel if needed.
    fn listen(&self, channel: &ChannelId, spec: ListenerSpec, sink: EventSink) -> ListenerId;

    /// Unregisters a listener. Unknown ids are ignored.
    fn unlisten(&self, channel: &ChannelId, listener: ListenerId);

    /// Starts delivery on `channel` to every registered listener.
    async fn activate(&self, channel: &ChannelId) -> RemoteResult<()>;

    /// Unsubscribes and frees the channel. Releasing an unknown channel is a
    /// no-op.
    fn release(&self, channel: &ChannelId);
}
