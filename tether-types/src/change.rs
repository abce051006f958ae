//! Row-level changes pushed by the realtime feed.

use crate::{EntityId, Record};
use serde::{Deserialize, Serialize};

/// A typed change notification for one row.
///
/// `Added` and `Modified` carry the full new row, `Removed` carries the row
/// as it was before deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum RemoteChange {
    Added(Record),
    Modified(Record),
    Removed(Record),
}

impl RemoteChange {
    /// Which kind of change this is.
    pub fn kind(&self) -> ChangeKind {
        match self {
            RemoteChange::Added(_) => ChangeKind::Added,
            RemoteChange::Modified(_) => ChangeKind::Modified,
            RemoteChange::Removed(_) => ChangeKind::Removed,
        }
    }

    /// The row carried by the change.
    pub fn record(&self) -> &Record {
        match self {
            RemoteChange::Added(r) | RemoteChange::Modified(r) | RemoteChange::Removed(r) => r,
        }
    }

    /// Consumes the change, returning its row.
    pub fn into_record(self) -> Record {
        match self {
            RemoteChange::Added(r) | RemoteChange::Modified(r) | RemoteChange::Removed(r) => r,
        }
    }

    /// Identifier of the affected row, if the row carries one.
    pub fn id(&self) -> Option<EntityId> {
        self.record().id()
    }
}

/// Kind of a row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl ChangeKind {
    const fn bit(self) -> u8 {
        match self {
            ChangeKind::Added => 1 << 0,
            ChangeKind::Modified => 1 << 1,
            ChangeKind::Removed => 1 << 2,
        }
    }
}

/// A set of change kinds a subscriber is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChangeKinds(u8);

impl ChangeKinds {
    /// No kinds.
    pub const NONE: Self = Self(0);
    /// Inserts only.
    pub const ADDED: Self = Self(ChangeKind::Added.bit());
    /// Updates only.
    pub const MODIFIED: Self = Self(ChangeKind::Modified.bit());
    /// Deletes only.
    pub const REMOVED: Self = Self(ChangeKind::Removed.bit());
    /// Every kind.
    pub const ALL: Self = Self(0b111);

    /// Whether `kind` is in the set.
    pub fn contains(self, kind: ChangeKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Adds `kind` to the set.
    pub fn insert(&mut self, kind: ChangeKind) {
        self.0 |= kind.bit();
    }

    /// Whether the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates the kinds in the set in a fixed order.
    pub fn iter(self) -> impl Iterator<Item = ChangeKind> {
        [ChangeKind::Added, ChangeKind::Modified, ChangeKind::Removed]
            .into_iter()
            .filter(move |k| self.contains(*k))
    }
}

impl std::ops::BitOr for ChangeKinds {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<ChangeKind> for ChangeKinds {
    fn from(kind: ChangeKind) -> Self {
        Self(kind.bit())
    }
}

impl FromIterator<ChangeKind> for ChangeKinds {
    fn from_iter<I: IntoIterator<Item = ChangeKind>>(iter: I) -> Self {
        let mut set = Self::NONE;
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}
