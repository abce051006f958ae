//! Cached entity representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_types::{EntityId, Record};

/// Handle of the storage row backing a cached entity. Assigned once, when the
/// entity is first inserted, and never reused within a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowHandle(pub(crate) u64);

impl RowHandle {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A locally cached entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity {
    /// Stable identifier.
    pub id: EntityId,
    /// Last known reconciled field set, always including `id`.
    pub fields: Record,
    /// Storage row backing this entity.
    pub row: RowHandle,
    /// Incremented on every applied mutation.
    pub revision: u64,
    /// When the last mutation was applied.
    pub reconciled_at: DateTime<Utc>,
}

impl CachedEntity {
    /// Returns a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns a string field.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get_str(field)
    }
}
