//! Local entity cache for tether.
//!
//! Entities are keyed by [`EntityId`](tether_types::EntityId) and hold the
//! last reconciled field set. Reads are non-blocking snapshots usable from
//! any task. Every mutation goes through one ordered queue per cache, so two
//! writers never interleave partially and writes to the same key apply in
//! arrival order.
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use tether_cache::LocalCache;
//! use tether_types::{EntityId, Record};
//!
//! let cache = LocalCache::new("users");
//! let id = EntityId::new();
//! let mut row = Record::new().with("name", "A");
//! row.set_id(id);
//!
//! cache.upsert(row).await.unwrap();
//! assert_eq!(cache.read(id).unwrap().get_str("name"), Some("A"));
//! # }
//! ```

mod cache;
mod entity;
mod error;

pub use cache::{CacheEvent, CacheOp, LocalCache};
pub use entity::{CachedEntity, RowHandle};
pub use error::{CacheError, CacheResult};
