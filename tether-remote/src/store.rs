//! Row and blob storage seam.

use crate::error::RemoteResult;
use async_trait::async_trait;
use std::time::Duration;
use tether_types::{BlobPath, EntityId, Record, TableId};

/// CRUD against named tables and storage buckets.
///
/// Implementations return raw rows and hold no caching logic.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetches one row by id, projecting `select` (`"*"` for all columns).
    /// An absent row is `Ok(None)`, not an error.
    async fn fetch_by_id(
        &self,
        table: &TableId,
        id: EntityId,
        select: &str,
    ) -> RemoteResult<Option<Record>>;

    /// Updates the row with `id`, returning the stored row.
    async fn update(&self, table: &TableId, id: EntityId, fields: Record) -> RemoteResult<Record>;

    /// Inserts or merges the row with `id`. The `id` is added to `fields`.
    async fn upsert(&self, table: &TableId, id: EntityId, fields: Record) -> RemoteResult<Record>;

    /// Inserts one row, returning the stored row.
    async fn insert(&self, table: &TableId, fields: Record) -> RemoteResult<Record>;

    /// Inserts several rows in one request.
    async fn insert_many(&self, table: &TableId, rows: Vec<Record>) -> RemoteResult<Vec<Record>>;

    /// Deletes the row with `id`. Deleting an absent row succeeds.
    async fn delete(&self, table: &TableId, id: EntityId) -> RemoteResult<()>;

    /// Uploads (or overwrites) a blob, returning its path.
    async fn upload_blob(
        &self,
        path: &BlobPath,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> RemoteResult<BlobPath>;

    /// Deletes a blob. Deleting an absent blob succeeds.
    async fn delete_blob(&self, path: &BlobPath) -> RemoteResult<()>;

    /// Returns a URL granting read access to the blob for `ttl`.
    async fn signed_url(&self, path: &BlobPath, ttl: Duration) -> RemoteResult<String>;
}
