//! Sync layer configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_types::{ImageFormat, TableId};

/// Where user profiles and their photos live, and how they are read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Table holding user profiles.
    pub users_table: TableId,
    /// Bucket holding profile photos.
    pub avatars_bucket: TableId,
    /// Column projection used when fetching a user.
    pub user_select: String,
    /// Column holding the profile photo reference.
    pub photo_field: String,
    /// Lifetime of signed photo URLs.
    pub signed_url_ttl_secs: u64,
    /// Encoding of uploaded profile photos.
    pub avatar_format: ImageFormat,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            users_table: TableId::users(),
            avatars_bucket: TableId::avatars(),
            user_select: "*".to_string(),
            photo_field: "profile_photo".to_string(),
            signed_url_ttl_secs: 60,
            avatar_format: ImageFormat::Jpg,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn with_users_table(mut self, table: impl Into<TableId>) -> Self {
        self.users_table = table.into();
        self
    }

    #[must_use]
    pub fn with_avatars_bucket(mut self, bucket: impl Into<TableId>) -> Self {
        self.avatars_bucket = bucket.into();
        self
    }

    #[must_use]
    pub fn with_user_select(mut self, select: impl Into<String>) -> Self {
        self.user_select = select.into();
        self
    }

    #[must_use]
    pub fn with_avatar_format(mut self, format: ImageFormat) -> Self {
        self.avatar_format = format;
        self
    }

    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_secs)
    }
}
