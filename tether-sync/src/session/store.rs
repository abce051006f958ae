//! Session persistence.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tether_types::Session;
use tokio::fs;
use tracing::debug;

/// Where the current session survives restarts.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The persisted session, if any.
    async fn load(&self) -> SyncResult<Option<Session>>;

    async fn save(&self, session: &Session) -> SyncResult<()>;

    /// Forgets the persisted session. Clearing an empty store succeeds.
    async fn clear(&self) -> SyncResult<()>;
}

/// Process-local store. The default for a controller.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> SyncResult<Option<Session>> {
        Ok(self.slot().clone())
    }

    async fn save(&self, session: &Session) -> SyncResult<()> {
        *self.slot() = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> SyncResult<()> {
        self.slot().take();
        Ok(())
    }
}

/// Stores the session as JSON in a single file.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        PathBuf::from(staging)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> SyncResult<Option<Session>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SyncError::Storage(format!(
                    "failed to read session file: {e}"
                )));
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SyncError::Storage(format!("corrupt session file: {e}")))
    }

    async fn save(&self, session: &Session) -> SyncResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::Storage(format!("failed to create session dir: {e}")))?;
        }
        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| SyncError::Storage(format!("failed to encode session: {e}")))?;

        // Readers see either the old file or the new one.
        let staging = self.staging_path();
        fs::write(&staging, json)
            .await
            .map_err(|e| SyncError::Storage(format!("failed to write session file: {e}")))?;
        fs::rename(&staging, &self.path)
            .await
            .map_err(|e| SyncError::Storage(format!("failed to replace session file: {e}")))?;
        debug!(path = ?self.path, "session saved");
        Ok(())
    }

    async fn clear(&self) -> SyncResult<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::Storage(format!(
                "failed to remove session file: {e}"
            ))),
        }
    }
}
