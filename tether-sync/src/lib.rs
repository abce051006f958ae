//! Sync layer for tether.
//!
//! Keeps a [`LocalCache`](tether_cache::LocalCache) consistent with a remote
//! store under a session that can start, end, or be revoked at any time:
//!
//! - [`LoadEngine`]: single-flight, cancellable loads with generation tags
//! - [`ChangeFeed`]: realtime row events as typed [`RemoteChange`](tether_types::RemoteChange)s
//! - [`SessionController`]: the anonymous / authenticating / authenticated
//!   state machine and the hooks run on each transition
//! - [`UserRepository`]: the signed-in user's profile, wired to all three

pub mod config;
pub mod error;
pub mod feed;
pub mod loadable;
pub mod session;
pub mod users;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use feed::{ChangeFeed, FeedConfig, MirrorHandle, Subscription};
pub use loadable::{LoadEngine, LoadHandle, LoadKey, LoadState, LoadTicket};
pub use session::{
    AuthListener, FileSessionStore, MemorySessionStore, SessionController, SessionScoped,
    SessionState, SessionStore,
};
pub use users::UserRepository;
