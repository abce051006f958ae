//! Shared helpers for sync tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tether_remote::MemoryRemote;
use tether_sync::{LoadState, SessionController};
use tether_types::{EntityId, Record};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Routes `tracing` output to the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn row(id: EntityId, name: &str) -> Record {
    let mut r = Record::new().with("name", name);
    r.set_id(id);
    r
}

/// A remote and a controller signed in with a password account.
pub async fn signed_in(phone: &str) -> (Arc<MemoryRemote>, Arc<SessionController<MemoryRemote>>) {
    let remote = Arc::new(MemoryRemote::new());
    remote.register_account(phone, "secret");
    let session = Arc::new(SessionController::new(remote.clone()));
    session
        .sign_in_with_password(phone, "secret")
        .await
        .expect("password sign-in");
    (remote, session)
}

/// Waits until `rx` leaves the loading state, with a timeout.
pub async fn settled<V: Clone>(rx: &mut watch::Receiver<LoadState<V>>) -> LoadState<V> {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| !s.is_loading()))
        .await
        .expect("load did not settle")
        .expect("state channel closed")
        .clone()
}
