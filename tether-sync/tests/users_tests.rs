mod common;

use common::row;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tether_cache::LocalCache;
use tether_remote::memory::{RemoteCall, RemoteOp};
use tether_remote::{MemoryRemote, RemoteError, RemoteStore};
use tether_sync::{
    LoadState, SessionController, SessionState, SyncConfig, SyncError, UserRepository,
};
use tether_types::{BlobPath, EntityId, ImageFormat, TableId};

const PHONE: &str = "+15550100";

type Repo = UserRepository<MemoryRemote, MemoryRemote>;

struct Harness {
    remote: Arc<MemoryRemote>,
    session: Arc<SessionController<MemoryRemote>>,
    cache: LocalCache,
    repo: Repo,
    user_id: EntityId,
}

impl Harness {
    /// Anonymous repository with a registered password account.
    fn new() -> Self {
        common::init_tracing();
        let remote = Arc::new(MemoryRemote::new());
        let user_id = remote.register_account(PHONE, "secret");
        let session = Arc::new(SessionController::new(remote.clone()));
        let cache = LocalCache::new("users");
        let repo = UserRepository::new(
            remote.clone(),
            cache.clone(),
            session.clone(),
            SyncConfig::default(),
        );
        Self {
            remote,
            session,
            cache,
            repo,
            user_id,
        }
    }

    /// Signed in, with the user's row stored remotely and loaded.
    async fn signed_in() -> Self {
        let h = Self::new();
        h.remote
            .seed(&users(), row(h.user_id, "Ada").with("bio", "engineer"))
            .unwrap();
        h.sign_in().await;
        let state = h.current_state().await;
        assert!(matches!(state, LoadState::Loaded(Some(_))), "{state:?}");
        h
    }

    async fn sign_in(&self) {
        self.session
            .sign_in_with_password(PHONE, "secret")
            .await
            .unwrap();
    }

    async fn current_state(&self) -> LoadState<Option<tether_cache::CachedEntity>> {
        let mut rx = self.repo.subscribe_current_user().unwrap();
        common::settled(&mut rx).await
    }
}

fn users() -> TableId {
    TableId::users()
}

fn photo_path(id: EntityId) -> BlobPath {
    BlobPath::profile_photo(TableId::avatars(), id, ImageFormat::Jpg)
}

// ── Current user lifecycle ───────────────────────────────────────

#[tokio::test]
async fn sign_in_loads_current_user() {
    let h = Harness::signed_in().await;

    let current = h.repo.current_user().unwrap();
    assert_eq!(current.id, h.user_id);
    assert_eq!(current.get_str("name"), Some("Ada"));
    assert_eq!(h.repo.user(h.user_id), Some(current));
    assert_eq!(
        h.remote.calls().first(),
        Some(&RemoteCall::SignIn {
            phone: PHONE.into()
        })
    );
}

#[tokio::test]
async fn repository_built_while_signed_in_primes_from_cache() {
    common::init_tracing();
    let remote = Arc::new(MemoryRemote::new());
    let user_id = remote.register_account(PHONE, "secret");
    remote.seed(&users(), row(user_id, "Remote")).unwrap();
    let session = Arc::new(SessionController::new(remote.clone()));
    session.sign_in_with_password(PHONE, "secret").await.unwrap();
    let cache = LocalCache::new("users");
    cache.upsert(row(user_id, "Cached")).await.unwrap();
    remote.set_fetch_delay(Some(Duration::from_millis(50)));

    let repo = UserRepository::new(remote.clone(), cache, session, SyncConfig::default());
    assert_eq!(
        repo.current_user().and_then(|u| u.get_str("name").map(String::from)),
        Some("Cached".to_string())
    );

    let mut rx = repo.subscribe_current_user().unwrap();
    common::settled(&mut rx).await;
    assert_eq!(
        repo.current_user().unwrap().get_str("name"),
        Some("Remote")
    );
}

#[tokio::test]
async fn missing_remote_row_loads_as_none() {
    let h = Harness::new();
    h.sign_in().await;

    assert_eq!(h.current_state().await, LoadState::Loaded(None));
    assert_eq!(h.repo.current_user(), None);
}

#[tokio::test]
async fn logout_clears_current_user() {
    let h = Harness::signed_in().await;
    let mut rx = h.repo.subscribe_current_user().unwrap();

    h.session.logout().await.unwrap();
    h.cache.flush().await.unwrap();

    assert_eq!(h.repo.current_user(), None);
    assert_eq!(h.repo.user(h.user_id), None);
    assert_eq!(*rx.borrow_and_update(), LoadState::Idle);
    assert_eq!(
        h.repo.subscribe_current_user().unwrap_err(),
        SyncError::NotAuthorized
    );
}

#[tokio::test(start_paused = true)]
async fn logout_during_load_does_not_repopulate_cache() {
    let h = Harness::new();
    h.remote.seed(&users(), row(h.user_id, "Ada")).unwrap();
    h.remote.set_fetch_delay(Some(Duration::from_millis(100)));

    h.sign_in().await;
    let mut rx = h.repo.subscribe_current_user().unwrap();
    assert!(rx.borrow_and_update().is_loading());

    h.session.logout().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    h.cache.flush().await.unwrap();

    assert!(!h.cache.contains(h.user_id));
    assert_eq!(h.repo.current_user(), None);
    assert_eq!(*rx.borrow(), LoadState::Idle);
}

#[tokio::test]
async fn forced_sign_out_clears_current_user() {
    let h = Harness::signed_in().await;
    let _listener = h.session.listen_for_sign_out();
    let mut state = h.session.subscribe();

    h.remote.force_sign_out();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == SessionState::Anonymous),
    )
    .await
    .unwrap()
    .unwrap();
    h.session.end_session().await;
    h.cache.flush().await.unwrap();

    assert_eq!(h.repo.current_user(), None);
    assert!(!h.cache.contains(h.user_id));
}

#[tokio::test]
async fn update_current_user_refetches() {
    let h = Harness::signed_in().await;
    h.remote
        .update(&users(), h.user_id, row(h.user_id, "Ada L."))
        .await
        .unwrap();

    let fresh = h.repo.update_current_user().await.unwrap().unwrap();

    assert_eq!(fresh.get_str("name"), Some("Ada L."));
    assert_eq!(h.repo.current_user(), Some(fresh));
}

#[tokio::test]
async fn update_current_user_requires_session() {
    let h = Harness::new();

    let err = h.repo.update_current_user().await.unwrap_err();

    assert_eq!(err, SyncError::NotAuthorized);
}

// ── Other users ──────────────────────────────────────────────────

#[tokio::test]
async fn load_user_caches_result() {
    let h = Harness::new();
    let other = EntityId::new();
    h.remote.seed(&users(), row(other, "Grace")).unwrap();

    let loaded = h.repo.load_user(other).await.unwrap().unwrap();

    assert_eq!(loaded.get_str("name"), Some("Grace"));
    assert_eq!(h.repo.user(other), Some(loaded));
    assert_eq!(h.repo.load_user(EntityId::new()).await.unwrap(), None);
}

#[tokio::test]
async fn concurrent_load_user_fetches_once() {
    let h = Harness::new();
    let other = EntityId::new();
    h.remote.seed(&users(), row(other, "Grace")).unwrap();
    h.remote.set_fetch_delay(Some(Duration::from_millis(20)));

    let (a, b, c) = tokio::join!(
        h.repo.load_user(other),
        h.repo.load_user(other),
        h.repo.load_user(other)
    );

    assert_eq!(a.unwrap(), b.unwrap());
    assert!(c.unwrap().is_some());
    assert_eq!(h.remote.call_count(RemoteOp::FetchById), 1);
}

#[tokio::test]
async fn load_user_failure_leaves_cache_untouched() {
    let h = Harness::new();
    let other = EntityId::new();
    h.remote
        .fail_once(RemoteOp::FetchById, RemoteError::Network("offline".into()));

    let err = h.repo.load_user(other).await.unwrap_err();

    assert_eq!(err, SyncError::Remote(RemoteError::Network("offline".into())));
    assert!(h.cache.is_empty());
}

// ── Create ───────────────────────────────────────────────────────

#[tokio::test]
async fn create_user_inserts_and_becomes_current() {
    let h = Harness::new();
    h.sign_in().await;
    h.current_state().await;

    let created = h
        .repo
        .create_user(|fields| {
            fields.insert("name", "Ada");
        })
        .await
        .unwrap();

    assert_eq!(created.id, h.user_id);
    assert_eq!(created.get_str("name"), Some("Ada"));
    assert_eq!(
        h.remote.row(&users(), h.user_id).unwrap().get_str("name"),
        Some("Ada")
    );
    assert_eq!(h.repo.current_user(), Some(created));
}

#[tokio::test]
async fn create_user_forces_session_id() {
    let h = Harness::new();
    h.sign_in().await;

    let created = h
        .repo
        .create_user(|fields| fields.set_id(EntityId::new()))
        .await
        .unwrap();

    assert_eq!(created.id, h.user_id);
}

#[tokio::test]
async fn create_user_requires_session() {
    let h = Harness::new();

    let err = h.repo.create_user(|_| {}).await.unwrap_err();

    assert_eq!(err, SyncError::NotAuthorized);
    assert_eq!(h.remote.call_count(RemoteOp::Insert), 0);
}

#[tokio::test]
async fn create_user_with_photo_uploads_first() {
    let h = Harness::new();
    h.sign_in().await;

    let created = h
        .repo
        .create_user_with_photo(
            |fields| {
                fields.insert("name", "Ada");
            },
            Some(vec![0xFF, 0xD8, 0xFF]),
        )
        .await
        .unwrap();

    let path = photo_path(h.user_id);
    assert_eq!(created.get_str("profile_photo"), Some(path.key().as_str()));
    assert_eq!(
        h.remote.blob(&path),
        Some((vec![0xFF, 0xD8, 0xFF], "image/jpg".to_string()))
    );
    let ops: Vec<RemoteOp> = h.remote.calls().iter().filter_map(RemoteCall::op).collect();
    let delete = ops.iter().position(|op| *op == RemoteOp::DeleteBlob).unwrap();
    let upload = ops.iter().position(|op| *op == RemoteOp::UploadBlob).unwrap();
    let insert = ops.iter().position(|op| *op == RemoteOp::Insert).unwrap();
    assert!(delete < upload && upload < insert);
}

#[tokio::test]
async fn create_user_without_photo_stores_null() {
    let h = Harness::new();
    h.sign_in().await;

    let created = h.repo.create_user_with_photo(|_| {}, None).await.unwrap();

    assert_eq!(created.get("profile_photo"), Some(&serde_json::Value::Null));
    assert_eq!(h.remote.call_count(RemoteOp::UploadBlob), 0);
}

#[tokio::test]
async fn empty_photo_is_rejected() {
    let h = Harness::new();
    h.sign_in().await;

    let err = h
        .repo
        .create_user_with_photo(|_| {}, Some(Vec::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Validation(_)));
    assert_eq!(h.remote.call_count(RemoteOp::Insert), 0);
}

// ── Edit ─────────────────────────────────────────────────────────

#[tokio::test]
async fn edit_sends_full_field_set_then_updates_cache() {
    let h = Harness::signed_in().await;

    let edited = h
        .repo
        .edit_current_user(|fields| {
            fields.insert("name", "Ada Lovelace");
        })
        .await
        .unwrap();

    assert_eq!(edited.get_str("name"), Some("Ada Lovelace"));
    assert_eq!(edited.get_str("bio"), Some("engineer"));
    assert_eq!(h.repo.user(h.user_id), Some(edited.clone()));
    assert_eq!(h.repo.current_user(), Some(edited));

    let sent = h
        .remote
        .calls()
        .into_iter()
        .find_map(|c| match c {
            RemoteCall::Update { fields, .. } => Some(fields),
            _ => None,
        })
        .unwrap();
    assert_eq!(sent.get_str("bio"), Some("engineer"));
    assert_eq!(sent.id(), Some(h.user_id));
}

#[tokio::test]
async fn failed_edit_leaves_cache_unchanged() {
    let h = Harness::signed_in().await;
    let before = h.repo.current_user().unwrap();
    h.remote
        .fail_once(RemoteOp::Update, RemoteError::Network("offline".into()));

    let err = h
        .repo
        .edit_current_user(|fields| {
            fields.insert("name", "Nope");
        })
        .await
        .unwrap_err();

    assert_eq!(err, SyncError::Remote(RemoteError::Network("offline".into())));
    h.cache.flush().await.unwrap();
    assert_eq!(h.repo.user(h.user_id), Some(before.clone()));
    assert_eq!(h.repo.current_user(), Some(before));
    assert_eq!(
        h.remote.row(&users(), h.user_id).unwrap().get_str("name"),
        Some("Ada")
    );
}

#[tokio::test]
async fn edit_without_current_user_is_not_authorized() {
    let h = Harness::new();

    let err = h.repo.edit_current_user(|_| {}).await.unwrap_err();

    assert_eq!(err, SyncError::NotAuthorized);
    assert_eq!(h.remote.call_count(RemoteOp::Update), 0);
}

#[tokio::test]
async fn edit_with_photo_replaces_or_keeps_key() {
    let h = Harness::signed_in().await;
    let path = photo_path(h.user_id);

    let edited = h
        .repo
        .edit_current_user_with_photo(Some(vec![1, 2, 3]), |_| {})
        .await
        .unwrap();
    assert_eq!(edited.get_str("profile_photo"), Some(path.key().as_str()));

    let edited = h
        .repo
        .edit_current_user_with_photo(None, |fields| {
            fields.insert("name", "Ada");
        })
        .await
        .unwrap();
    assert_eq!(edited.get_str("profile_photo"), Some(path.key().as_str()));
    assert_eq!(h.remote.call_count(RemoteOp::UploadBlob), 1);
}

// ── Photos ───────────────────────────────────────────────────────

#[tokio::test]
async fn profile_photo_url_signs_blob_keys() {
    let h = Harness::signed_in().await;
    let user = h
        .repo
        .edit_current_user_with_photo(Some(vec![9]), |_| {})
        .await
        .unwrap();

    let url = h.repo.profile_photo_url(&user).await.unwrap();

    assert_eq!(
        url,
        Some(format!("memory://avatars/{}.jpg?expires_in=60", h.user_id))
    );
}

#[tokio::test]
async fn profile_photo_url_passes_urls_through() {
    let h = Harness::signed_in().await;

    let user = h
        .repo
        .edit_current_user(|fields| {
            fields.insert("profile_photo", "https://cdn.example.com/a.png");
        })
        .await
        .unwrap();
    assert_eq!(
        h.repo.profile_photo_url(&user).await.unwrap().as_deref(),
        Some("https://cdn.example.com/a.png")
    );

    let user = h
        .repo
        .edit_current_user(|fields| {
            fields.insert("profile_photo", serde_json::Value::Null);
        })
        .await
        .unwrap();
    assert_eq!(h.repo.profile_photo_url(&user).await.unwrap(), None);
    assert_eq!(h.remote.call_count(RemoteOp::SignedUrl), 0);
}

#[tokio::test]
async fn malformed_photo_key_is_a_validation_error() {
    let h = Harness::signed_in().await;
    let user = h
        .repo
        .edit_current_user(|fields| {
            fields.insert("profile_photo", "no-bucket");
        })
        .await
        .unwrap();

    let err = h.repo.profile_photo_url(&user).await.unwrap_err();

    assert!(matches!(err, SyncError::Validation(_)));
}

// ── Account deletion ─────────────────────────────────────────────

#[tokio::test]
async fn delete_account_removes_row_and_logs_out() {
    let h = Harness::signed_in().await;

    h.repo.delete_account().await.unwrap();
    h.cache.flush().await.unwrap();

    assert_eq!(h.remote.row(&users(), h.user_id), None);
    assert!(!h.session.is_logged_in());
    assert_eq!(h.repo.current_user(), None);
    assert!(!h.cache.contains(h.user_id));
}

#[tokio::test]
async fn delete_account_ignores_logout_failure() {
    let h = Harness::signed_in().await;
    h.remote
        .fail_once(RemoteOp::SignOut, RemoteError::Network("offline".into()));

    h.repo.delete_account().await.unwrap();

    assert!(!h.session.is_logged_in());
}

#[tokio::test]
async fn failed_delete_keeps_session() {
    let h = Harness::signed_in().await;
    h.remote
        .fail_once(RemoteOp::Delete, RemoteError::Http {
            status: 500,
            message: "boom".into(),
        });

    let err = h.repo.delete_account().await.unwrap_err();

    assert!(matches!(err, SyncError::Remote(RemoteError::Http { status: 500, .. })));
    assert!(h.session.is_logged_in());
    assert!(h.repo.current_user().is_some());
}
