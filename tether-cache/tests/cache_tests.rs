use pretty_assertions::assert_eq;
use serde_json::json;
use tether_cache::{CacheError, CacheEvent, LocalCache};
use tether_types::{EntityId, Record, RemoteChange};
use tokio_test::{assert_pending, assert_ready_ok, task};

fn row(id: EntityId, name: &str) -> Record {
    let mut r = Record::new().with("name", name);
    r.set_id(id);
    r
}

// ── Upsert ───────────────────────────────────────────────────────

#[tokio::test]
async fn upsert_creates_entity_with_first_revision() {
    let cache = LocalCache::new("users");
    let id = EntityId::new();

    let entity = cache.upsert(row(id, "A")).await.unwrap();

    assert_eq!(entity.id, id);
    assert_eq!(entity.revision, 1);
    assert_eq!(entity.get_str("name"), Some("A"));
    assert_eq!(cache.read(id), Some(entity));
    assert!(cache.contains(id));
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn upsert_merges_into_existing_entity() {
    let cache = LocalCache::new("users");
    let id = EntityId::new();
    let first = cache
        .upsert(row(id, "A").with("bio", "hello"))
        .await
        .unwrap();

    let second = cache.upsert(row(id, "B")).await.unwrap();

    assert_eq!(second.row, first.row);
    assert_eq!(second.revision, 2);
    assert_eq!(second.get_str("name"), Some("B"));
    assert_eq!(second.get_str("bio"), Some("hello"));
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn distinct_entities_get_distinct_rows() {
    let cache = LocalCache::new("users");
    let a = cache.upsert(row(EntityId::new(), "A")).await.unwrap();
    let b = cache.upsert(row(EntityId::new(), "B")).await.unwrap();

    assert!(a.row < b.row);
    assert_eq!(cache.ids(), vec![a.id, b.id]);
}

#[tokio::test]
async fn upsert_without_id_is_rejected() {
    let cache = LocalCache::new("users");

    let err = cache.upsert(Record::new().with("name", "A")).await.unwrap_err();
    assert!(matches!(err, CacheError::InvalidRecord(_)));

    let err = cache
        .upsert(Record::new().with("id", "not-a-uuid"))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidRecord(_)));
    assert!(cache.is_empty());
}

#[tokio::test]
async fn upsert_many_is_all_or_nothing() {
    let cache = LocalCache::new("users");
    let a = EntityId::new();
    let b = EntityId::new();

    let applied = cache
        .upsert_many(vec![row(a, "A"), row(b, "B")])
        .await
        .unwrap();
    assert_eq!(applied.len(), 2);

    let err = cache
        .upsert_many(vec![row(EntityId::new(), "C"), Record::new()])
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidRecord(_)));
    assert_eq!(cache.len(), 2);
}

// ── Ordering ─────────────────────────────────────────────────────

#[tokio::test]
async fn same_key_mutations_apply_in_call_order() {
    let cache = LocalCache::new("users");
    let id = EntityId::new();

    // Enqueued without awaiting in between.
    let ops: Vec<_> = (0..20)
        .map(|i| cache.upsert(row(id, &format!("v{i}"))))
        .collect();
    for op in ops {
        op.await.unwrap();
    }

    let entity = cache.read(id).unwrap();
    assert_eq!(entity.get_str("name"), Some("v19"));
    assert_eq!(entity.revision, 20);
}

#[tokio::test]
async fn remove_then_add_leaves_entity_present() {
    let cache = LocalCache::new("users");
    let id = EntityId::new();
    cache.upsert(row(id, "A")).await.unwrap();

    let removed = cache.remove(id);
    let added = cache.upsert(row(id, "B"));
    assert!(removed.await.unwrap());
    added.await.unwrap();

    assert_eq!(cache.read(id).unwrap().get_str("name"), Some("B"));
}

#[tokio::test]
async fn add_then_remove_leaves_entity_absent() {
    let cache = LocalCache::new("users");
    let id = EntityId::new();

    let added = cache.upsert(row(id, "A"));
    let removed = cache.remove(id);
    added.await.unwrap();
    assert!(removed.await.unwrap());

    assert_eq!(cache.read(id), None);
}

#[tokio::test]
async fn dropped_op_is_still_applied() {
    let cache = LocalCache::new("users");
    let id = EntityId::new();

    drop(cache.upsert(row(id, "A")));
    cache.flush().await.unwrap();

    assert!(cache.contains(id));
}

#[tokio::test]
async fn op_is_pending_until_queue_runs() {
    let cache = LocalCache::new("users");
    let id = EntityId::new();

    let mut op = task::spawn(cache.upsert(row(id, "A")));
    assert_pending!(op.poll());

    cache.flush().await.unwrap();
    assert!(op.is_woken());
    let entity = assert_ready_ok!(op.poll());
    assert_eq!(entity.id, id);
}

// ── Edit / remove / clear ────────────────────────────────────────

#[tokio::test]
async fn edit_changes_fields_and_keeps_id() {
    let cache = LocalCache::new("users");
    let id = EntityId::new();
    cache.upsert(row(id, "A")).await.unwrap();

    let edited = cache
        .edit(id, |fields| {
            fields.insert("name", "B");
            fields.insert("id", "tampered");
        })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(edited.get_str("name"), Some("B"));
    assert_eq!(edited.fields.id(), Some(id));
    assert_eq!(edited.revision, 2);
}

#[tokio::test]
async fn edit_of_missing_entity_resolves_to_none() {
    let cache = LocalCache::new("users");
    let edited = cache
        .edit(EntityId::new(), |fields| {
            fields.insert("name", "B");
        })
        .await
        .unwrap();
    assert_eq!(edited, None);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn remove_is_idempotent() {
    let cache = LocalCache::new("users");
    let id = EntityId::new();
    cache.upsert(row(id, "A")).await.unwrap();

    assert!(cache.remove(id).await.unwrap());
    assert!(!cache.remove(id).await.unwrap());
    assert!(!cache.remove(EntityId::new()).await.unwrap());
}

#[tokio::test]
async fn clear_reports_count() {
    let cache = LocalCache::new("users");
    for name in ["A", "B", "C"] {
        cache.upsert(row(EntityId::new(), name)).await.unwrap();
    }

    assert_eq!(cache.clear().await.unwrap(), 3);
    assert!(cache.is_empty());
    assert_eq!(cache.clear().await.unwrap(), 0);
}

#[tokio::test]
async fn rows_are_not_reused_after_remove() {
    let cache = LocalCache::new("users");
    let id = EntityId::new();
    let first = cache.upsert(row(id, "A")).await.unwrap();
    cache.remove(id).await.unwrap();

    let again = cache.upsert(row(id, "A")).await.unwrap();
    assert!(again.row > first.row);
    assert_eq!(again.revision, 1);
}

// ── Remote changes ───────────────────────────────────────────────

#[tokio::test]
async fn apply_maps_change_kinds() {
    let cache = LocalCache::new("users");
    let id = EntityId::new();

    let added = cache.apply(RemoteChange::Added(row(id, "A"))).await.unwrap();
    assert_eq!(added.unwrap().get_str("name"), Some("A"));

    cache
        .apply(RemoteChange::Modified(row(id, "B")))
        .await
        .unwrap();
    assert_eq!(cache.read(id).unwrap().get_str("name"), Some("B"));

    let removed = cache
        .apply(RemoteChange::Removed(row(id, "B")))
        .await
        .unwrap();
    assert_eq!(removed, None);
    assert!(!cache.contains(id));
}

#[tokio::test]
async fn apply_without_id_is_rejected() {
    let cache = LocalCache::new("users");
    let change = RemoteChange::Removed(Record::from_response(json!({"name": "A"})).unwrap());
    assert!(matches!(
        cache.apply(change).await,
        Err(CacheError::InvalidRecord(_))
    ));
}

// ── Queries ──────────────────────────────────────────────────────

#[tokio::test]
async fn find_and_snapshot_are_row_ordered() {
    let cache = LocalCache::new("users");
    let ids: Vec<_> = (0..4).map(|_| EntityId::new()).collect();
    for (i, id) in ids.iter().enumerate() {
        let parity = if i % 2 == 0 { "even" } else { "odd" };
        cache
            .upsert(row(*id, parity).with("n", i as u64))
            .await
            .unwrap();
    }

    let snapshot: Vec<_> = cache.snapshot().into_iter().map(|e| e.id).collect();
    assert_eq!(snapshot, ids);

    let even: Vec<_> = cache
        .find(|e| e.get_str("name") == Some("even"))
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(even, vec![ids[0], ids[2]]);
}

// ── Events ───────────────────────────────────────────────────────

#[tokio::test]
async fn watch_reports_applied_mutations() {
    let cache = LocalCache::new("users");
    let mut events = cache.watch();
    let id = EntityId::new();

    cache.upsert(row(id, "A")).await.unwrap();
    cache.remove(id).await.unwrap();
    // No event for a no-op remove.
    cache.remove(id).await.unwrap();
    cache.clear().await.unwrap();

    match events.recv().await.unwrap() {
        CacheEvent::Upserted(e) => assert_eq!(e.id, id),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(events.recv().await.unwrap(), CacheEvent::Removed(id));
    assert_eq!(events.recv().await.unwrap(), CacheEvent::Cleared);
}

#[tokio::test]
async fn clones_share_state() {
    let cache = LocalCache::new("users");
    let other = cache.clone();
    let id = EntityId::new();

    other.upsert(row(id, "A")).await.unwrap();
    assert!(cache.contains(id));
    assert_eq!(cache.name(), "users");
}

#[tokio::test]
async fn concurrent_writers_never_lose_updates() {
    let cache = LocalCache::new("users");
    let ids: Vec<_> = (0..50).map(|_| EntityId::new()).collect();

    let handles: Vec<_> = ids
        .iter()
        .map(|id| {
            let cache = cache.clone();
            let id = *id;
            tokio::spawn(async move { cache.upsert(row(id, "x")).await })
        })
        .collect();
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(cache.len(), 50);
    let mut rows: Vec<_> = cache.snapshot().into_iter().map(|e| e.row).collect();
    rows.dedup();
    assert_eq!(rows.len(), 50);
}
