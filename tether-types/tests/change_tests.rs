use serde_json::json;
use tether_types::{ChangeKind, ChangeKinds, EntityId, Record, RemoteChange};

#[test]
fn change_accessors() {
    let id = EntityId::new();
    let mut row = Record::new().with("name", "A");
    row.set_id(id);

    let change = RemoteChange::Removed(row.clone());
    assert_eq!(change.kind(), ChangeKind::Removed);
    assert_eq!(change.record(), &row);
    assert_eq!(change.id(), Some(id));
    assert_eq!(change.into_record(), row);
}

#[test]
fn change_serializes_with_kind_tag() {
    let change = RemoteChange::Added(Record::new().with("a", 1));
    assert_eq!(
        serde_json::to_value(&change).unwrap(),
        json!({"kind": "added", "record": {"a": 1}})
    );
}

#[test]
fn change_kinds_set_operations() {
    let mut kinds = ChangeKinds::NONE;
    assert!(kinds.is_empty());
    kinds.insert(ChangeKind::Removed);
    assert!(kinds.contains(ChangeKind::Removed));
    assert!(!kinds.contains(ChangeKind::Added));

    let both = ChangeKinds::ADDED | ChangeKinds::MODIFIED;
    assert_eq!(
        both.iter().collect::<Vec<_>>(),
        vec![ChangeKind::Added, ChangeKind::Modified]
    );
    assert_eq!(ChangeKinds::ALL.iter().count(), 3);
    assert_eq!(
        [ChangeKind::Added].into_iter().collect::<ChangeKinds>(),
        ChangeKinds::from(ChangeKind::Added)
    );
}
