use firestore_sync::firestore::core::Query;
use firestore_sync::firestore::model::{DocumentKey, FieldPath, ResourcePath};

fn resource_path(path: &str) -> ResourcePath {
    ResourcePath::from_string(path).unwrap()
}

#[test]
fn indexes_into_segments() {
    let path = ResourcePath::from_segments(["rooms", "Eros", "messages"]);
    assert_eq!(path.segment(0), Some("rooms"));
    assert_eq!(path.segment(2), Some("messages"));
    assert_eq!(path.segment(3), None);
    assert_eq!(path.len(), 3);
}

#[test]
fn pops_from_both_ends() {
    let path = ResourcePath::from_segments(["rooms", "Eros", "messages"]);
    assert_eq!(path.pop_first_n(1), resource_path("Eros/messages"));
    assert!(path.pop_first_n(3).is_empty());
    assert_eq!(path.without_last(), resource_path("rooms/Eros"));
    assert_eq!(path.without_last().last_segment(), Some("Eros"));
    assert!(path.without_last().without_last().without_last().is_empty());
    assert_eq!(path, resource_path("rooms/Eros/messages"));
}

#[test]
fn rejects_empty_segments() {
    assert!(ResourcePath::from_string("rooms//1").is_err());
    assert!(resource_path("").is_empty());
}

#[test]
fn orders_segment_by_segment() {
    assert!(resource_path("a") < resource_path("b"));
    assert!(resource_path("a") < resource_path("a/b"));
    assert!(resource_path("a/b/c") > resource_path("a/b"));
    assert_eq!(resource_path("a/b"), resource_path("a/b"));
}

#[test]
fn determines_prefixes_and_parents() {
    let root = ResourcePath::root();
    let a = resource_path("a");
    let ab = resource_path("a/b");
    let ba = resource_path("b/a");

    assert!(root.is_prefix_of(&ab));
    assert!(a.is_prefix_of(&a));
    assert!(a.is_prefix_of(&ab));
    assert!(!ab.is_prefix_of(&a));
    assert!(!a.is_prefix_of(&ba));

    assert!(a.is_immediate_parent_of(&ab));
    assert!(!root.is_immediate_parent_of(&ab));
}

#[test]
fn document_keys_need_an_even_path() {
    let key = DocumentKey::from_string("rooms/eros/messages/1").unwrap();
    assert_eq!(key.id(), "1");
    assert_eq!(key.collection_path(), resource_path("rooms/eros/messages"));
    assert_eq!(key.collection_group(), "messages");
    assert!(DocumentKey::from_string("rooms/eros/messages").is_err());
}

#[test]
fn field_paths_split_on_dots() {
    let path = FieldPath::from_dot_separated("address.city").unwrap();
    assert_eq!(path.len(), 2);
    assert_eq!(path.last_segment(), "city");
    assert!(FieldPath::from_dot_separated("address").unwrap().is_prefix_of(&path));
    assert!(FieldPath::from_dot_separated("address..city").is_err());
}

#[test]
fn collection_queries_match_only_direct_children() {
    let query = Query::at_path("rooms").unwrap();
    assert!(query.path().is_immediate_parent_of(&resource_path("rooms/1")));
    assert!(!query.path().is_immediate_parent_of(&resource_path("rooms/1/messages/2")));
}
