use crate::firestore::model::{DocumentKey, DocumentKeySet};
use crate::firestore::util::SortedSet;

/// Two-way index between document keys and the ids (target or batch ids)
/// holding a reference to them.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    refs_by_key: SortedSet<(DocumentKey, i32)>,
    refs_by_id: SortedSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.refs_by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.refs_by_key = self.refs_by_key.insert((key.clone(), id));
        self.refs_by_id = self.refs_by_id.insert((id, key));
    }

    pub fn add_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: i32) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.refs_by_key = self.refs_by_key.remove(&(key.clone(), id));
        self.refs_by_id = self.refs_by_id.remove(&(id, key.clone()));
    }

    /// Drops every reference held by `id` and returns the keys it referenced.
    pub fn remove_references_for_id(&mut self, id: i32) -> Vec<DocumentKey> {
        let keys: Vec<DocumentKey> = self.references_for_id(id).iter().cloned().collect();
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn remove_all_references(&mut self) {
        self.refs_by_key = SortedSet::new();
        self.refs_by_id = SortedSet::new();
    }

    pub fn references_for_id(&self, id: i32) -> DocumentKeySet {
        self.refs_by_id
            .iter_from(&(id, DocumentKey::empty()))
            .take_while(|(ref_id, _)| *ref_id == id)
            .fold(DocumentKeySet::new(), |keys, (_, key)| keys.insert(key.clone()))
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.refs_by_key
            .iter_from(&(key.clone(), i32::MIN))
            .next()
            .is_some_and(|(ref_key, _)| ref_key == key)
    }

    pub fn ids_for_key(&self, key: &DocumentKey) -> Vec<i32> {
        self.refs_by_key
            .iter_from(&(key.clone(), i32::MIN))
            .take_while(|(ref_key, _)| ref_key == key)
            .map(|(_, id)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_in_both_directions() {
        let mut refs = ReferenceSet::new();
        refs.add_reference(key("c/a"), 2);
        refs.add_reference(key("c/b"), 2);
        refs.add_reference(key("c/a"), 4);

        assert!(refs.contains_key(&key("c/a")));
        assert!(!refs.contains_key(&key("c/c")));
        assert_eq!(refs.references_for_id(2).len(), 2);
        assert_eq!(refs.ids_for_key(&key("c/a")), vec![2, 4]);

        refs.remove_reference(&key("c/a"), 2);
        assert_eq!(refs.ids_for_key(&key("c/a")), vec![4]);
    }

    #[test]
    fn removing_an_id_releases_its_keys() {
        let mut refs = ReferenceSet::new();
        refs.add_references([key("c/a"), key("c/b")].iter(), 6);
        refs.add_reference(key("c/b"), 8);

        let released = refs.remove_references_for_id(6);
        assert_eq!(released, vec![key("c/a"), key("c/b")]);
        assert!(!refs.contains_key(&key("c/a")));
        assert!(refs.contains_key(&key("c/b")));

        refs.remove_all_references();
        assert!(refs.is_empty());
    }
}
