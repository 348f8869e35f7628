use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Shared ordering function used by [`SortedMap`] and [`SortedSet`](super::SortedSet).
pub type Comparator<K> = Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

type Link<K, V> = Option<Arc<Node<K, V>>>;

#[derive(Clone)]
struct Node<K, V> {
    key: K,
    value: V,
    red: bool,
    size: usize,
    left: Link<K, V>,
    right: Link<K, V>,
}

/// Immutable ordered map backed by a left-leaning red-black tree.
///
/// Every update returns a new map that shares all untouched nodes with the
/// receiver, so cloning is O(1) and older versions stay valid for readers.
pub struct SortedMap<K, V> {
    comparator: Comparator<K>,
    root: Link<K, V>,
}

impl<K, V> Clone for SortedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            comparator: Arc::clone(&self.comparator),
            root: self.root.clone(),
        }
    }
}

impl<K: Ord, V> SortedMap<K, V> {
    pub fn new() -> Self {
        Self {
            comparator: Arc::new(|left: &K, right: &K| left.cmp(right)),
            root: None,
        }
    }
}

impl<K: Ord, V> Default for SortedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SortedMap<K, V> {
    pub fn with_comparator(comparator: Comparator<K>) -> Self {
        Self {
            comparator,
            root: None,
        }
    }

    pub fn comparator(&self) -> &Comparator<K> {
        &self.comparator
    }

    pub fn len(&self) -> usize {
        link_size(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let mut node = self.root.as_deref();
        while let Some(current) = node {
            match (self.comparator)(key, &current.key) {
                Ordering::Less => node = current.left.as_deref(),
                Ordering::Greater => node = current.right.as_deref(),
                Ordering::Equal => return Some(&current.value),
            }
        }
        None
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Zero-based position of `key` in iteration order.
    pub fn index_of(&self, key: &K) -> Option<usize> {
        let mut pruned = 0;
        let mut node = self.root.as_deref();
        while let Some(current) = node {
            match (self.comparator)(key, &current.key) {
                Ordering::Less => node = current.left.as_deref(),
                Ordering::Equal => return Some(pruned + link_size(&current.left)),
                Ordering::Greater => {
                    pruned += link_size(&current.left) + 1;
                    node = current.right.as_deref();
                }
            }
        }
        None
    }

    pub fn first(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_deref()?;
        while let Some(left) = node.left.as_deref() {
            node = left;
        }
        Some((&node.key, &node.value))
    }

    pub fn last(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_deref()?;
        while let Some(right) = node.right.as_deref() {
            node = right;
        }
        Some((&node.key, &node.value))
    }

    pub fn first_key(&self) -> Option<&K> {
        self.first().map(|(key, _)| key)
    }

    pub fn last_key(&self) -> Option<&K> {
        self.last().map(|(key, _)| key)
    }

    /// In-order iteration over all entries.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let mut iter = Iter {
            stack: Vec::new(),
            reverse: false,
        };
        iter.push_spine(self.root.as_deref());
        iter
    }

    /// Reverse-order iteration over all entries.
    pub fn iter_rev(&self) -> Iter<'_, K, V> {
        let mut iter = Iter {
            stack: Vec::new(),
            reverse: true,
        };
        iter.push_spine(self.root.as_deref());
        iter
    }

    /// Iterates in order starting at the first key that is not less than `key`.
    pub fn iter_from(&self, key: &K) -> Iter<'_, K, V> {
        let mut stack = Vec::new();
        let mut node = self.root.as_deref();
        while let Some(current) = node {
            if (self.comparator)(&current.key, key) != Ordering::Less {
                stack.push(current);
                node = current.left.as_deref();
            } else {
                node = current.right.as_deref();
            }
        }
        Iter {
            stack,
            reverse: false,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }
}

impl<K: Clone, V: Clone> SortedMap<K, V> {
    /// Returns a copy of the map with `key` bound to `value`.
    pub fn insert(&self, key: K, value: V) -> Self {
        let mut root = insert_node(&self.root, key, value, self.comparator.as_ref());
        root.red = false;
        Self {
            comparator: Arc::clone(&self.comparator),
            root: Some(Arc::new(root)),
        }
    }

    /// Returns a copy of the map without `key`. Missing keys return an
    /// identical map.
    pub fn remove(&self, key: &K) -> Self {
        if !self.contains_key(key) {
            return self.clone();
        }
        let root = remove_node(&self.root, key, self.comparator.as_ref()).map(|node| {
            if node.red {
                let mut black = (*node).clone();
                black.red = false;
                Arc::new(black)
            } else {
                node
            }
        });
        Self {
            comparator: Arc::clone(&self.comparator),
            root,
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for SortedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: PartialEq, V: PartialEq> PartialEq for SortedMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(l, r)| l == r)
    }
}

impl<K: Ord + Clone, V: Clone> FromIterator<(K, V)> for SortedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(SortedMap::new(), |map, (key, value)| map.insert(key, value))
    }
}

impl<'a, K, V> IntoIterator for &'a SortedMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct Iter<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
    reverse: bool,
}

impl<'a, K, V> Iter<'a, K, V> {
    fn push_spine(&mut self, mut node: Option<&'a Node<K, V>>) {
        while let Some(current) = node {
            self.stack.push(current);
            node = if self.reverse {
                current.right.as_deref()
            } else {
                current.left.as_deref()
            };
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        let next = if self.reverse {
            node.left.as_deref()
        } else {
            node.right.as_deref()
        };
        self.push_spine(next);
        Some((&node.key, &node.value))
    }
}

fn link_size<K, V>(link: &Link<K, V>) -> usize {
    link.as_ref().map_or(0, |node| node.size)
}

fn is_red<K, V>(link: &Link<K, V>) -> bool {
    matches!(link, Some(node) if node.red)
}

fn left_is_red<K, V>(link: &Link<K, V>) -> bool {
    link.as_ref().map_or(false, |node| is_red(&node.left))
}

fn flip_link<K: Clone, V: Clone>(link: Link<K, V>) -> Link<K, V> {
    link.map(|node| {
        let mut copy = (*node).clone();
        copy.red = !copy.red;
        Arc::new(copy)
    })
}

impl<K: Clone, V: Clone> Node<K, V> {
    fn leaf(key: K, value: V) -> Self {
        Self {
            key,
            value,
            red: true,
            size: 1,
            left: None,
            right: None,
        }
    }

    fn resized(mut self) -> Self {
        self.size = 1 + link_size(&self.left) + link_size(&self.right);
        self
    }

    fn into_link(self) -> Link<K, V> {
        Some(Arc::new(self.resized()))
    }

    fn rotate_left(mut self) -> Self {
        let Some(right) = self.right.take() else {
            return self;
        };
        let mut pivot = (*right).clone();
        self.right = pivot.left.take();
        pivot.red = self.red;
        self.red = true;
        pivot.left = self.into_link();
        pivot.resized()
    }

    fn rotate_right(mut self) -> Self {
        let Some(left) = self.left.take() else {
            return self;
        };
        let mut pivot = (*left).clone();
        self.left = pivot.right.take();
        pivot.red = self.red;
        self.red = true;
        pivot.right = self.into_link();
        pivot.resized()
    }

    fn color_flip(mut self) -> Self {
        self.red = !self.red;
        self.left = flip_link(self.left.take());
        self.right = flip_link(self.right.take());
        self
    }

    fn fix_up(self) -> Self {
        let mut node = self;
        if is_red(&node.right) && !is_red(&node.left) {
            node = node.rotate_left();
        }
        if is_red(&node.left) && left_is_red(&node.left) {
            node = node.rotate_right();
        }
        if is_red(&node.left) && is_red(&node.right) {
            node = node.color_flip();
        }
        node.resized()
    }

    fn move_red_left(self) -> Self {
        let mut node = self.color_flip();
        if left_is_red(&node.right) {
            if let Some(right) = node.right.take() {
                node.right = (*right).clone().rotate_right().into_link();
            }
            node = node.rotate_left();
            node = node.color_flip();
        }
        node
    }

    fn move_red_right(self) -> Self {
        let mut node = self.color_flip();
        if left_is_red(&node.left) {
            node = node.rotate_right();
            node = node.color_flip();
        }
        node
    }
}

fn insert_node<K: Clone, V: Clone>(
    link: &Link<K, V>,
    key: K,
    value: V,
    comparator: &(dyn Fn(&K, &K) -> Ordering + Send + Sync),
) -> Node<K, V> {
    let Some(existing) = link else {
        return Node::leaf(key, value);
    };
    let mut node = (**existing).clone();
    match comparator(&key, &node.key) {
        Ordering::Less => {
            let left = insert_node(&node.left, key, value, comparator);
            node.left = left.into_link();
        }
        Ordering::Equal => {
            node.key = key;
            node.value = value;
        }
        Ordering::Greater => {
            let right = insert_node(&node.right, key, value, comparator);
            node.right = right.into_link();
        }
    }
    node.fix_up()
}

fn min_entry<K: Clone, V: Clone>(node: &Node<K, V>) -> (K, V) {
    let mut current = node;
    while let Some(left) = current.left.as_deref() {
        current = left;
    }
    (current.key.clone(), current.value.clone())
}

fn remove_min<K: Clone, V: Clone>(node: Node<K, V>) -> Link<K, V> {
    if node.left.is_none() {
        return None;
    }
    let mut node = node;
    if !is_red(&node.left) && !left_is_red(&node.left) {
        node = node.move_red_left();
    }
    if let Some(left) = node.left.take() {
        node.left = remove_min((*left).clone());
    }
    Some(Arc::new(node.fix_up()))
}

fn remove_node<K: Clone, V: Clone>(
    link: &Link<K, V>,
    key: &K,
    comparator: &(dyn Fn(&K, &K) -> Ordering + Send + Sync),
) -> Link<K, V> {
    let existing = link.as_ref()?;
    let mut node = (**existing).clone();
    if comparator(key, &node.key) == Ordering::Less {
        if node.left.is_some() && !is_red(&node.left) && !left_is_red(&node.left) {
            node = node.move_red_left();
        }
        node.left = remove_node(&node.left, key, comparator);
    } else {
        if is_red(&node.left) {
            node = node.rotate_right();
        }
        if node.right.is_some() && !is_red(&node.right) && !left_is_red(&node.right) {
            node = node.move_red_right();
        }
        if comparator(key, &node.key) == Ordering::Equal {
            let Some(right) = node.right.take() else {
                return None;
            };
            let (successor_key, successor_value) = min_entry(&right);
            node.key = successor_key;
            node.value = successor_value;
            node.right = remove_min((*right).clone());
        }
        node.right = remove_node(&node.right, key, comparator);
    }
    Some(Arc::new(node.fix_up()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn black_height<K, V>(link: &Link<K, V>) -> Option<usize> {
        match link {
            None => Some(1),
            Some(node) => {
                if node.red && (is_red(&node.left) || is_red(&node.right)) {
                    return None;
                }
                if is_red(&node.right) {
                    return None;
                }
                let left = black_height(&node.left)?;
                let right = black_height(&node.right)?;
                if left != right {
                    return None;
                }
                Some(left + usize::from(!node.red))
            }
        }
    }

    #[test]
    fn insert_get_and_iterate_in_order() {
        let map: SortedMap<i32, &str> = SortedMap::new()
            .insert(5, "five")
            .insert(1, "one")
            .insert(3, "three");
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&3), Some(&"three"));
        assert_eq!(map.get(&4), None);
        let keys: Vec<_> = map.keys().copied().collect();
        assert_eq!(keys, vec![1, 3, 5]);
        let reversed: Vec<_> = map.iter_rev().map(|(k, _)| *k).collect();
        assert_eq!(reversed, vec![5, 3, 1]);
    }

    #[test]
    fn updates_share_structure_and_leave_old_versions_intact() {
        let original: SortedMap<i32, i32> = (0..10).map(|i| (i, i)).collect();
        let updated = original.insert(4, 40).remove(&7);
        assert_eq!(original.get(&4), Some(&4));
        assert_eq!(original.get(&7), Some(&7));
        assert_eq!(updated.get(&4), Some(&40));
        assert_eq!(updated.get(&7), None);
        assert_eq!(updated.len(), 9);
    }

    #[test]
    fn stays_balanced_under_random_inserts_and_removes() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut keys: Vec<i32> = (0..500).collect();
        keys.shuffle(&mut rng);

        let mut map = SortedMap::new();
        for key in &keys {
            map = map.insert(*key, *key * 2);
            assert!(black_height(&map.root).is_some());
        }
        assert_eq!(map.len(), 500);

        keys.shuffle(&mut rng);
        for (removed, key) in keys.iter().take(300).enumerate() {
            map = map.remove(key);
            assert!(black_height(&map.root).is_some());
            assert_eq!(map.len(), 500 - removed - 1);
        }

        let remaining: Vec<i32> = map.keys().copied().collect();
        let mut expected: Vec<i32> = keys[300..].to_vec();
        expected.sort();
        assert_eq!(remaining, expected);
    }

    #[test]
    fn removing_missing_key_is_a_no_op() {
        let map: SortedMap<i32, ()> = SortedMap::new().insert(1, ());
        let same = map.remove(&2);
        assert_eq!(same.len(), 1);
    }

    #[test]
    fn iter_from_and_index_of() {
        let map: SortedMap<i32, ()> = [10, 20, 30, 40].into_iter().map(|k| (k, ())).collect();
        let tail: Vec<_> = map.iter_from(&25).map(|(k, _)| *k).collect();
        assert_eq!(tail, vec![30, 40]);
        let exact: Vec<_> = map.iter_from(&20).map(|(k, _)| *k).collect();
        assert_eq!(exact, vec![20, 30, 40]);
        assert_eq!(map.index_of(&30), Some(2));
        assert_eq!(map.index_of(&35), None);
        assert_eq!(map.first_key(), Some(&10));
        assert_eq!(map.last_key(), Some(&40));
    }

    #[test]
    fn custom_comparator_orders_entries() {
        let descending: Comparator<i32> = Arc::new(|l: &i32, r: &i32| r.cmp(l));
        let map = SortedMap::with_comparator(descending)
            .insert(1, 'a')
            .insert(3, 'c')
            .insert(2, 'b');
        let keys: Vec<_> = map.keys().copied().collect();
        assert_eq!(keys, vec![3, 2, 1]);
    }
}
