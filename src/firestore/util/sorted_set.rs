use std::fmt;

use crate::firestore::util::sorted_map::{Comparator, Iter, SortedMap};

/// Immutable ordered set built on [`SortedMap`].
pub struct SortedSet<T> {
    map: SortedMap<T, ()>,
}

impl<T> Clone for SortedSet<T> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl<T: Ord> SortedSet<T> {
    pub fn new() -> Self {
        Self {
            map: SortedMap::new(),
        }
    }
}

impl<T: Ord> Default for SortedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SortedSet<T> {
    pub fn with_comparator(comparator: Comparator<T>) -> Self {
        Self {
            map: SortedMap::with_comparator(comparator),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.map.contains_key(item)
    }

    pub fn first(&self) -> Option<&T> {
        self.map.first_key()
    }

    pub fn last(&self) -> Option<&T> {
        self.map.last_key()
    }

    pub fn index_of(&self, item: &T) -> Option<usize> {
        self.map.index_of(item)
    }

    pub fn iter(&self) -> SetIter<'_, T> {
        SetIter {
            inner: self.map.iter(),
        }
    }

    pub fn iter_rev(&self) -> SetIter<'_, T> {
        SetIter {
            inner: self.map.iter_rev(),
        }
    }

    /// Iterates in order from the first element not less than `item`.
    pub fn iter_from(&self, item: &T) -> SetIter<'_, T> {
        SetIter {
            inner: self.map.iter_from(item),
        }
    }
}

impl<T: Clone> SortedSet<T> {
    pub fn insert(&self, item: T) -> Self {
        Self {
            map: self.map.insert(item, ()),
        }
    }

    pub fn remove(&self, item: &T) -> Self {
        Self {
            map: self.map.remove(item),
        }
    }

    /// Elements of both sets, ordered by the receiver's comparator.
    pub fn union(&self, other: &SortedSet<T>) -> Self {
        other
            .iter()
            .fold(self.clone(), |set, item| set.insert(item.clone()))
    }
}

impl<T: PartialEq> PartialEq for SortedSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(l, r)| l == r)
    }
}

impl<T: fmt::Debug> fmt::Debug for SortedSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<T: Ord + Clone> FromIterator<T> for SortedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        iter.into_iter()
            .fold(SortedSet::new(), |set, item| set.insert(item))
    }
}

impl<'a, T> IntoIterator for &'a SortedSet<T> {
    type Item = &'a T;
    type IntoIter = SetIter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct SetIter<'a, T> {
    inner: Iter<'a, T, ()>,
}

impl<'a, T> Iterator for SetIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(item, _)| item)
    }
}
