use crate::firestore::value::FirestoreValue;

#[derive(Clone, Debug, PartialEq, Default)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values.iter().any(|candidate| candidate == needle)
    }

    /// Appends every element of `additions` not already present.
    pub fn union(&self, additions: &[FirestoreValue]) -> Self {
        let mut values = self.values.clone();
        for element in additions {
            if !values.iter().any(|candidate| candidate == element) {
                values.push(element.clone());
            }
        }
        Self::new(values)
    }

    /// Drops every occurrence of each element of `removals`.
    pub fn remove_all(&self, removals: &[FirestoreValue]) -> Self {
        let values = self
            .values
            .iter()
            .filter(|candidate| !removals.iter().any(|needle| needle == *candidate))
            .cloned()
            .collect();
        Self::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Vec<FirestoreValue> {
        values.iter().copied().map(FirestoreValue::from_integer).collect()
    }

    #[test]
    fn union_skips_existing_elements() {
        let array = ArrayValue::new(ints(&[1, 2]));
        let merged = array.union(&ints(&[2, 3]));
        assert_eq!(merged.values(), ints(&[1, 2, 3]).as_slice());
    }

    #[test]
    fn remove_all_drops_duplicates() {
        let array = ArrayValue::new(ints(&[1, 2, 1]));
        let trimmed = array.remove_all(&ints(&[1]));
        assert_eq!(trimmed.values(), ints(&[2]).as_slice());
    }
}
