//! Insertion-ordered set used for the list fields of a record.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A duplicate-free collection that remembers insertion order.
///
/// Order is kept for display only: two sets are equal when they hold the
/// same members, whatever the order.
#[derive(Debug, Clone)]
pub struct OrderedSet<T> {
    items: Vec<T>,
}

impl<T: PartialEq> OrderedSet<T> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Build a set from a list, failing on the first duplicated item.
    pub fn try_from_vec(items: Vec<T>) -> Result<Self, T> {
        let mut set = Self::new();
        for item in items {
            if set.contains(&item) {
                return Err(item);
            }
            set.items.push(item);
        }
        Ok(set)
    }

    /// Insert an item at the end. Returns false if it was already present.
    pub fn insert(&mut self, item: T) -> bool {
        if self.contains(&item) {
            return false;
        }
        self.items.push(item);
        true
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.iter().any(|existing| existing == item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }
}

impl<T: PartialEq + Clone> OrderedSet<T> {
    /// Members of `self` in order, followed by members of `other` that are
    /// not already present.
    pub fn union(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        for item in other.iter() {
            merged.insert(item.clone());
        }
        merged
    }
}

impl<T: PartialEq> Default for OrderedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PartialEq> PartialEq for OrderedSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|item| other.contains(item))
    }
}

impl<T: Eq> Eq for OrderedSet<T> {}

impl<T: PartialEq> FromIterator<T> for OrderedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        for item in iter {
            set.insert(item);
        }
        set
    }
}

impl<'a, T> IntoIterator for &'a OrderedSet<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T: Serialize> Serialize for OrderedSet<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.items.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de> + PartialEq> Deserialize<'de> for OrderedSet<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = Vec::<T>::deserialize(deserializer)?;
        Self::try_from_vec(items).map_err(|_| serde::de::Error::custom("duplicate entry in set"))
    }
}
