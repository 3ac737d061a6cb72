//! Dense interning tables used inside one diff.
//!
//! A [`PackedCollection`] maps values to indices in insertion order. Records
//! in a [`WorldDiff`](crate::diff::WorldDiff) refer to entities and component
//! types through these indices instead of repeating 16-byte ids and 8-byte
//! hashes.

use std::collections::HashMap;
use std::hash::Hash;

/// Insertion-ordered table with get-or-insert lookup.
#[derive(Debug, Clone)]
pub struct PackedCollection<T> {
    values: Vec<T>,
    lookup: HashMap<T, usize>,
}

impl<T: Copy + Eq + Hash> PackedCollection<T> {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            lookup: HashMap::new(),
        }
    }

    /// Append unconditionally. Returns the new index.
    ///
    /// If an equal value is already present both entries stay; lookups keep
    /// resolving to the first.
    pub fn push(&mut self, value: T) -> usize {
        let index = self.values.len();
        self.values.push(value);
        self.lookup.entry(value).or_insert(index);
        index
    }

    /// Index of `value`, appending it if absent.
    pub fn get_or_insert(&mut self, value: T) -> usize {
        if let Some(&index) = self.lookup.get(&value) {
            return index;
        }
        let index = self.values.len();
        self.values.push(value);
        self.lookup.insert(value, index);
        index
    }

    pub fn index_of(&self, value: &T) -> Option<usize> {
        self.lookup.get(value).copied()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.values
    }

    pub fn into_vec(self) -> Vec<T> {
        self.values
    }
}

impl<T: Copy + Eq + Hash> Default for PackedCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}
