//! Data structures for passing keys into a loader's `perform`.

use std::{collections::HashSet, hash::Hash};

/// The set of keys handed to a single [`perform`][crate::Loader::perform]
/// call. Use the `keys` method to get the keys, all of which will be unique,
/// so that you can execute your request; then settle each of them through
/// the [`Batch`][crate::Batch].
#[derive(Debug, Clone)]
pub struct KeySet<Key: Eq + Hash> {
    // Keys are kept in the order they were first loaded. The cache in front
    // of the queue already guarantees uniqueness, so `index` only exists to
    // make `contains` cheap.
    keys: Vec<Key>,
    index: HashSet<Key>,
}

impl<Key: Eq + Hash + Clone> KeySet<Key> {
    pub(crate) fn from_unique(keys: Vec<Key>) -> Self {
        let index: HashSet<Key> = keys.iter().cloned().collect();
        debug_assert_eq!(index.len(), keys.len(), "KeySet built from duplicate keys");

        Self { keys, index }
    }
}

impl<Key: Eq + Hash> KeySet<Key> {
    /// Check if there are any keys in this keyset
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Get the number of unique keys in this keyset.
    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn contains(&self, key: &Key) -> bool {
        self.index.contains(key)
    }

    /// Get an iterator over all the keys in this keyset. These are guaranteed
    /// to be:
    ///
    /// - Unique
    /// - Between 1 and the loader's `max_batch_size`, if it has one
    /// - In the order they were first loaded
    pub fn keys(&self) -> impl Iterator<Item = &Key> + Clone {
        self.keys.iter()
    }
}

impl<'a, Key: Eq + Hash> IntoIterator for &'a KeySet<Key> {
    type Item = &'a Key;
    type IntoIter = std::slice::Iter<'a, Key>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys.iter()
    }
}

/// A fetched record that knows which key it answers. Used with
/// [`Batch::fulfill_from_iter`][crate::Batch::fulfill_from_iter] to match
/// rows coming back from a store to the keys that requested them.
pub trait KeyedEntry<Key: ?Sized> {
    fn get_key(&self) -> &Key;
}

/// What to do when a fetched result contains more than one entry for the
/// same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDuplicate {
    /// Keep the first entry and skip the rest.
    Ignore,

    /// Treat the duplicate as an error.
    Error,
}
