//! Insertion-ordered map.
//!
//! YQL documents are mappings whose key order is meaningful: the order of a
//! SELECT list determines output column order, CTEs are resolved in document
//! order, and INSERT column lists follow the order keys first appear in. This
//! module provides the map type the IR uses for all of these.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};

/// A hash map that remembers insertion order.
///
/// Entries live in a vector in the order they were inserted; a side table maps
/// each key to its position. Re-inserting an existing key replaces the value
/// but keeps the original position.
#[derive(Clone)]
pub struct OrderMap<K, V> {
    /// The entries, in insertion order.
    entries: Vec<(K, V)>,
    /// Position of each key in `entries`.
    index: HashMap<K, usize>,
}

impl<K, V> Default for OrderMap<K, V> {
    fn default() -> OrderMap<K, V> {
        OrderMap {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<K, V> PartialEq for OrderMap<K, V>
where
    K: PartialEq,
    V: PartialEq,
{
    fn eq(&self, other: &OrderMap<K, V>) -> bool {
        self.entries == other.entries
    }
}

impl<K, V> Eq for OrderMap<K, V>
where
    K: Eq,
    V: Eq,
{
}

impl<K, V> fmt::Debug for OrderMap<K, V>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

impl<K, V> OrderMap<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates a new `OrderMap`.
    pub fn new() -> OrderMap<K, V> {
        OrderMap::default()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks if the map contains a key.
    pub fn contains<Q>(&self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.index.contains_key(k)
    }

    /// Gets a value from the map by key.
    pub fn get<Q>(&self, k: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.index.get(k).map(|&i| &self.entries[i].1)
    }

    /// Gets the insertion position of a key along with its value.
    pub fn get_indexed<Q>(&self, k: &Q) -> Option<(usize, &V)>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.index.get(k).map(|&i| (i, &self.entries[i].1))
    }

    /// Inserts an entry into the map.
    ///
    /// Returns the previous value if the key was already present, in which
    /// case the entry keeps its original position.
    pub fn insert(&mut self, k: K, value: V) -> Option<V> {
        match self.index.get(&k) {
            Some(&i) => Some(std::mem::replace(&mut self.entries[i].1, value)),
            None => {
                self.index.insert(k.clone(), self.entries.len());
                self.entries.push((k, value));
                None
            }
        }
    }

    /// Returns an iterator over the entries, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Returns an iterator over the keys, in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|(k, _)| k)
    }

    /// Returns an iterator over the values, in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }
}

impl<K, V> FromIterator<(K, V)> for OrderMap<K, V>
where
    K: Eq + Hash + Clone,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> OrderMap<K, V> {
        let mut map = OrderMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// Serde visitor that keeps mapping entries in document order.
struct OrderMapVisitor<K, V>(PhantomData<(K, V)>);

impl<'de, K, V> Visitor<'de> for OrderMapVisitor<K, V>
where
    K: Deserialize<'de> + Eq + Hash + Clone,
    V: Deserialize<'de>,
{
    type Value = OrderMap<K, V>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a mapping")
    }

    fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut map = OrderMap::new();
        while let Some((k, v)) = access.next_entry()? {
            map.insert(k, v);
        }
        Ok(map)
    }
}

impl<'de, K, V> Deserialize<'de> for OrderMap<K, V>
where
    K: Deserialize<'de> + Eq + Hash + Clone,
    V: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(OrderMapVisitor(PhantomData))
    }
}
