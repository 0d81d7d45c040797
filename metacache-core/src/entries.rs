//! Ordered, keyed storage for cached objects.
//!
//! Objects are kept in the order the backing query produced them and
//! indexed by their normalized name. Keys follow [`KeyRules`]: some engines
//! fold identifiers, others do not.

use crate::mapper::CacheObject;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Comparator overriding the default (query order) iteration.
pub type ObjectOrder<V> = Arc<dyn Fn(&V, &V) -> Ordering + Send + Sync>;

/// Orders objects by name, case-insensitively first so that `users` and
/// `Users` sit next to each other.
pub fn by_name<V: CacheObject>() -> ObjectOrder<V> {
    Arc::new(|a: &V, b: &V| {
        a.name()
            .to_lowercase()
            .cmp(&b.name().to_lowercase())
            .then_with(|| a.name().cmp(b.name()))
    })
}

/// Key normalization rules for object names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRules {
    case_sensitive: bool,
}

impl Default for KeyRules {
    fn default() -> Self {
        Self::new(true)
    }
}

impl KeyRules {
    /// Creates key rules.
    pub fn new(case_sensitive: bool) -> Self {
        Self { case_sensitive }
    }

    /// Whether names are compared case-sensitively.
    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Normalized key for a name.
    pub fn key(&self, name: &str) -> String {
        if self.case_sensitive {
            name.to_string()
        } else {
            name.to_lowercase()
        }
    }

    /// Whether two names denote the same key.
    pub fn same(&self, a: &str, b: &str) -> bool {
        if self.case_sensitive {
            a == b
        } else {
            a.to_lowercase() == b.to_lowercase()
        }
    }
}

/// Objects of one owner, in iteration order, indexed by key.
pub struct ObjectEntries<V> {
    rules: KeyRules,
    items: Vec<Arc<V>>,
    index: HashMap<String, usize>,
}

impl<V> Clone for ObjectEntries<V> {
    fn clone(&self) -> Self {
        Self {
            rules: self.rules,
            items: self.items.clone(),
            index: self.index.clone(),
        }
    }
}

impl<V> std::fmt::Debug for ObjectEntries<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectEntries")
            .field("rules", &self.rules)
            .field("len", &self.items.len())
            .finish_non_exhaustive()
    }
}

impl<V: CacheObject> ObjectEntries<V> {
    /// Creates an empty set of entries.
    pub fn new(rules: KeyRules) -> Self {
        Self {
            rules,
            items: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Creates entries from objects in iteration order. A later object with
    /// an already seen key replaces the earlier one in place.
    pub fn from_objects<I>(rules: KeyRules, objects: I) -> Self
    where
        I: IntoIterator<Item = Arc<V>>,
    {
        let mut entries = Self::new(rules);
        for object in objects {
            entries.insert(object);
        }
        entries
    }

    /// Key rules in effect.
    pub fn rules(&self) -> KeyRules {
        self.rules
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no objects are cached.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Looks up an object by name.
    pub fn get(&self, name: &str) -> Option<&Arc<V>> {
        self.index
            .get(&self.rules.key(name))
            .and_then(|&i| self.items.get(i))
    }

    /// Whether an object with this name is cached.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&self.rules.key(name))
    }

    /// Objects in iteration order.
    pub fn values(&self) -> &[Arc<V>] {
        &self.items
    }

    /// Objects in iteration order, as an owned list.
    pub fn to_vec(&self) -> Vec<Arc<V>> {
        self.items.clone()
    }

    /// Inserts an object, replacing (in place) any object with the same key.
    /// Returns the replaced object.
    pub fn insert(&mut self, object: Arc<V>) -> Option<Arc<V>> {
        let key = self.rules.key(object.name());
        match self.index.get(&key) {
            Some(&i) => self
                .items
                .get_mut(i)
                .map(|slot| std::mem::replace(slot, object)),
            None => {
                self.index.insert(key, self.items.len());
                self.items.push(object);
                None
            }
        }
    }

    /// Removes an object by name.
    pub fn remove(&mut self, name: &str) -> Option<Arc<V>> {
        let i = self.index.remove(&self.rules.key(name))?;
        let removed = self.items.remove(i);
        self.reindex();
        Some(removed)
    }

    /// Keeps only objects matching the predicate.
    pub fn retain(&mut self, mut keep: impl FnMut(&Arc<V>) -> bool) {
        self.items.retain(|object| keep(object));
        self.reindex();
    }

    /// Removes all objects.
    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }

    /// Re-sorts objects with a comparator. The sort is stable, so objects
    /// the comparator considers equal keep query order.
    pub fn sort_by(&mut self, order: &ObjectOrder<V>) {
        self.items.sort_by(|a, b| order(a, b));
        self.reindex();
    }

    /// Replaces all entries with `objects`. With `preserve_identity`, an
    /// object whose key was already cached keeps its existing `Arc`.
    pub fn replace_all(&mut self, objects: Vec<Arc<V>>, preserve_identity: bool) {
        let rules = self.rules;
        let previous = std::mem::replace(self, Self::new(rules));
        for object in objects {
            let kept = if preserve_identity {
                previous.get(object.name()).cloned()
            } else {
                None
            };
            self.insert(kept.unwrap_or(object));
        }
    }

    fn reindex(&mut self) {
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(i, object)| (self.rules.key(object.name()), i))
            .collect();
    }
}
