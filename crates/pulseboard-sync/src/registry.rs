//! Per-widget identity map.
//!
//! Keys are create-once and remove-once: `add` never overwrites and `remove`
//! never touches an absent key. Both misuses are logged and reported as a
//! `false`/`None` result instead of an error so the dispatch path can no-op.

use crate::error::RegistryConflict;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug)]
pub struct KeyedRegistry<T> {
    label: String,
    entries: HashMap<String, T>,
}

impl<T> KeyedRegistry<T> {
    /// Create an empty registry. `label` only appears in log lines.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: HashMap::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Insert `item` under `key`. Returns false and keeps the existing entry
    /// when the key is already present.
    pub fn add(&mut self, key: impl Into<String>, item: T) -> bool {
        let key = key.into();
        if self.entries.contains_key(&key) {
            warn!(registry = %self.label, "{}", RegistryConflict::DuplicateKey(key));
            return false;
        }
        self.entries.insert(key, item);
        true
    }

    /// Remove and return the entry under `key`, or `None` if it was absent.
    pub fn remove(&mut self, key: &str) -> Option<T> {
        let removed = self.entries.remove(key);
        if removed.is_none() {
            warn!(
                registry = %self.label,
                "failed to remove item: {}",
                RegistryConflict::MissingKey(key.to_string())
            );
        }
        removed
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Remove every entry, yielding them in arbitrary order.
    pub fn drain(&mut self) -> impl Iterator<Item = (String, T)> + '_ {
        self.entries.drain()
    }
}
