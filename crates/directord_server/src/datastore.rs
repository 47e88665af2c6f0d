//! Document store abstraction.
//!
//! The coordinator's worker and job registries live behind this trait so
//! the embedded in-memory implementation and an external key-value store
//! stay interchangeable; callers never assume locality.

use std::collections::HashMap;
use std::sync::Mutex;

pub trait DocumentStore<T: Clone>: Send + Sync {
    fn get(&self, key: &str) -> Option<T>;
    fn set(&self, key: &str, value: T);
    fn remove(&self, key: &str) -> Option<T>;
    fn items(&self) -> Vec<(String, T)>;
    fn clear(&self) -> usize;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries the predicate rejects; returns how many were removed.
    fn prune(&self, keep: &dyn Fn(&T) -> bool) -> usize {
        let mut removed = 0;
        for (key, value) in self.items() {
            if !keep(&value) {
                self.remove(&key);
                removed += 1;
            }
        }
        removed
    }
}

/// Process-lifetime in-memory store.
pub struct MemStore<T> {
    inner: Mutex<HashMap<String, T>>,
}

impl<T> MemStore<T> {
    pub fn new() -> Self {
        MemStore {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, T>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> Default for MemStore<T> {
    fn default() -> Self {
        MemStore::new()
    }
}

impl<T: Clone + Send> DocumentStore<T> for MemStore<T> {
    fn get(&self, key: &str) -> Option<T> {
        self.guard().get(key).cloned()
    }

    fn set(&self, key: &str, value: T) {
        self.guard().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) -> Option<T> {
        self.guard().remove(key)
    }

    fn items(&self) -> Vec<(String, T)> {
        self.guard()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn clear(&self) -> usize {
        let mut inner = self.guard();
        let count = inner.len();
        inner.clear();
        count
    }

    fn len(&self) -> usize {
        self.guard().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let store: MemStore<u64> = MemStore::new();
        store.set("a", 1);
        assert_eq!(store.get("a"), Some(1));
        assert_eq!(store.remove("a"), Some(1));
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn test_prune_with_predicate() {
        let store: MemStore<u64> = MemStore::new();
        store.set("keep", 10);
        store.set("drop-1", 1);
        store.set("drop-2", 2);

        let removed = store.prune(&|value| *value >= 10);
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("keep"), Some(10));
    }

    #[test]
    fn test_clear_counts() {
        let store: MemStore<u64> = MemStore::new();
        store.set("a", 1);
        store.set("b", 2);
        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
    }
}
