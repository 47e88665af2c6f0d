//! Per-component execution locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Components declaring the same lock name are mutually exclusive on a
/// worker; this is what makes ARG/ENV serialize, as do ADD/COPY.
pub struct LockMap {
    locks: Mutex<HashMap<&'static str, Arc<Mutex<()>>>>,
}

impl LockMap {
    pub fn new() -> LockMap {
        LockMap {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire(&self, name: &'static str) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(name).or_default())
    }
}

impl Default for LockMap {
    fn default() -> Self {
        LockMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_name_returns_same_lock() {
        let locks = LockMap::new();
        let a = locks.acquire("arg");
        let b = locks.acquire("arg");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_distinct_names_are_independent() {
        let locks = LockMap::new();
        let a = locks.acquire("arg");
        let b = locks.acquire("copy");
        assert!(!Arc::ptr_eq(&a, &b));

        let _held = a.lock().unwrap();
        // The copy lock is still acquirable while arg is held.
        assert!(b.try_lock().is_ok());
    }
}
