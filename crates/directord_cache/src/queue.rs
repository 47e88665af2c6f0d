//! Disk-backed FIFO queue over the cache store.
//!
//! Queued items survive restarts; a length counter stands in for the
//! usual queue semaphore so callers can poll cheaply without scanning
//! the directory.

use crate::{Cache, Result, SetOptions};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub struct DurableQueue {
    cache: Cache,
    sequence: AtomicU64,
    pending: AtomicUsize,
}

impl DurableQueue {
    pub fn open(path: impl Into<PathBuf>) -> Result<DurableQueue> {
        let cache = Cache::open(path)?;
        let keys = cache.keys();
        let next = keys
            .iter()
            .filter_map(|key| key.parse::<u64>().ok())
            .max()
            .map(|max| max + 1)
            .unwrap_or(0);
        Ok(DurableQueue {
            pending: AtomicUsize::new(keys.len()),
            sequence: AtomicU64::new(next),
            cache,
        })
    }

    pub fn put(&self, value: Value) -> Result<()> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.cache
            .set(&format!("{seq:020}"), value, SetOptions::default())?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Remove and return the oldest queued item, if any.
    pub fn get(&self) -> Option<Value> {
        let (_, value) = self.cache.popitem()?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DurableQueue::open(dir.path().join("queue")).unwrap();
        queue.put(json!({"n": 1})).unwrap();
        queue.put(json!({"n": 2})).unwrap();
        queue.put(json!({"n": 3})).unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.get(), Some(json!({"n": 1})));
        assert_eq!(queue.get(), Some(json!({"n": 2})));
        assert_eq!(queue.get(), Some(json!({"n": 3})));
        assert_eq!(queue.get(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");
        {
            let queue = DurableQueue::open(&path).unwrap();
            queue.put(json!("held")).unwrap();
        }
        let queue = DurableQueue::open(&path).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get(), Some(json!("held")));
    }
}
