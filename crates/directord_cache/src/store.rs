//! The cache store proper.

use crate::{merge_value, Result};
use byteorder::{BigEndian, ByteOrder};
use directord_protocol::{current_time, object_sha3_224};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

const XATTR_KEY: &str = "user.key";
const XATTR_BIRTHTIME: &str = "user.birthtime";

/// Options for [`Cache::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub tag: Option<String>,
    /// Soft expiry in seconds from now.
    pub expire: Option<f64>,
    /// Merge a map value into the existing one instead of replacing it.
    pub value_update: bool,
    /// Concatenate list values on merge.
    pub extend: bool,
}

impl SetOptions {
    pub fn tagged(tag: &str) -> Self {
        SetOptions {
            tag: Some(tag.to_string()),
            ..SetOptions::default()
        }
    }

    pub fn with_expire(mut self, seconds: f64) -> Self {
        self.expire = Some(seconds);
        self
    }

    pub fn updating(mut self, extend: bool) -> Self {
        self.value_update = true;
        self.extend = extend;
        self
    }
}

/// On-disk entry envelope. Key and birthtime are duplicated in xattrs
/// when available; the envelope keeps them too so a store written with
/// xattr support stays readable without it.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Envelope {
    key: String,
    value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expire_at: Option<f64>,
    birthtime: f64,
}

/// Directory-backed persistent map.
pub struct Cache {
    path: PathBuf,
    xattr_ok: bool,
    lock: Mutex<()>,
}

impl Cache {
    /// Open (creating if needed) a cache directory, probing it for
    /// extended-attribute support.
    pub fn open(path: impl Into<PathBuf>) -> Result<Cache> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        let xattr_ok = probe_xattr(&path);
        if !xattr_ok {
            debug!(
                "Extended attributes unavailable at [ {} ], falling back to filename keys.",
                path.display()
            );
        }
        Ok(Cache {
            path,
            xattr_ok,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let _guard = self.guard();
        let path = self.entry_path(key);
        let envelope = read_envelope(&path)?;
        if is_expired(&envelope) {
            let _ = fs::remove_file(&path);
            return None;
        }
        Some(envelope.value)
    }

    /// The value under `key` as an object map; empty when missing or not
    /// a map.
    pub fn get_map(&self, key: &str) -> Map<String, Value> {
        match self.get(key) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn set(&self, key: &str, value: Value, options: SetOptions) -> Result<()> {
        let _guard = self.guard();
        let path = self.entry_path(key);

        let value = if options.value_update {
            let mut base = read_envelope(&path)
                .filter(|envelope| !is_expired(envelope))
                .map(|envelope| envelope.value)
                .unwrap_or_else(|| Value::Object(Map::new()));
            merge_value(&mut base, &value, options.extend);
            base
        } else {
            value
        };

        let birthtime = read_envelope(&path)
            .map(|existing| existing.birthtime)
            .unwrap_or_else(current_time);

        let envelope = Envelope {
            key: key.to_string(),
            value,
            tag: options.tag,
            expire_at: options.expire.map(|seconds| current_time() + seconds),
            birthtime,
        };
        fs::write(&path, serde_json::to_vec(&envelope)?)?;

        if self.xattr_ok {
            let mut packed = [0u8; 8];
            BigEndian::write_f64(&mut packed, envelope.birthtime);
            let _ = xattr::set(&path, XATTR_BIRTHTIME, &packed);
            let _ = xattr::set(&path, XATTR_KEY, key.as_bytes());
        }
        Ok(())
    }

    pub fn pop(&self, key: &str) -> Option<Value> {
        let _guard = self.guard();
        let path = self.entry_path(key);
        let envelope = read_envelope(&path)?;
        let _ = fs::remove_file(&path);
        if is_expired(&envelope) {
            None
        } else {
            Some(envelope.value)
        }
    }

    /// Remove everything; returns the number of entries evicted.
    pub fn clear(&self) -> Result<usize> {
        let _guard = self.guard();
        let mut count = 0;
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.path().is_file() {
                fs::remove_file(entry.path())?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Remove every entry carrying `tag`; returns the eviction count.
    pub fn evict(&self, tag: &str) -> Result<usize> {
        let _guard = self.guard();
        let mut count = 0;
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(envelope) = read_envelope(&path) {
                if envelope.tag.as_deref() == Some(tag) {
                    fs::remove_file(&path)?;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// All live keys, oldest first by birth time.
    pub fn keys(&self) -> Vec<String> {
        self.scan()
            .into_iter()
            .map(|(envelope, _)| envelope.key)
            .collect()
    }

    pub fn items(&self) -> Vec<(String, Value)> {
        self.scan()
            .into_iter()
            .map(|(envelope, _)| (envelope.key, envelope.value))
            .collect()
    }

    /// Remove and return the oldest entry.
    pub fn popitem(&self) -> Option<(String, Value)> {
        let oldest = {
            let _guard = self.guard();
            self.scan().into_iter().next()
        }?;
        let (envelope, path) = oldest;
        let _guard = self.guard();
        let _ = fs::remove_file(path);
        Some((envelope.key, envelope.value))
    }

    pub fn len(&self) -> usize {
        self.scan().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let name = if self.xattr_ok {
            object_sha3_224(&Value::String(key.to_string()))
        } else {
            key.to_string()
        };
        self.path.join(name)
    }

    fn scan(&self) -> Vec<(Envelope, PathBuf)> {
        let mut entries = Vec::new();
        let Ok(dir) = fs::read_dir(&self.path) else {
            return entries;
        };
        for entry in dir.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(envelope) = read_envelope(&path) {
                if !is_expired(&envelope) {
                    entries.push((envelope, path));
                }
            }
        }
        entries.sort_by(|a, b| {
            a.0.birthtime
                .partial_cmp(&b.0.birthtime)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.key.cmp(&b.0.key))
        });
        entries
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn read_envelope(path: &Path) -> Option<Envelope> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn is_expired(envelope: &Envelope) -> bool {
    envelope
        .expire_at
        .map(|deadline| current_time() > deadline)
        .unwrap_or(false)
}

/// Attribute support is probed once at open time by stamping the cache
/// directory itself.
fn probe_xattr(path: &Path) -> bool {
    let mut packed = [0u8; 8];
    BigEndian::write_f64(&mut packed, current_time());
    xattr::set(path, XATTR_BIRTHTIME, &packed).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path().join("cache")).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_set_get_pop() {
        let (_dir, cache) = cache();
        cache
            .set("args", json!({"a": 1}), SetOptions::tagged("args"))
            .unwrap();
        assert_eq!(cache.get("args"), Some(json!({"a": 1})));
        assert_eq!(cache.pop("args"), Some(json!({"a": 1})));
        assert_eq!(cache.get("args"), None);
    }

    #[test]
    fn test_value_update_merges() {
        let (_dir, cache) = cache();
        cache
            .set("args", json!({"a": 1, "list": [1]}), SetOptions::tagged("args"))
            .unwrap();
        cache
            .set(
                "args",
                json!({"b": 2, "list": [2]}),
                SetOptions::tagged("args").updating(true),
            )
            .unwrap();
        assert_eq!(
            cache.get("args"),
            Some(json!({"a": 1, "b": 2, "list": [1, 2]}))
        );
    }

    #[test]
    fn test_evict_by_tag() {
        let (_dir, cache) = cache();
        cache.set("a", json!(1), SetOptions::tagged("jobs")).unwrap();
        cache.set("b", json!(2), SetOptions::tagged("jobs")).unwrap();
        cache.set("c", json!(3), SetOptions::tagged("args")).unwrap();

        assert_eq!(cache.evict("jobs").unwrap(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("c"), Some(json!(3)));
    }

    #[test]
    fn test_clear_counts() {
        let (_dir, cache) = cache();
        cache.set("a", json!(1), SetOptions::default()).unwrap();
        cache.set("b", json!(2), SetOptions::default()).unwrap();
        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_entries_are_missing() {
        let (_dir, cache) = cache();
        cache
            .set("gone", json!(1), SetOptions::default().with_expire(-1.0))
            .unwrap();
        assert_eq!(cache.get("gone"), None);
        assert!(cache.keys().is_empty());
    }

    #[test]
    fn test_popitem_returns_oldest() {
        let (_dir, cache) = cache();
        cache.set("first", json!(1), SetOptions::default()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        cache.set("second", json!(2), SetOptions::default()).unwrap();

        let (key, value) = cache.popitem().unwrap();
        assert_eq!(key, "first");
        assert_eq!(value, json!(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_keys_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        {
            let cache = Cache::open(&path).unwrap();
            cache
                .set("persistent", json!("yes"), SetOptions::default())
                .unwrap();
        }
        let cache = Cache::open(&path).unwrap();
        assert_eq!(cache.get("persistent"), Some(json!("yes")));
        assert_eq!(cache.keys(), vec!["persistent".to_string()]);
    }
}
