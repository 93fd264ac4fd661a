//! Op result cache.
//!
//! Keys are blake3 hex fingerprints of the op short name plus its
//! cache-affecting inputs. Entries expire by wall time; expired entries are
//! treated as absent and overwritten on the next store. Within one process,
//! at most one build runs per fingerprint at a time: concurrent duplicate
//! invocations wait on the first build and then re-probe (single-flight).
//! Storage is in-memory, with optional file persistence (one JSON file per
//! fingerprint) so results survive restarts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use flowllm_core::FlowResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-op cache knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    pub enabled: bool,
    pub expire: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy {
            enabled: false,
            expire: Duration::from_secs(360),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    value: Value,
    expires_at_unix: u64,
}

impl CacheEntry {
    fn is_live(&self) -> bool {
        now_unix() < self.expires_at_unix
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Process-wide op result cache.
pub struct OpCache {
    entries: DashMap<String, CacheEntry>,
    builds: DashMap<String, Arc<Mutex<()>>>,
    dir: Option<PathBuf>,
}

impl OpCache {
    /// Purely in-memory cache.
    pub fn in_memory() -> Self {
        OpCache {
            entries: DashMap::new(),
            builds: DashMap::new(),
            dir: None,
        }
    }

    /// Cache with file persistence under `dir` (created on first store).
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        OpCache {
            entries: DashMap::new(),
            builds: DashMap::new(),
            dir: Some(dir.into()),
        }
    }

    /// Fingerprint of an op invocation: blake3 over the short name and the
    /// cache-affecting inputs in key order.
    pub fn fingerprint(short_name: &str, inputs: &BTreeMap<String, Value>) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(short_name.as_bytes());
        for (key, value) in inputs {
            hasher.update(b"\x1f");
            hasher.update(key.as_bytes());
            hasher.update(b"\x1e");
            hasher.update(value.to_string().as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Live value for `key`, or None.
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live() {
                return Some(entry.value.clone());
            }
            drop(entry);
            self.entries.remove(key);
        }
        // Fall back to disk, hydrating memory on a live hit.
        let path = self.entry_path(key)?;
        let entry: CacheEntry = serde_json::from_str(&std::fs::read_to_string(path).ok()?).ok()?;
        if !entry.is_live() {
            return None;
        }
        let value = entry.value.clone();
        self.entries.insert(key.to_string(), entry);
        Some(value)
    }

    /// Store `value` under `key` with the given time-to-live.
    pub fn put(&self, key: &str, value: Value, ttl: Duration) -> FlowResult<()> {
        let entry = CacheEntry {
            value,
            expires_at_unix: now_unix().saturating_add(ttl.as_secs().max(1)),
        };
        if let Some(dir) = &self.dir {
            std::fs::create_dir_all(dir)?;
            std::fs::write(
                dir.join(format!("{key}.json")),
                serde_json::to_vec(&entry)?,
            )?;
        }
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    /// Acquire the single-flight build lock for `key` (async callers).
    ///
    /// Callers must re-probe [`OpCache::get`] after acquiring: the previous
    /// holder may have stored the entry.
    pub async fn build_lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.build_mutex(key).lock_owned().await
    }

    /// Acquire the single-flight build lock from a worker-pool thread.
    pub fn build_lock_blocking(&self, key: &str) -> OwnedMutexGuard<()> {
        self.build_mutex(key).blocking_lock_owned()
    }

    fn build_mutex(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.builds
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn entry_path(&self, key: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(format!("{key}.json")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_sensitivity() {
        let inputs_a = BTreeMap::from([("q".to_string(), json!("rust"))]);
        let inputs_b = BTreeMap::from([("q".to_string(), json!("go"))]);

        assert_eq!(
            OpCache::fingerprint("search", &inputs_a),
            OpCache::fingerprint("search", &inputs_a)
        );
        assert_ne!(
            OpCache::fingerprint("search", &inputs_a),
            OpCache::fingerprint("search", &inputs_b)
        );
        assert_ne!(
            OpCache::fingerprint("search", &inputs_a),
            OpCache::fingerprint("fetch", &inputs_a)
        );
    }

    #[test]
    fn test_put_get_and_expiry() {
        let cache = OpCache::in_memory();
        cache
            .put("k", json!({"r": 1}), Duration::from_secs(60))
            .unwrap();
        assert_eq!(cache.get("k"), Some(json!({"r": 1})));

        // A zero ttl is clamped to one second, so craft an expired entry.
        cache.entries.insert(
            "old".to_string(),
            CacheEntry {
                value: json!(1),
                expires_at_unix: now_unix() - 1,
            },
        );
        assert_eq!(cache.get("old"), None);
        assert!(!cache.entries.contains_key("old"));
    }

    #[test]
    fn test_overwrite() {
        let cache = OpCache::in_memory();
        cache.put("k", json!(1), Duration::from_secs(60)).unwrap();
        cache.put("k", json!(2), Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get("k"), Some(json!(2)));
    }

    #[test]
    fn test_file_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let key = OpCache::fingerprint("persist", &BTreeMap::new());
        {
            let cache = OpCache::with_dir(dir.path());
            cache.put(&key, json!("saved"), Duration::from_secs(60)).unwrap();
        }
        let reloaded = OpCache::with_dir(dir.path());
        assert_eq!(reloaded.get(&key), Some(json!("saved")));
    }

    #[tokio::test]
    async fn test_single_flight_serializes_builders() {
        let cache = Arc::new(OpCache::in_memory());
        let concurrent = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _guard = cache.build_lock("same-key").await;
                let now = concurrent.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
