//! LRU query cache with per-entry TTL and entry/byte caps.
//!
//! Keys are SHA-256 over the SQL plus a canonical rendering of the request
//! context; values are immutable JSON. Eviction happens on insert: expired
//! entries first, then LRU heads until both the entry and byte caps hold.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::utils::hash::sha256_hex_truncated;

struct CacheEntry {
    value: Value,
    created_at: Instant,
    ttl: Duration,
    size_bytes: usize,
    access_count: u64,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    // LRU order: front = oldest
    order: Vec<String>,
    bytes_used: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

pub struct QueryCache {
    state: Mutex<CacheState>,
    max_entries: usize,
    max_bytes: usize,
    default_ttl: Duration,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatistics {
    pub entries: usize,
    pub max_entries: usize,
    pub memory_bytes: usize,
    pub max_memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
}

impl QueryCache {
    pub fn new(max_entries: usize, max_memory_mb: f64, default_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: Vec::new(),
                bytes_used: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_entries: max_entries.max(1),
            max_bytes: (max_memory_mb * 1024.0 * 1024.0) as usize,
            default_ttl,
        }
    }

    /// SHA-256 of sql + canonical(context), truncated to 32 hex chars.
    pub fn cache_key(sql: &str, context: Option<&Value>) -> String {
        let mut content = sql.to_string();
        if let Some(context) = context {
            content.push_str(&context.to_string());
        }
        sha256_hex_truncated(content.as_bytes(), 32)
    }

    fn estimate_size(value: &Value) -> usize {
        value.to_string().len().max(64)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove_key(state: &mut CacheState, key: &str) {
        if let Some(entry) = state.entries.remove(key) {
            state.bytes_used = state.bytes_used.saturating_sub(entry.size_bytes);
            state.evictions += 1;
        }
        state.order.retain(|k| k != key);
    }

    fn evict_if_needed(&self, state: &mut CacheState) {
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            Self::remove_key(state, &key);
        }

        while state.entries.len() >= self.max_entries {
            let Some(oldest) = state.order.first().cloned() else {
                break;
            };
            Self::remove_key(state, &oldest);
        }

        while state.bytes_used > self.max_bytes && !state.order.is_empty() {
            let Some(oldest) = state.order.first().cloned() else {
                break;
            };
            Self::remove_key(state, &oldest);
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut state = self.lock_state();

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(),
        };

        if expired {
            Self::remove_key(&mut state, key);
            state.misses += 1;
            return None;
        }

        // Move to the tail of the LRU order
        state.order.retain(|k| k != key);
        state.order.push(key.to_string());
        state.hits += 1;

        let entry = state.entries.get_mut(key)?;
        entry.access_count += 1;
        Some(entry.value.clone())
    }

    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let size = Self::estimate_size(&value);
        let mut state = self.lock_state();

        if state.entries.contains_key(key) {
            Self::remove_key(&mut state, key);
        }
        self.evict_if_needed(&mut state);

        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: Instant::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
                size_bytes: size,
                access_count: 0,
            },
        );
        state.order.push(key.to_string());
        state.bytes_used += size;
    }

    pub fn invalidate(&self, key: &str) {
        let mut state = self.lock_state();
        Self::remove_key(&mut state, key);
    }

    pub fn invalidate_all(&self) {
        let mut state = self.lock_state();
        state.entries.clear();
        state.order.clear();
        state.bytes_used = 0;
    }

    /// Cached value, or compute-and-store on miss.
    pub fn get_or_compute<F>(&self, key: &str, ttl: Option<Duration>, compute: F) -> Value
    where
        F: FnOnce() -> Value,
    {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = compute();
        self.set(key, value.clone(), ttl);
        value
    }

    pub fn get_statistics(&self) -> CacheStatistics {
        let state = self.lock_state();
        let total = state.hits + state.misses;
        CacheStatistics {
            entries: state.entries.len(),
            max_entries: self.max_entries,
            memory_bytes: state.bytes_used,
            max_memory_bytes: self.max_bytes,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if total > 0 {
                state.hits as f64 / total as f64
            } else {
                0.0
            },
            evictions: state.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> QueryCache {
        QueryCache::new(3, 50.0, Duration::from_secs(300))
    }

    #[test]
    fn test_set_get_roundtrip() {
        let cache = cache();
        let key = QueryCache::cache_key("SELECT 1", None);
        assert!(cache.get(&key).is_none());

        cache.set(&key, json!({"count": 10}), None);
        assert_eq!(cache.get(&key), Some(json!({"count": 10})));

        let stats = cache.get_statistics();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_context_changes_key() {
        let k1 = QueryCache::cache_key("SELECT 1", Some(&json!({"user": "a"})));
        let k2 = QueryCache::cache_key("SELECT 1", Some(&json!({"user": "b"})));
        assert_ne!(k1, k2);
        assert_eq!(k1.len(), 32);
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache = cache();
        for i in 0..3 {
            cache.set(&format!("k{}", i), json!(i), None);
        }
        // Touch k0 so k1 becomes the LRU head
        cache.get("k0");
        cache.set("k3", json!(3), None);

        assert!(cache.get("k0").is_some());
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k3").is_some());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = cache();
        cache.set("short", json!(1), Some(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("short").is_none());
    }

    #[test]
    fn test_get_or_compute() {
        let cache = cache();
        let computed = cache.get_or_compute("key", None, || json!("fresh"));
        assert_eq!(computed, json!("fresh"));
        // Second call hits the cache instead of recomputing
        let cached = cache.get_or_compute("key", None, || json!("recomputed"));
        assert_eq!(cached, json!("fresh"));
    }

    #[test]
    fn test_invalidate_all() {
        let cache = cache();
        cache.set("a", json!(1), None);
        cache.set("b", json!(2), None);
        cache.invalidate_all();
        assert_eq!(cache.get_statistics().entries, 0);
        assert_eq!(cache.get_statistics().memory_bytes, 0);
    }
}
