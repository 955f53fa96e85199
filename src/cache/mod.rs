//! # Intelligent Cache
//!
//! A namespaced, TTL-plus-LRU cache with tag-based bulk invalidation and
//! per-key usage-pattern tracking for predictive prefetch. Namespaces are
//! independent: each has its own capacity, eviction order, and tag index.
//! Eviction enforces both a per-namespace entry-count budget and a
//! crate-wide byte-size budget.

use std::collections::VecDeque;
use hashbrown::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::bus::SharedBus;
use crate::clock::SharedClock;
use crate::types::{CacheEntry, TimestampMs, UsagePattern};

/// Default maximum entries retained per namespace before LRU eviction.
pub const DEFAULT_NAMESPACE_CAPACITY: usize = 10_000;

/// Default time-to-live for entries that don't specify one, milliseconds (5 minutes).
pub const DEFAULT_TTL_MS: i64 = 5 * 60 * 1000;

/// Default total cache size budget, bytes (100 MiB).
pub const DEFAULT_MAX_SIZE_BYTES: usize = 100 * 1024 * 1024;

/// Number of recent access timestamps retained per key for pattern tracking.
const USAGE_HISTORY_LEN: usize = 10;

fn estimate_size(value: &serde_json::Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

#[derive(Default)]
struct Namespace {
    entries: HashMap<String, CacheEntry>,
    lru: VecDeque<String>,
    tag_index: HashMap<String, HashSet<String>>,
    usage: HashMap<String, UsagePattern>,
    current_size: usize,
}

impl Namespace {
    fn touch_lru(&mut self, key: &str) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
        self.lru.push_back(key.to_string());
    }

    /// Evict least-recently-used entries until both the entry-count and
    /// byte-size budgets are satisfied. Returns the evicted keys.
    fn evict_until(&mut self, max_entries: usize, max_size: usize) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.entries.len() > max_entries || self.current_size > max_size {
            if let Some(oldest) = self.lru.pop_front() {
                if let Some(entry) = self.entries.remove(&oldest) {
                    self.current_size = self.current_size.saturating_sub(entry.size);
                    self.untag(&oldest);
                    evicted.push(oldest);
                }
            } else {
                break;
            }
        }
        evicted
    }

    fn untag(&mut self, key: &str) {
        for members in self.tag_index.values_mut() {
            members.remove(key);
        }
    }
}

/// Namespaced TTL+LRU cache with tag invalidation and usage tracking.
pub struct IntelligentCache {
    clock: SharedClock,
    bus: SharedBus,
    namespaces: RwLock<HashMap<String, Namespace>>,
    capacity: usize,
    default_ttl_ms: i64,
    max_size_bytes: usize,
}

impl IntelligentCache {
    /// Create a cache with default capacity, TTL, and size budget.
    pub fn new(clock: SharedClock, bus: SharedBus) -> Self {
        Self::with_config(clock, bus, DEFAULT_NAMESPACE_CAPACITY, DEFAULT_TTL_MS)
    }

    /// Create a cache with explicit per-namespace capacity and default TTL,
    /// using the default byte-size budget.
    pub fn with_config(clock: SharedClock, bus: SharedBus, capacity: usize, default_ttl_ms: i64) -> Self {
        Self {
            clock,
            bus,
            namespaces: RwLock::new(HashMap::new()),
            capacity,
            default_ttl_ms,
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
        }
    }

    fn cached_topic(namespace: &str) -> &'static str {
        match namespace {
            "flows" | "flow" => "flow_cached",
            "validation" => "validation_cached",
            _ => "generic_cached",
        }
    }

    /// Insert or overwrite `key` in `namespace`, tagged for bulk invalidation.
    #[instrument(skip(self, value))]
    pub async fn put(
        &self,
        namespace: &str,
        key: &str,
        value: serde_json::Value,
        ttl_ms: Option<i64>,
        tags: Vec<String>,
    ) {
        let now = self.clock.now_ms();
        let ttl = ttl_ms.unwrap_or(self.default_ttl_ms);
        let size = estimate_size(&value);
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            tags: tags.clone(),
            created_at: now,
            expires_at: now + ttl,
            last_accessed_at: now,
            access_count: 0,
            size,
        };

        let evicted = {
            let mut namespaces = self.namespaces.write().await;
            let ns = namespaces.entry(namespace.to_string()).or_insert_with(Namespace::default);

            if let Some(old) = ns.entries.get(key) {
                ns.current_size = ns.current_size.saturating_sub(old.size);
            }

            ns.untag(key);
            for tag in &tags {
                ns.tag_index.entry(tag.clone()).or_insert_with(HashSet::new).insert(key.to_string());
            }
            ns.current_size += size;
            ns.entries.insert(key.to_string(), entry);
            ns.touch_lru(key);
            ns.evict_until(self.capacity, self.max_size_bytes)
        };

        if !evicted.is_empty() {
            debug!(namespace, count = evicted.len(), "evicted entries over capacity");
            for evicted_key in &evicted {
                self.bus
                    .publish("cache_evicted", serde_json::json!({ "namespace": namespace, "key": evicted_key }))
                    .await;
            }
        }

        self.bus
            .publish(Self::cached_topic(namespace), serde_json::json!({ "namespace": namespace, "key": key }))
            .await;
    }

    /// Look up `key` in `namespace`, returning `None` if absent or expired.
    /// Updates LRU order and usage-pattern history on hit.
    #[instrument(skip(self))]
    pub async fn get(&self, namespace: &str, key: &str) -> Option<serde_json::Value> {
        let now = self.clock.now_ms();
        let value = {
            let mut namespaces = self.namespaces.write().await;
            let ns = namespaces.get_mut(namespace)?;

            let expired = ns.entries.get(key).map(|e| e.is_expired(now)).unwrap_or(true);
            if expired {
                if let Some(entry) = ns.entries.remove(key) {
                    ns.current_size = ns.current_size.saturating_sub(entry.size);
                    ns.untag(&entry.key);
                }
                return None;
            }

            let value = {
                let entry = ns.entries.get_mut(key)?;
                entry.access_count += 1;
                entry.last_accessed_at = now;
                entry.value.clone()
            };

            ns.touch_lru(key);
            Self::record_access(ns, key, now);
            value
        };

        self.bus
            .publish("cache_hit", serde_json::json!({ "namespace": namespace, "key": key }))
            .await;
        Some(value)
    }

    fn record_access(ns: &mut Namespace, key: &str, now: TimestampMs) {
        let pattern = ns.usage.entry(key.to_string()).or_insert_with(|| UsagePattern {
            key: key.to_string(),
            access_times: Vec::new(),
            mean_interval_ms: 0.0,
            predicted_next_access: now,
        });

        pattern.access_times.push(now);
        if pattern.access_times.len() > USAGE_HISTORY_LEN {
            pattern.access_times.remove(0);
        }

        if pattern.access_times.len() >= 2 {
            let intervals: Vec<f64> = pattern
                .access_times
                .windows(2)
                .map(|w| (w[1] - w[0]) as f64)
                .collect();
            pattern.mean_interval_ms = intervals.iter().sum::<f64>() / intervals.len() as f64;
            pattern.predicted_next_access = now + pattern.mean_interval_ms as i64;
        }
    }

    /// Invalidate every entry in `namespace` tagged with `tag`.
    #[instrument(skip(self))]
    pub async fn invalidate_tag(&self, namespace: &str, tag: &str) -> usize {
        let count = {
            let mut namespaces = self.namespaces.write().await;
            let Some(ns) = namespaces.get_mut(namespace) else {
                return 0;
            };

            let Some(keys) = ns.tag_index.remove(tag) else {
                return 0;
            };

            for key in &keys {
                if let Some(entry) = ns.entries.remove(key) {
                    ns.current_size = ns.current_size.saturating_sub(entry.size);
                }
                if let Some(pos) = ns.lru.iter().position(|k| k == key) {
                    ns.lru.remove(pos);
                }
            }
            debug!(namespace, tag, count = keys.len(), "invalidated tagged entries");
            keys.len()
        };

        if count > 0 {
            self.bus
                .publish("cache_invalidated", serde_json::json!({ "namespace": namespace, "tag": tag, "count": count }))
                .await;
        }
        count
    }

    /// Remove expired entries across every namespace.
    #[instrument(skip(self))]
    pub async fn evict_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut expired_total: Vec<(String, String)> = Vec::new();
        {
            let mut namespaces = self.namespaces.write().await;
            for (ns_name, ns) in namespaces.iter_mut() {
                let expired_keys: Vec<String> = ns
                    .entries
                    .iter()
                    .filter(|(_, e)| e.is_expired(now))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in expired_keys {
                    if let Some(entry) = ns.entries.remove(&key) {
                        ns.current_size = ns.current_size.saturating_sub(entry.size);
                    }
                    ns.untag(&key);
                    if let Some(pos) = ns.lru.iter().position(|k| k == &key) {
                        ns.lru.remove(pos);
                    }
                    expired_total.push((ns_name.clone(), key));
                }
            }
        }

        for (ns_name, key) in &expired_total {
            self.bus
                .publish("cache_expired", serde_json::json!({ "namespace": ns_name, "key": key }))
                .await;
        }
        self.bus
            .publish("cleanup_completed", serde_json::json!({ "evicted": expired_total.len() }))
            .await;
        expired_total.len()
    }

    /// Keys in `namespace` predicted to be accessed again within `horizon_ms`.
    pub async fn predictive_prefetch_candidates(&self, namespace: &str, horizon_ms: i64) -> Vec<String> {
        let now = self.clock.now_ms();
        let candidates = {
            let namespaces = self.namespaces.read().await;
            let Some(ns) = namespaces.get(namespace) else {
                return Vec::new();
            };
            ns.usage
                .values()
                .filter(|p| p.access_times.len() >= 2 && p.predicted_next_access - now <= horizon_ms)
                .map(|p| p.key.clone())
                .collect::<Vec<_>>()
        };

        if !candidates.is_empty() {
            self.bus
                .publish(
                    "predictive_prefetch",
                    serde_json::json!({ "namespace": namespace, "candidates": candidates }),
                )
                .await;
        }
        candidates
    }

    /// Current entry count for `namespace`.
    pub async fn len(&self, namespace: &str) -> usize {
        self.namespaces.read().await.get(namespace).map(|ns| ns.entries.len()).unwrap_or(0)
    }
}
