//! In-memory TTL cache
//!
//! Entries expire individually and the cache holds at most `max_entries`
//! values. When full, the entry created first is evicted regardless of how
//! recently it was read.

use parking_lot::Mutex;
use relay_core::{CacheSettings, EventBus, EventKind};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Entry in the timed cache
#[derive(Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    /// None for no expiration
    expires_at: Option<Instant>,
    sequence: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }
}

/// Configuration for the timed cache
#[derive(Debug, Clone)]
pub struct TimedCacheConfig {
    /// Name used in logs
    pub name: String,
    /// Default TTL for entries
    pub default_ttl: Option<Duration>,
    /// Maximum number of entries
    pub max_entries: usize,
    /// How often to purge expired entries in the background
    pub cleanup_interval: Option<Duration>,
}

impl Default for TimedCacheConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            default_ttl: Some(Duration::from_secs(300)),
            max_entries: 1000,
            cleanup_interval: None,
        }
    }
}

impl TimedCacheConfig {
    /// Create a new config with default TTL
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            default_ttl,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set max entries
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max.max(1);
        self
    }

    /// Set cleanup interval
    pub fn with_cleanup_interval(mut self, interval: Option<Duration>) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

impl From<&CacheSettings> for TimedCacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self::new(settings.default_ttl())
            .with_max_entries(settings.max_entries)
            .with_cleanup_interval(settings.cleanup_interval())
    }
}

/// Counters for one cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Get the hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Creation sequence -> key, oldest first
    order: BTreeMap<u64, String>,
    next_sequence: u64,
    stats: CacheStats,
}

impl<V> CacheState<V> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.sequence);
        Some(entry)
    }

    fn remove_if_expired(&mut self, key: &str, now: Instant) -> bool {
        let expired = self
            .entries
            .get(key)
            .map(|entry| entry.is_expired(now))
            .unwrap_or(false);
        if expired {
            self.remove(key);
            self.stats.expirations += 1;
        }
        expired
    }
}

struct TimedCacheInner<V> {
    config: TimedCacheConfig,
    state: Mutex<CacheState<V>>,
    events: Option<EventBus>,
    shutdown: CancellationToken,
}

impl<V> Drop for TimedCacheInner<V> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// TTL cache with creation-order eviction
pub struct TimedCache<V> {
    inner: Arc<TimedCacheInner<V>>,
}

impl<V> Clone for TimedCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> TimedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a new cache
    pub fn new(config: TimedCacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a cache that reports evictions on `events`
    pub fn with_events(config: TimedCacheConfig, events: EventBus) -> Self {
        Self::build(config, Some(events))
    }

    /// Create with default configuration
    pub fn default_config() -> Self {
        Self::new(TimedCacheConfig::default())
    }

    fn build(config: TimedCacheConfig, events: Option<EventBus>) -> Self {
        let cleanup_interval = config.cleanup_interval;
        let cache = Self {
            inner: Arc::new(TimedCacheInner {
                config,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    order: BTreeMap::new(),
                    next_sequence: 0,
                    stats: CacheStats::default(),
                }),
                events,
                shutdown: CancellationToken::new(),
            }),
        };

        if let Some(interval) = cleanup_interval {
            cache.spawn_cleanup(interval);
        }

        cache
    }

    fn spawn_cleanup(&self, interval: Duration) {
        let Ok(handle) = Handle::try_current() else {
            warn!(
                cache = %self.inner.config.name,
                "No tokio runtime, background cache cleanup disabled"
            );
            return;
        };

        let weak: Weak<TimedCacheInner<V>> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        TimedCache { inner }.cleanup();
                    }
                }
            }
        });
    }

    /// Store `value` under `key` with the default TTL
    pub fn set(&self, key: impl Into<String>, value: V) {
        let ttl = self.inner.config.default_ttl;
        self.insert(key.into(), value, ttl);
    }

    /// Store `value` under `key` expiring after `ttl`
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.insert(key.into(), value, Some(ttl));
    }

    fn insert(&self, key: String, value: V, ttl: Option<Duration>) {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut state = self.inner.state.lock();

            // Overwrites replace in place and never evict another key
            state.remove(&key);

            while state.entries.len() >= self.inner.config.max_entries {
                let Some((_, oldest)) = state.order.pop_first() else {
                    break;
                };
                state.entries.remove(&oldest);
                state.stats.evictions += 1;
                evicted.push(oldest);
            }

            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.order.insert(sequence, key.clone());
            state.entries.insert(
                key.clone(),
                CacheEntry {
                    value,
                    created_at: now,
                    expires_at: ttl.map(|ttl| now + ttl),
                    sequence,
                },
            );
        }

        debug!(cache = %self.inner.config.name, key = %key, ttl = ?ttl, "Set cache key");

        for oldest in evicted {
            debug!(cache = %self.inner.config.name, key = %oldest, "Evicted cache entry");
            if let Some(events) = &self.inner.events {
                events.publish(
                    EventKind::CacheEvicted,
                    oldest.as_str(),
                    json!({ "cache": self.inner.config.name, "reason": "capacity" }),
                );
            }
        }
    }

    /// Get an unexpired value; an expired entry is removed on read
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        state.remove_if_expired(key, now);

        let value = state.entries.get(key).map(|entry| entry.value.clone());
        match value {
            Some(value) => {
                state.stats.hits += 1;
                Some(value)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Check if a key exists and is not expired
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        state.remove_if_expired(key, now);
        state.entries.contains_key(key)
    }

    /// Remaining TTL for a key; None if missing, expired or immortal
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let state = self.inner.state.lock();
        state
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .and_then(|exp| exp.checked_duration_since(now))
            .filter(|remaining| !remaining.is_zero())
    }

    /// Age of an entry since it was stored
    pub fn age(&self, key: &str) -> Option<Duration> {
        let state = self.inner.state.lock();
        state.entries.get(key).map(|entry| entry.created_at.elapsed())
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.state.lock().remove(key).is_some()
    }

    /// Remove all entries
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.entries.clear();
        state.order.clear();
        debug!(cache = %self.inner.config.name, "Cleared all cache entries");
    }

    /// Purge every expired entry. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut state = self.inner.state.lock();

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.remove(key);
        }
        state.stats.expirations += expired.len() as u64;

        if !expired.is_empty() {
            debug!(
                cache = %self.inner.config.name,
                removed = expired.len(),
                "Cache cleanup removed expired entries"
            );
        }
        expired.len()
    }

    /// Number of stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        CacheStats {
            entries: state.entries.len(),
            ..state.stats.clone()
        }
    }

    /// Return the cached value or compute, store and return it
    pub fn get_or_insert_with<F>(&self, key: &str, f: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = f();
        self.set(key, value.clone());
        value
    }

    /// Async variant that only caches successful results
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: &str, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = init().await?;
        self.set(key, value.clone());
        Ok(value)
    }

    /// Wrap `f` so repeated calls with equal arguments are served from cache.
    ///
    /// Arguments are keyed by their JSON form. Every return value is cached,
    /// including `None`, `false` and zero.
    pub fn memoize<A, F>(&self, f: F) -> impl Fn(&A) -> V
    where
        A: Serialize,
        F: Fn(&A) -> V,
    {
        let cache = self.clone();
        move |args: &A| match serde_json::to_string(args) {
            Ok(key) => cache.get_or_insert_with(&key, || f(args)),
            Err(e) => {
                warn!(
                    cache = %cache.inner.config.name,
                    error = %e,
                    "Memoize key serialization failed, calling through"
                );
                f(args)
            }
        }
    }

    /// Like [`memoize`](Self::memoize) with a caller-supplied key function
    pub fn memoize_with<A, F, K>(&self, f: F, key_fn: K) -> impl Fn(&A) -> V
    where
        F: Fn(&A) -> V,
        K: Fn(&A) -> String,
    {
        let cache = self.clone();
        move |args: &A| {
            let key = key_fn(args);
            cache.get_or_insert_with(&key, || f(args))
        }
    }
}
