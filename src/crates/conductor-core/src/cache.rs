//! Step result cache - content-addressed memoization with single-flight
//!
//! Step results are memoized under their fingerprint (see
//! [`crate::canonical::fingerprint`]): member name + version + canonical
//! resolved input + canonical config. Keys are opaque strings here; the
//! cache never inspects them.
//!
//! # Guarantees
//!
//! - **TTL**: expired entries are never returned; expiry is enforced on
//!   read, so no background sweeper is needed.
//! - **Eviction**: when the entry count reaches `max_size` the configured
//!   [`EvictionPolicy`] picks a victim. TTL expiry and eviction are
//!   independent - the cache may evict live entries under pressure.
//! - **Single-flight**: at most one computation per fingerprint runs at a
//!   time within the process. A lookup that arrives while a computation is
//!   in flight waits and shares the outcome - success *or* failure.
//!   Failures are shared with the waiters of that flight but never stored;
//!   the next lookup recomputes.
//! - **Bypass**: `bypass` skips the lookup, still serializes through the
//!   per-fingerprint flight, and refreshes the stored value on success.
//!
//! # Tags
//!
//! Entries may carry tags; [`StepCache::invalidate_tag`] drops every entry
//! carrying the tag. Tag invalidation is the public invalidation surface -
//! fingerprints themselves are never exposed to callers.

use crate::error::{EngineError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};

/// Cached entry with bookkeeping metadata
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    created_at: Instant,
    last_accessed: Instant,
    access_count: usize,
    expires_at: Option<Instant>,
    tags: Vec<String>,
}

impl CacheEntry {
    fn new(value: Value, ttl: Option<Duration>, tags: Vec<String>) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            last_accessed: now,
            access_count: 1,
            expires_at: ttl.map(|d| now + d),
            tags,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() > at).unwrap_or(false)
    }

    fn touch(&mut self) {
        self.last_accessed = Instant::now();
        self.access_count += 1;
    }
}

/// Cache eviction policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Least Recently Used
    Lru,
    /// Least Frequently Used
    Lfu,
    /// First In First Out
    Fifo,
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries before eviction kicks in
    pub max_size: usize,

    /// TTL applied when a put does not specify one
    pub default_ttl: Option<Duration>,

    /// Eviction policy under memory pressure
    pub eviction_policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            default_ttl: Some(Duration::from_secs(3600)),
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

/// Counters exposed for metrics and tests
#[derive(Debug, Default, Clone)]
pub struct CacheMetrics {
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
    pub entries: usize,
    /// Lookups that waited on an in-flight computation and shared its result
    pub shared: usize,
    /// Forced recomputations
    pub bypasses: usize,
}

impl CacheMetrics {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// How a step obtained its result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from the cache
    Hit,
    /// Computed fresh and stored
    Miss,
    /// Waited on a concurrent computation and shared its result
    Shared,
    /// `bypass` forced recomputation
    Bypassed,
}

/// Options for a single put
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Overrides the configured default TTL
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

#[derive(Clone)]
enum Flight {
    Pending,
    Done(std::result::Result<Value, Arc<EngineError>>),
}

/// Content-addressed step result cache
pub struct StepCache {
    storage: Arc<RwLock<HashMap<String, CacheEntry>>>,
    inflight: Arc<Mutex<HashMap<String, watch::Receiver<Flight>>>>,
    config: CacheConfig,
    metrics: Arc<RwLock<CacheMetrics>>,
}

impl StepCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            config,
            metrics: Arc::new(RwLock::new(CacheMetrics::default())),
        }
    }

    /// Look up a key, enforcing TTL. Updates hit/miss counters.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut storage = self.storage.write().await;
        match storage.get_mut(key) {
            Some(entry) if entry.is_expired() => {
                storage.remove(key);
                let entries = storage.len();
                drop(storage);
                let mut metrics = self.metrics.write().await;
                metrics.misses += 1;
                metrics.entries = entries;
                None
            }
            Some(entry) => {
                entry.touch();
                let value = entry.value.clone();
                drop(storage);
                self.metrics.write().await.hits += 1;
                Some(value)
            }
            None => {
                drop(storage);
                self.metrics.write().await.misses += 1;
                None
            }
        }
    }

    /// Store a value. Overwrites are explicit: putting an existing key
    /// replaces the entry and its TTL/tags.
    pub async fn put(&self, key: impl Into<String>, value: Value, options: PutOptions) {
        let key = key.into();
        let ttl = options.ttl.or(self.config.default_ttl);
        let mut storage = self.storage.write().await;

        if storage.len() >= self.config.max_size && !storage.contains_key(&key) {
            if let Some(victim) = self.pick_victim(&storage) {
                storage.remove(&victim);
                self.metrics.write().await.evictions += 1;
            }
        }

        storage.insert(key, CacheEntry::new(value, ttl, options.tags));
        let entries = storage.len();
        drop(storage);
        self.metrics.write().await.entries = entries;
    }

    /// Remove a single key.
    pub async fn invalidate_key(&self, key: &str) -> bool {
        let mut storage = self.storage.write().await;
        let removed = storage.remove(key).is_some();
        let entries = storage.len();
        drop(storage);
        self.metrics.write().await.entries = entries;
        removed
    }

    /// Remove every entry carrying the tag. Returns how many were dropped.
    pub async fn invalidate_tag(&self, tag: &str) -> usize {
        let mut storage = self.storage.write().await;
        let before = storage.len();
        storage.retain(|_, entry| !entry.tags.iter().any(|t| t == tag));
        let dropped = before - storage.len();
        let entries = storage.len();
        drop(storage);
        self.metrics.write().await.entries = entries;
        dropped
    }

    pub async fn metrics(&self) -> CacheMetrics {
        self.metrics.read().await.clone()
    }

    /// Test hook: drop everything.
    pub async fn clear(&self) {
        self.storage.write().await.clear();
        self.metrics.write().await.entries = 0;
    }

    fn pick_victim(&self, storage: &HashMap<String, CacheEntry>) -> Option<String> {
        match self.config.eviction_policy {
            EvictionPolicy::Lru => storage
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Lfu => storage
                .iter()
                .min_by_key(|(_, e)| e.access_count)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Fifo => storage
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone()),
        }
    }

    /// Resolve a key: serve a hit, or run `compute` under the
    /// per-fingerprint flight lock.
    ///
    /// Exactly one caller per key computes at a time; concurrent callers
    /// wait and share the leader's outcome. Successes are stored (with
    /// `options`); failures are shared with the waiting flight but never
    /// stored.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        bypass: bool,
        options: PutOptions,
        compute: F,
    ) -> (Result<Value>, CacheOutcome)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        if !bypass {
            if let Some(value) = self.get(key).await {
                return (Ok(value), CacheOutcome::Hit);
            }
        }

        // Join or become the leader of the flight for this key.
        let (leader_tx, mut waiter_rx) = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(key) {
                Some(rx) => (None, Some(rx.clone())),
                None => {
                    let (tx, rx) = watch::channel(Flight::Pending);
                    inflight.insert(key.to_string(), rx);
                    (Some(tx), None)
                }
            }
        };

        if let Some(rx) = waiter_rx.as_mut() {
            // Follower: wait for the leader's outcome.
            loop {
                let flight = rx.borrow().clone();
                match flight {
                    Flight::Done(Ok(value)) => {
                        self.metrics.write().await.shared += 1;
                        return (Ok(value), CacheOutcome::Shared);
                    }
                    Flight::Done(Err(shared)) => {
                        self.metrics.write().await.shared += 1;
                        return (Err(EngineError::SharedFlight(shared)), CacheOutcome::Shared);
                    }
                    Flight::Pending => {
                        if rx.changed().await.is_err() {
                            // Leader dropped without publishing. Evict the
                            // dead flight (unless a fresh one already took
                            // its place) and retry the whole entry path.
                            let mut inflight = self.inflight.lock().await;
                            let dead = inflight
                                .get(key)
                                .map(|r| r.has_changed().is_err())
                                .unwrap_or(false);
                            if dead {
                                inflight.remove(key);
                            }
                            break;
                        }
                    }
                }
            }
            return Box::pin(self.get_or_compute(key, bypass, options, compute)).await;
        }

        let tx = match leader_tx {
            Some(tx) => tx,
            None => {
                return (
                    Err(EngineError::Internal("flight without leader".to_string())),
                    CacheOutcome::Miss,
                )
            }
        };

        // Leader: double-check the cache now that we own the flight
        // (another leader may have completed between our miss and lock).
        if !bypass {
            if let Some(value) = self.get(key).await {
                let _ = tx.send(Flight::Done(Ok(value.clone())));
                self.inflight.lock().await.remove(key);
                return (Ok(value), CacheOutcome::Hit);
            }
        }

        let result = compute().await;
        let outcome = if bypass {
            self.metrics.write().await.bypasses += 1;
            CacheOutcome::Bypassed
        } else {
            CacheOutcome::Miss
        };

        match result {
            Ok(value) => {
                self.put(key, value.clone(), options).await;
                let _ = tx.send(Flight::Done(Ok(value.clone())));
                self.inflight.lock().await.remove(key);
                (Ok(value), outcome)
            }
            Err(e) => {
                // Failures are shared with this flight's waiters, not cached.
                // The leader observes the same wrapped error so the kind is
                // identical on both sides.
                let shared = Arc::new(e);
                let _ = tx.send(Flight::Done(Err(Arc::clone(&shared))));
                self.inflight.lock().await.remove(key);
                (Err(EngineError::SharedFlight(shared)), outcome)
            }
        }
    }
}

impl Default for StepCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
