//! Fingerprint cache: exact-key lookup with a similarity fallback.
//!
//! Entries live in a bounded LRU map guarded by a single mutex. A lookup
//! first tries the exact fingerprint; on a miss it scores the request's
//! normalized content against every resident digest and serves the best
//! match if it clears `similarity_threshold`. Serving a near-match is an
//! accepted trade-off: callers must tolerate a close-but-not-identical
//! answer.
//!
//! An optional [`CacheStore`] mirrors every write. The first store error
//! switches the cache to memory-only mode and is logged exactly once.

pub mod similarity;
pub mod store;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::ConfigError;
use store::{CacheStore, StoredEntry};

/// A resident cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub content_digest: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    tokens: HashSet<String>,
}

impl<V> CacheEntry<V> {
    fn new(key: String, value: V, content_digest: String, now: DateTime<Utc>) -> Self {
        let tokens = similarity::tokens(&content_digest);
        Self {
            key,
            value,
            content_digest,
            created_at: now,
            last_accessed_at: now,
            tokens,
        }
    }
}

/// How a lookup was satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchKind {
    Exact,
    Similar { matched_key: String, score: f64 },
}

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct CacheHit<V> {
    pub value: V,
    pub kind: MatchKind,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub similarity_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub similarity_threshold: f64,
    pub persistent: bool,
    pub degraded: bool,
}

pub struct FingerprintCache<V> {
    entries: Mutex<LruCache<String, CacheEntry<V>>>,
    config: CacheConfig,
    store: Option<Box<dyn CacheStore>>,
    degraded: AtomicBool,
    hits: AtomicU64,
    similarity_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V> FingerprintCache<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    /// Memory-only cache.
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.max_size)
            .ok_or_else(|| ConfigError::invalid("cache_max_size", "must be at least 1"))?;

        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            config,
            store: None,
            degraded: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            similarity_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Cache mirrored to a durable store and warmed from it. A store that
    /// fails to load leaves an empty, memory-only cache.
    pub fn with_store(config: CacheConfig, store: Box<dyn CacheStore>) -> Result<Self, ConfigError> {
        let mut cache = Self::new(config)?;
        cache.store = Some(store);
        cache.warm();
        Ok(cache)
    }

    fn warm(&self) {
        let Some(store) = self.live_store() else { return };
        let stored = match store.load(self.config.max_size) {
            Ok(rows) => rows,
            Err(e) => {
                self.degrade("load", &e);
                return;
            }
        };

        let mut entries = self.lock();
        let mut skipped = 0usize;
        // Rows arrive least recently used first, so pushing in order
        // reproduces the persisted LRU order.
        for row in stored {
            match serde_json::from_str::<V>(&row.value_json) {
                Ok(value) => {
                    let mut entry = CacheEntry::new(row.key.clone(), value, row.content_digest, row.created_at);
                    entry.last_accessed_at = row.last_accessed_at;
                    entries.put(row.key, entry);
                }
                Err(e) => {
                    skipped += 1;
                    debug!(key = %row.key, error = %e, "Skipping undecodable cache row");
                }
            }
        }
        info!(loaded = entries.len(), skipped, "Fingerprint cache warmed from store");
    }

    /// Value for `key`, or for the most similar resident content.
    pub fn get(&self, key: &str, content: &str) -> Option<V> {
        self.lookup(key, content).map(|hit| hit.value)
    }

    /// Like [`get`](Self::get) but reports how the hit was found.
    pub fn lookup(&self, key: &str, content: &str) -> Option<CacheHit<V>> {
        let now = Utc::now();

        let hit = {
            let mut entries = self.lock();
            if let Some(entry) = entries.get_mut(key) {
                entry.last_accessed_at = now;
                Some((
                    key.to_string(),
                    CacheHit {
                        value: entry.value.clone(),
                        kind: MatchKind::Exact,
                    },
                ))
            } else {
                self.best_similar(&mut entries, content, now)
            }
        };

        match hit {
            Some((touched_key, hit)) => {
                match &hit.kind {
                    MatchKind::Exact => self.hits.fetch_add(1, Ordering::Relaxed),
                    MatchKind::Similar { .. } => self.similarity_hits.fetch_add(1, Ordering::Relaxed),
                };
                if let Some(store) = self.live_store() {
                    if let Err(e) = store.touch(&touched_key, now) {
                        self.degrade("touch", &e);
                    }
                }
                Some(hit)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn best_similar(
        &self,
        entries: &mut LruCache<String, CacheEntry<V>>,
        content: &str,
        now: DateTime<Utc>,
    ) -> Option<(String, CacheHit<V>)> {
        let query = similarity::tokens(&similarity::normalize(content));
        if query.is_empty() {
            return None;
        }
        let threshold = self.config.similarity_threshold;

        let mut best: Option<(String, f64)> = None;
        for (key, entry) in entries.iter() {
            let bound = similarity::jaccard_upper_bound(query.len(), entry.tokens.len());
            let floor = best.as_ref().map(|(_, s)| *s).unwrap_or(threshold);
            if bound < floor {
                continue;
            }
            let score = similarity::jaccard(&query, &entry.tokens);
            if score > 0.0 && score >= threshold && best.as_ref().map_or(true, |(_, s)| score > *s) {
                best = Some((key.clone(), score));
            }
        }

        let (matched_key, score) = best?;
        let entry = entries.get_mut(&matched_key)?;
        entry.last_accessed_at = now;
        debug!(matched = %matched_key, score, "Similarity cache hit");
        Some((
            matched_key.clone(),
            CacheHit {
                value: entry.value.clone(),
                kind: MatchKind::Similar { matched_key, score },
            },
        ))
    }

    /// Insert or overwrite an entry, evicting the least recently used one
    /// when full. Never fails; persistence problems only degrade the cache.
    pub fn set(&self, key: impl Into<String>, value: V, content: &str) {
        let key = key.into();
        let now = Utc::now();
        let digest = similarity::normalize(content);
        let entry = CacheEntry::new(key.clone(), value, digest, now);
        let persisted = self.live_store().map(|_| to_stored(&entry));

        // Store writes stay under the entries lock so they reach the store
        // in the same order as the memory changes they mirror.
        let mut entries = self.lock();
        let evicted = if !entries.contains(&key) && entries.len() >= entries.cap().get() {
            entries.pop_lru()
        } else {
            None
        };
        entries.put(key, entry);

        if let Some((evicted_key, _)) = &evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %evicted_key, "Evicted least recently used cache entry");
        }

        let Some(store) = self.live_store() else { return };
        if let Some((evicted_key, _)) = &evicted {
            if let Err(e) = store.remove(evicted_key) {
                self.degrade("remove", &e);
                return;
            }
        }
        match persisted {
            Some(Ok(row)) => {
                if let Err(e) = store.upsert(&row) {
                    self.degrade("upsert", &e);
                }
            }
            Some(Err(e)) => debug!(error = %e, "Cache value not serializable, kept in memory only"),
            None => {}
        }
    }

    /// Drop every entry, in memory and in the store.
    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.clear();
        if let Some(store) = self.live_store() {
            if let Err(e) = store.clear() {
                self.degrade("clear", &e);
            }
        }
        info!("Fingerprint cache cleared");
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the cache has fallen back to memory-only operation.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn get_stats(&self) -> CacheStats {
        let size = self.len();
        let hits = self.hits.load(Ordering::Relaxed);
        let similarity_hits = self.similarity_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + similarity_hits + misses;

        CacheStats {
            size,
            capacity: self.config.max_size,
            hits,
            similarity_hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                (hits + similarity_hits) as f64 / lookups as f64
            },
            similarity_threshold: self.config.similarity_threshold,
            persistent: self.live_store().is_some(),
            degraded: self.is_degraded(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live_store(&self) -> Option<&dyn CacheStore> {
        if self.is_degraded() {
            return None;
        }
        self.store.as_deref()
    }

    fn degrade(&self, operation: &str, err: &anyhow::Error) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                operation,
                error = %format!("{:#}", err),
                "Cache store unavailable, continuing memory-only"
            );
        }
    }
}

fn to_stored<V: Serialize>(entry: &CacheEntry<V>) -> serde_json::Result<StoredEntry> {
    Ok(StoredEntry {
        key: entry.key.clone(),
        value_json: serde_json::to_string(&entry.value)?,
        content_digest: entry.content_digest.clone(),
        created_at: entry.created_at,
        last_accessed_at: entry.last_accessed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use store::SqliteCacheStore;

    fn config(max_size: usize, threshold: f64) -> CacheConfig {
        CacheConfig { max_size, similarity_threshold: threshold }
    }

    /// Store whose every operation fails, counting the attempts.
    #[derive(Default)]
    struct BrokenStore {
        calls: AtomicU64,
    }

    impl CacheStore for BrokenStore {
        fn load(&self, _limit: usize) -> anyhow::Result<Vec<StoredEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("disk unavailable")
        }
        fn upsert(&self, _entry: &StoredEntry) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("disk unavailable")
        }
        fn touch(&self, _key: &str, _at: DateTime<Utc>) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("disk unavailable")
        }
        fn remove(&self, _key: &str) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("disk unavailable")
        }
        fn clear(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("disk unavailable")
        }
    }

    /// Forwards to a shared store so the test can inspect it afterwards.
    struct Shared(Arc<SqliteCacheStore>);

    impl CacheStore for Shared {
        fn load(&self, limit: usize) -> anyhow::Result<Vec<StoredEntry>> { self.0.load(limit) }
        fn upsert(&self, entry: &StoredEntry) -> anyhow::Result<()> { self.0.upsert(entry) }
        fn touch(&self, key: &str, at: DateTime<Utc>) -> anyhow::Result<()> { self.0.touch(key, at) }
        fn remove(&self, key: &str) -> anyhow::Result<()> { self.0.remove(key) }
        fn clear(&self) -> anyhow::Result<()> { self.0.clear() }
    }

    #[test]
    fn test_exact_match_returns_stored_value() {
        let cache = FingerprintCache::new(config(10, 0.9)).unwrap();
        cache.set("key-a", "R1".to_string(), "content for a");
        // same key, different content: exact match wins
        assert_eq!(cache.get("key-a", "something else entirely"), Some("R1".to_string()));
        let stats = cache.get_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_overwrite_replaces_value() {
        let cache = FingerprintCache::new(config(2, 0.9)).unwrap();
        cache.set("k", 1u32, "x");
        cache.set("k", 2u32, "x");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("k", "x"), Some(2));
        assert_eq!(cache.get_stats().evictions, 0);
    }

    #[test]
    fn test_lru_evicts_least_recently_accessed() {
        let cache = FingerprintCache::new(config(3, 1.0)).unwrap();
        cache.set("a", 1u32, "alpha");
        cache.set("b", 2u32, "bravo");
        cache.set("c", 3u32, "charlie");

        // touch a, leaving b as the least recently used
        assert_eq!(cache.get("a", ""), Some(1));
        cache.set("d", 4u32, "delta");

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("b", ""), None);
        assert_eq!(cache.get("a", ""), Some(1));
        assert_eq!(cache.get("c", ""), Some(3));
        assert_eq!(cache.get("d", ""), Some(4));
        assert_eq!(cache.get_stats().evictions, 1);
    }

    #[test]
    fn test_eviction_sequence_follows_access_order() {
        let cache = FingerprintCache::new(config(2, 1.0)).unwrap();
        cache.set("a", 1u32, "");
        cache.set("b", 2u32, "");
        cache.get("a", "");
        cache.set("c", 3u32, ""); // evicts b
        cache.set("d", 4u32, ""); // evicts a
        assert_eq!(cache.get("a", ""), None);
        assert_eq!(cache.get("b", ""), None);
        assert_eq!(cache.get("c", ""), Some(3));
        assert_eq!(cache.get("d", ""), Some(4));
    }

    #[test]
    fn test_similarity_fallback_serves_near_duplicate() {
        let cache = FingerprintCache::new(config(10, 0.8)).unwrap();
        cache.set(
            "original",
            "urgent".to_string(),
            "Please send the quarterly report to finance before Friday noon",
        );

        let hit = cache
            .lookup("edited", "please send the quarterly report to finance before friday noon!!")
            .expect("near duplicate should hit");
        assert_eq!(hit.value, "urgent");
        match hit.kind {
            MatchKind::Similar { matched_key, score } => {
                assert_eq!(matched_key, "original");
                assert!(score >= 0.8);
            }
            MatchKind::Exact => panic!("expected a similarity hit"),
        }
        assert_eq!(cache.get_stats().similarity_hits, 1);
    }

    #[test]
    fn test_similarity_below_threshold_misses() {
        let cache = FingerprintCache::new(config(10, 0.9)).unwrap();
        cache.set("a", 1u32, "team lunch on thursday at the usual place");
        assert_eq!(cache.get("b", "server outage in production please page oncall"), None);
        assert_eq!(cache.get_stats().misses, 1);
    }

    #[test]
    fn test_similarity_picks_best_match() {
        let cache = FingerprintCache::new(config(10, 0.5)).unwrap();
        cache.set("far", "far".to_string(), "a b c d x y z w");
        cache.set("near", "near".to_string(), "a b c d e f");
        assert_eq!(cache.get("q", "a b c d e g"), Some("near".to_string()));
    }

    #[test]
    fn test_similarity_hit_refreshes_lru_position() {
        let cache = FingerprintCache::new(config(2, 0.8)).unwrap();
        cache.set("a", 1u32, "one two three four five");
        cache.set("b", 2u32, "six seven eight nine ten");
        // similar to a, promotes it
        assert_eq!(cache.get("a2", "one two three four five"), Some(1));
        cache.set("c", 3u32, "eleven");
        assert_eq!(cache.get("b", ""), None);
        assert_eq!(cache.get("a", ""), Some(1));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = FingerprintCache::<u32>::new(config(0, 0.5));
        assert!(matches!(result, Err(ConfigError::InvalidValue { field: "cache_max_size", .. })));
    }

    #[test]
    fn test_write_through_and_warm_start() {
        let shared = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
        {
            let cache = FingerprintCache::with_store(config(2, 0.9), Box::new(Shared(Arc::clone(&shared)))).unwrap();
            cache.set("a", "A".to_string(), "alpha");
            cache.set("b", "B".to_string(), "bravo");
            cache.get("a", "");
            cache.set("c", "C".to_string(), "charlie"); // evicts b from memory and store
            assert!(cache.get_stats().persistent);
        }
        assert_eq!(shared.len().unwrap(), 2);

        let warmed: FingerprintCache<String> =
            FingerprintCache::with_store(config(2, 0.9), Box::new(Shared(Arc::clone(&shared)))).unwrap();
        assert_eq!(warmed.len(), 2);
        assert_eq!(warmed.get("a", ""), Some("A".to_string()));
        assert_eq!(warmed.get("c", ""), Some("C".to_string()));
        assert_eq!(warmed.get("b", ""), None);
    }

    #[test]
    fn test_store_failure_degrades_once_to_memory_only() {
        let broken = Arc::new(BrokenStore::default());

        struct Forward(Arc<BrokenStore>);
        impl CacheStore for Forward {
            fn load(&self, limit: usize) -> anyhow::Result<Vec<StoredEntry>> { self.0.load(limit) }
            fn upsert(&self, entry: &StoredEntry) -> anyhow::Result<()> { self.0.upsert(entry) }
            fn touch(&self, key: &str, at: DateTime<Utc>) -> anyhow::Result<()> { self.0.touch(key, at) }
            fn remove(&self, key: &str) -> anyhow::Result<()> { self.0.remove(key) }
            fn clear(&self) -> anyhow::Result<()> { self.0.clear() }
        }

        let cache = FingerprintCache::with_store(config(4, 0.9), Box::new(Forward(Arc::clone(&broken)))).unwrap();
        assert!(cache.is_degraded());
        assert!(cache.is_empty());

        // the cache keeps working without touching the store again
        cache.set("k", 7u32, "seven");
        assert_eq!(cache.get("k", ""), Some(7));
        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);

        let stats = cache.get_stats();
        assert!(stats.degraded);
        assert!(!stats.persistent);
    }

    #[test]
    fn test_clear_empties_memory_and_store() {
        let shared = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
        let cache = FingerprintCache::with_store(config(4, 0.9), Box::new(Shared(Arc::clone(&shared)))).unwrap();
        cache.set("a", 1u32, "alpha");
        cache.set("b", 2u32, "bravo");
        assert_eq!(shared.len().unwrap(), 2);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get("a", "alpha"), None);
        assert_eq!(shared.len().unwrap(), 0);
        assert!(!cache.is_degraded());
    }

    #[test]
    fn test_store_matches_memory_after_concurrent_churn() {
        let shared = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
        let cache = Arc::new(
            FingerprintCache::with_store(config(3, 1.0), Box::new(Shared(Arc::clone(&shared)))).unwrap(),
        );

        // a small key space forces evicted keys to be re-inserted by other threads
        let handles: Vec<_> = (0..6)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200u32 {
                        cache.set(format!("k{}", (i + t) % 5), i, "");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut resident: Vec<String> = cache.lock().iter().map(|(k, _)| k.clone()).collect();
        let mut stored: Vec<String> = shared.load(100).unwrap().into_iter().map(|row| row.key).collect();
        resident.sort();
        stored.sort();
        assert_eq!(resident.len(), 3);
        assert_eq!(stored, resident);
    }

    #[test]
    fn test_concurrent_sets_respect_capacity() {
        let cache = Arc::new(FingerprintCache::new(config(16, 1.0)).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        cache.set(format!("{}-{}", t, i), i, "");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 16);
        assert_eq!(cache.get_stats().evictions, 800 - 16);
    }
}
