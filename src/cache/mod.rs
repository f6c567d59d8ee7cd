//! Preference cache module - mutex-guarded TTL cache
//!
//! In-memory cache for preference documents with:
//! - TTL expiration (default 5 minutes, overridable per key)
//! - One mutex per cache instance; no caller observes a half-updated entry
//! - Explicit invalidation, per key and whole-cache
//! - A reactive "last known value" stream fed by every put
//!
//! `get` never performs I/O. A missing or expired entry is always a miss,
//! never a negative answer; the caller owns the fallback load and the
//! subsequent `put`. Entry ages use the tokio clock so tests can pause and
//! advance time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

/// Default time-to-live for cached entries
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// A cached value with its age and lifetime
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    value: T,
    cached_at: Instant,
    ttl: Duration,
}

impl<T> CacheEntry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            cached_at: Instant::now(),
            ttl,
        }
    }

    /// An entry is valid iff it is younger than its TTL
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
    pub entry_count: usize,
}

/// Keyed TTL cache guarded by a single mutex
#[derive(Clone)]
pub struct PreferenceCache<T: Clone + Send + Sync + 'static> {
    entries: Arc<Mutex<HashMap<String, CacheEntry<T>>>>,
    default_ttl: Duration,
    latest_tx: Arc<watch::Sender<Option<T>>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl<T: Clone + Send + Sync + 'static> PreferenceCache<T> {
    pub fn new(default_ttl: Duration) -> Self {
        let (latest_tx, _) = watch::channel(None);
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            default_ttl,
            latest_tx: Arc::new(latest_tx),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Look up a value. Absence and expiry are one unified miss path; an
    /// expired entry is dropped on the spot.
    pub async fn get(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock().await;
        let live = match entries.get(key) {
            Some(entry) if !entry.is_expired() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };
        drop(entries);

        match live {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert with the cache's default TTL and publish to the value stream
    pub async fn put(&self, key: &str, value: T) {
        self.put_with_ttl(key, value, self.default_ttl).await;
    }

    /// Insert with a per-key TTL override
    pub async fn put_with_ttl(&self, key: &str, value: T, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), CacheEntry::new(value.clone(), ttl));
        drop(entries);

        self.latest_tx.send_replace(Some(value));
    }

    /// Drop one entry
    pub async fn invalidate(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }

    /// Drop every entry
    pub async fn invalidate_all(&self) {
        self.entries.lock().await.clear();
    }

    /// Replay-latest stream of the most recently put value. A new subscriber
    /// immediately observes the current value, then every subsequent put.
    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.latest_tx.subscribe()
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let hit_rate = if total_requests > 0 {
            (hits as f64 / total_requests as f64) * 100.0
        } else {
            0.0
        };

        CacheStats {
            hits,
            misses,
            total_requests,
            hit_rate,
            entry_count: self.entries.lock().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get_returns_value() {
        let cache: PreferenceCache<String> = PreferenceCache::new(DEFAULT_TTL);

        cache.put("user-1", "value".to_string()).await;
        assert_eq!(cache.get("user-1").await, Some("value".to_string()));
    }

    #[tokio::test]
    async fn test_absent_key_is_a_miss() {
        let cache: PreferenceCache<String> = PreferenceCache::new(DEFAULT_TTL);
        assert_eq!(cache.get("user-1").await, None);

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache: PreferenceCache<String> = PreferenceCache::new(DEFAULT_TTL);
        cache.put("user-1", "value".to_string()).await;

        tokio::time::advance(DEFAULT_TTL - Duration::from_secs(1)).await;
        assert!(cache.get("user-1").await.is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("user-1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_key_ttl_override() {
        let cache: PreferenceCache<String> = PreferenceCache::new(DEFAULT_TTL);
        cache
            .put_with_ttl("short", "a".to_string(), Duration::from_secs(1))
            .await;
        cache.put("long", "b".to_string()).await;

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("short").await.is_none());
        assert!(cache.get("long").await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_drops_entry() {
        let cache: PreferenceCache<String> = PreferenceCache::new(DEFAULT_TTL);
        cache.put("user-1", "value".to_string()).await;

        cache.invalidate("user-1").await;
        assert!(cache.get("user-1").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let cache: PreferenceCache<String> = PreferenceCache::new(DEFAULT_TTL);
        cache.put("a", "1".to_string()).await;
        cache.put("b", "2".to_string()).await;

        cache.invalidate_all().await;
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_none());
    }

    #[tokio::test]
    async fn test_get_after_put_until_invalidated() {
        // put -> get -> put -> get -> invalidate -> get, one coherence run
        let cache: PreferenceCache<u32> = PreferenceCache::new(DEFAULT_TTL);
        cache.put("k", 1).await;
        assert_eq!(cache.get("k").await, Some(1));
        cache.put("k", 2).await;
        assert_eq!(cache.get("k").await, Some(2));
        cache.invalidate("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_subscribe_replays_latest_value() {
        let cache: PreferenceCache<String> = PreferenceCache::new(DEFAULT_TTL);
        cache.put("user-1", "first".to_string()).await;

        // A subscriber attached after the put still sees the current value
        let rx = cache.subscribe();
        assert_eq!(rx.borrow().clone(), Some("first".to_string()));

        cache.put("user-1", "second".to_string()).await;
        assert_eq!(rx.borrow().clone(), Some("second".to_string()));
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let cache: PreferenceCache<String> = PreferenceCache::new(DEFAULT_TTL);
        cache.put("user-1", "value".to_string()).await;

        cache.get("user-1").await;
        cache.get("missing").await;

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.hit_rate, 50.0);
        assert_eq!(stats.entry_count, 1);
    }
}
