//! Bounded, time-expiring in-memory cache.
//!
//! [`TtlCache`] holds at most `capacity` entries and treats any entry older
//! than its TTL as absent. Expiry is checked lazily on access; there is no
//! background sweeper. When a write would exceed capacity, the
//! least-recently-used entry is evicted.
//!
//! The cache synchronizes internally, so it can be shared between tasks
//! behind an [`Arc`](std::sync::Arc) without any external locking. A write
//! is visible to every `get` that starts after it returns.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

/// A stored value with the instant it was written.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

impl<V> CacheEntry<V> {
    /// An entry is expired once strictly more than `ttl` has passed since it
    /// was written.
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.inserted_at) > ttl
    }
}

/// Point-in-time counters for a [`TtlCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently stored, including expired ones not yet purged.
    pub entries: usize,
    /// Maximum number of entries.
    pub capacity: usize,
    /// Reads that returned a live entry.
    pub hits: u64,
    /// Reads that found nothing or an expired entry.
    pub misses: u64,
    /// Entries dropped because their TTL had elapsed.
    pub expirations: u64,
    /// Entries dropped to make room for a new key.
    pub evictions: u64,
}

struct Inner<K, V> {
    map: LruCache<K, CacheEntry<V>>,
    hits: u64,
    misses: u64,
    expirations: u64,
    evictions: u64,
}

/// A thread-safe LRU cache whose entries expire a fixed time after being written.
///
/// # Examples
///
/// ```
/// use std::num::NonZeroUsize;
/// use std::time::Duration;
/// use dogpile::cache::TtlCache;
///
/// let cache = TtlCache::new(NonZeroUsize::new(2).unwrap(), Duration::from_secs(60));
/// cache.put(1_i64, true);
/// cache.put(2_i64, true);
/// assert_eq!(cache.get(&1), Some(true));
///
/// // Key 2 is now least recently used and gives way to key 3.
/// cache.put(3_i64, true);
/// assert_eq!(cache.get(&2), None);
/// assert_eq!(cache.len(), 2);
/// ```
pub struct TtlCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    /// Creates a cache that reads time from [`SystemClock`].
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self::with_clock(capacity, ttl, Arc::new(SystemClock))
    }

    /// Creates a cache that reads time from `clock`.
    pub fn with_clock(capacity: NonZeroUsize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                expirations: 0,
                evictions: 0,
            }),
            ttl,
            clock,
        }
    }

    /// Returns the value for `key` if it is present and has not expired.
    ///
    /// A hit marks the entry as most recently used. An expired entry is
    /// removed and reported as a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let found = inner
            .map
            .get(key)
            .map(|entry| (entry.is_expired(now, self.ttl), entry.value.clone()));

        match found {
            Some((false, value)) => {
                inner.hits += 1;
                Some(value)
            }
            Some((true, _)) => {
                inner.map.pop(key);
                inner.expirations += 1;
                inner.misses += 1;
                trace!("dropped expired cache entry on read");
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Stores `value` under `key`, replacing any previous entry and
    /// restarting its TTL.
    pub fn put(&self, key: K, value: V) {
        let entry = CacheEntry {
            value,
            inserted_at: self.clock.now(),
        };
        let mut inner = self.inner.lock();

        // `push` hands back either the replaced entry for this key or the
        // evicted least-recently-used one.
        let displaced = inner.map.push(key, entry);
        if let Some((old_key, _)) = displaced {
            if !inner.map.contains(&old_key) {
                inner.evictions += 1;
                trace!("evicted least-recently-used cache entry");
            }
        }
    }

    /// Removes `key`, returning its value if it was present and live.
    pub fn remove(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let entry = self.inner.lock().map.pop(key)?;
        (!entry.is_expired(now, self.ttl)).then_some(entry.value)
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.inner.lock().map.clear();
    }

    /// Removes all expired entries and returns how many were dropped.
    pub fn purge_expired(&self) -> usize
    where
        K: Clone,
    {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let expired: Vec<K> = inner
            .map
            .iter()
            .filter(|(_, entry)| entry.is_expired(now, self.ttl))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.map.pop(key);
        }
        inner.expirations += expired.len() as u64;
        expired.len()
    }

    /// Returns the number of stored entries, including expired entries that
    /// have not been touched since they expired.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    /// Returns the maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.inner.lock().map.cap().get()
    }

    /// Returns the time-to-live applied to every entry.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns a snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.map.len(),
            capacity: inner.map.cap().get(),
            hits: inner.hits,
            misses: inner.misses,
            expirations: inner.expirations,
            evictions: inner.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_clock(
        capacity: usize,
        ttl: Duration,
    ) -> (TtlCache<i64, bool>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cache = TtlCache::with_clock(
            NonZeroUsize::new(capacity).unwrap(),
            ttl,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        (cache, clock)
    }

    #[test]
    fn get_after_put() {
        let (cache, _) = cache_with_clock(8, Duration::from_secs(60));
        cache.put(42, true);
        assert_eq!(cache.get(&42), Some(true));
    }

    #[test]
    fn miss_on_empty() {
        let (cache, _) = cache_with_clock(8, Duration::from_secs(60));
        assert_eq!(cache.get(&42), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn put_overwrites() {
        let (cache, _) = cache_with_clock(8, Duration::from_secs(60));
        cache.put(1, false);
        cache.put(1, true);
        assert_eq!(cache.get(&1), Some(true));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn entry_expires_after_ttl() {
        let (cache, clock) = cache_with_clock(8, Duration::from_secs(10));
        cache.put(7, true);

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.get(&7), Some(true)); // exactly at the TTL is still live

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get(&7), None);
        assert!(cache.is_empty()); // purged on read
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn put_restarts_ttl() {
        let (cache, clock) = cache_with_clock(8, Duration::from_secs(10));
        cache.put(7, true);
        clock.advance(Duration::from_secs(8));
        cache.put(7, true);
        clock.advance(Duration::from_secs(8));
        assert_eq!(cache.get(&7), Some(true));
    }

    #[test]
    fn evicts_least_recently_used() {
        let (cache, _) = cache_with_clock(2, Duration::from_secs(60));
        cache.put(1, true);
        cache.put(2, true);

        // Touch 1 so that 2 becomes the eviction candidate.
        assert!(cache.get(&1).is_some());
        cache.put(3, true);

        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(true));
        assert_eq!(cache.get(&3), Some(true));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn overwrite_is_not_an_eviction() {
        let (cache, _) = cache_with_clock(2, Duration::from_secs(60));
        cache.put(1, true);
        cache.put(1, true);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn purge_expired_drops_only_stale_entries() {
        let (cache, clock) = cache_with_clock(8, Duration::from_secs(10));
        cache.put(1, true);
        clock.advance(Duration::from_secs(6));
        cache.put(2, true);
        clock.advance(Duration::from_secs(6));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&2), Some(true));
    }

    #[test]
    fn remove_and_clear() {
        let (cache, _) = cache_with_clock(8, Duration::from_secs(60));
        cache.put(1, true);
        cache.put(2, true);
        assert_eq!(cache.remove(&1), Some(true));
        assert_eq!(cache.remove(&1), None);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let (cache, _) = cache_with_clock(4, Duration::from_secs(60));
        cache.put(1, true);
        let _ = cache.get(&1);
        let _ = cache.get(&1);
        let _ = cache.get(&2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.capacity, 4);
        assert_eq!(cache.capacity(), 4);
        assert_eq!(cache.ttl(), Duration::from_secs(60));
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let (cache, _) = cache_with_clock(1024, Duration::from_secs(60));
        let cache = Arc::new(cache);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        cache.put(t * 100 + i, true);
                        assert_eq!(cache.get(&(t * 100 + i)), Some(true));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 800);
    }
}
