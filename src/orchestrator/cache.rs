use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

/// Size-bounded LRU whose entries also expire a fixed time after insertion.
pub struct LruTtlCache<K: Hash + Eq, V> {
    ttl: Duration,
    entries: LruCache<K, (V, Instant)>,
}

impl<K, V> LruTtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: LruCache::new(capacity),
        }
    }

    /// Cached value, refreshing its recency. Expired entries are dropped.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let (value, expires_at) = self
            .entries
            .get(key)
            .map(|(value, expires_at)| (value.clone(), *expires_at))?;
        if expires_at <= Instant::now() {
            self.entries.pop(key);
            return None;
        }
        Some(value)
    }

    /// When full, expired entries make room before the least recently used
    /// one is evicted.
    pub fn insert(&mut self, key: K, value: V) {
        let now = Instant::now();
        if !self.entries.contains(&key) && self.entries.len() >= self.entries.cap().get() {
            self.purge_expired(now);
        }
        self.entries.put(key, (value, now + self.ttl));
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, (_, expires_at))| *expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.entries.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn evicts_least_recently_used() {
        let mut cache = LruTtlCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_after_ttl() {
        let mut cache = LruTtlCache::new(10, Duration::from_secs(300));
        cache.insert("asset", "https://cdn.example/asset.png");

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get(&"asset"), Some("https://cdn.example/asset.png"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&"asset"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_prefers_dropping_expired_entries() {
        let mut cache = LruTtlCache::new(2, Duration::from_secs(10));
        cache.insert(1, "old");
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.insert(2, "fresh");
        assert_eq!(cache.get(&2), Some("fresh"));
        cache.insert(3, "newest");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&2), Some("fresh"));
    }
}
