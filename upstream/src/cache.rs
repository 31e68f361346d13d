// Bounded TTL cache shared by the chapter and directory stores. Entries past
// their time-to-live are never returned; capacity overflow evicts the least
// recently used entries.
use crate::metrics_defs::MetricDef;
use moka::sync::Cache;
use std::time::Duration;

pub struct TimedCache<V: Clone + Send + Sync + 'static> {
    cache: Cache<String, V>,
    hit: MetricDef,
    miss: MetricDef,
}

impl<V: Clone + Send + Sync + 'static> TimedCache<V> {
    pub fn new(max_entries: u64, ttl_ms: u64, hit: MetricDef, miss: MetricDef) -> Self {
        let mut builder = Cache::builder().max_capacity(max_entries.max(1));
        if ttl_ms > 0 {
            builder = builder.time_to_live(Duration::from_millis(ttl_ms));
        }
        TimedCache {
            cache: builder.build(),
            hit,
            miss,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let value = self.cache.get(key);
        let metric_def = if value.is_some() { self.hit } else { self.miss };
        metrics::counter!(metric_def.name).increment(1);
        value
    }

    pub fn insert(&self, key: String, value: V) {
        self.cache.insert(key, value);
    }

    /// Entry count after flushing pending maintenance; test and debug use.
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_defs::{CHAPTER_CACHE_HIT, CHAPTER_CACHE_MISS};

    fn cache(max: u64, ttl_ms: u64) -> TimedCache<String> {
        TimedCache::new(max, ttl_ms, CHAPTER_CACHE_HIT, CHAPTER_CACHE_MISS)
    }

    #[test]
    fn test_get_and_insert() {
        let cache = cache(10, 60_000);
        assert_eq!(cache.get("k"), None);
        cache.insert("k".into(), "v".into());
        assert_eq!(cache.get("k"), Some("v".into()));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = cache(10, 30);
        cache.insert("k".into(), "v".into());
        assert_eq!(cache.get("k"), Some("v".into()));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_capacity_bound() {
        let cache = cache(4, 0);
        for i in 0..32 {
            cache.insert(format!("k{i}"), "v".into());
        }
        assert!(cache.len() <= 4);
    }
}
