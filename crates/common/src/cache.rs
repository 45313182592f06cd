//! Time-windowed result caching
//!
//! Probes and window-manager reads are expensive external commands, so
//! their results are memoized for a few seconds. Concurrent readers may
//! race to refresh the same key; the underlying operations are
//! idempotent, so a duplicate refresh wastes a probe but is harmless.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// Map of cached values that expire after a fixed TTL.
///
/// Expired entries are not removed on read; a periodic `sweep` purges
/// them so abandoned keys do not accumulate.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached value if it is younger than the TTL.
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .map(|e| e.value.clone())
    }

    /// Store a value with the current timestamp.
    pub fn put(&self, key: K, value: V) {
        self.entries.lock().insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop one key regardless of age.
    pub fn invalidate(&self, key: &K) {
        self.entries.lock().remove(key);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Remove expired entries. Called from a periodic task.
    pub fn sweep(&self) {
        let ttl = self.ttl;
        self.entries
            .lock()
            .retain(|_, e| e.stored_at.elapsed() < ttl);
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_fresh_entry_is_returned() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(10));
        cache.put("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn test_expired_entry_is_hidden_but_not_removed() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(20));
        cache.put("a", 1);
        sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&"a"), None);
        // Still present until a sweep runs
        assert_eq!(cache.len(), 1);
        cache.sweep();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_get_or_refresh_pattern_probes_once_within_ttl() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(10));
        let mut probes = 0;

        let mut fetch = |key| {
            cache.get(&key).unwrap_or_else(|| {
                probes += 1;
                cache.put(key, 42);
                42
            })
        };

        assert_eq!(fetch("a"), 42);
        assert_eq!(fetch("a"), 42);
        assert_eq!(probes, 1);
    }

    #[test]
    fn test_refresh_after_expiry_probes_exactly_once() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(20));
        cache.put("a", 1);
        sleep(Duration::from_millis(40));

        let mut probes = 0;
        for _ in 0..3 {
            if cache.get(&"a").is_none() && probes == 0 {
                probes += 1;
                cache.put("a", 2);
            }
        }
        assert_eq!(probes, 1);
        assert_eq!(cache.get(&"a"), Some(2));
    }

    #[test]
    fn test_invalidate() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(10));
        cache.put("a", 1);
        cache.invalidate(&"a");
        assert_eq!(cache.get(&"a"), None);
    }
}
