//! Bounded LRU+TTL map shared by the CSRF cache and the rate limiter.
//!
//! Entries expire after the TTL; at capacity the least-recently-used entry
//! is evicted and a capacity-pressure warning is logged. One structure,
//! used everywhere an in-memory map would otherwise grow without bound.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

struct Entry<V> {
    value: V,
    expires_at: Instant,
    last_used: Instant,
}

/// Bounded map with TTL expiry and LRU eviction.
pub struct TtlCache<K, V> {
    name: &'static str,
    capacity: usize,
    ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    /// Create a cache. `name` tags the capacity-pressure log line.
    pub fn new(name: &'static str, capacity: usize, ttl: Duration) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a value, evicting the LRU entry when at capacity.
    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let now = Instant::now();

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            if let Some(lru) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&lru);
                warn!(
                    cache = self.name,
                    capacity = self.capacity,
                    "Cache at capacity, evicted LRU entry"
                );
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
                last_used: now,
            },
        );
    }

    /// Non-mutating lookup: the entry stays in place and its LRU position
    /// is untouched. Returns the value even when expired, paired with the
    /// expiry flag, so callers can distinguish "expired" from "absent".
    pub fn peek(&self, key: &K) -> Option<(V, bool)> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries
            .get(key)
            .map(|e| (e.value.clone(), e.expires_at <= Instant::now()))
    }

    /// Remove and return a live entry. Expired entries are removed but
    /// reported as absent.
    pub fn take(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let entry = entries.remove(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value)
    }

    /// Read a live entry and refresh its LRU position.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(e) if e.expires_at > now => {
                e.last_used = now;
                Some(e.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Mutate (or initialize) the live entry under the lock and return the
    /// result of the closure. Used by the rate limiter for its
    /// check-and-count update.
    pub fn update<R>(&self, key: K, init: V, f: impl FnOnce(&mut V) -> R) -> R {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let now = Instant::now();

        let needs_reset = match entries.get(&key) {
            Some(e) => e.expires_at <= now,
            None => true,
        };
        if needs_reset {
            if entries.len() >= self.capacity && !entries.contains_key(&key) {
                if let Some(lru) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&lru);
                    warn!(
                        cache = self.name,
                        capacity = self.capacity,
                        "Cache at capacity, evicted LRU entry"
                    );
                }
            }
            entries.insert(
                key.clone(),
                Entry {
                    value: init,
                    expires_at: now + self.ttl,
                    last_used: now,
                },
            );
        }

        let entry = entries.get_mut(&key).expect("entry just ensured");
        entry.last_used = now;
        f(&mut entry.value)
    }

    /// Drop every expired entry. Returns the number removed. Called by the
    /// periodic cleanup job.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    /// Current entry count.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_take() {
        let cache: TtlCache<String, u32> =
            TtlCache::new("test", 8, Duration::from_secs(60));
        cache.insert("a".into(), 1);
        assert_eq!(cache.get(&"a".into()), Some(1));
        assert_eq!(cache.take(&"a".into()), Some(1));
        assert_eq!(cache.get(&"a".into()), None);
    }

    #[test]
    fn peek_does_not_consume() {
        let cache: TtlCache<String, u32> =
            TtlCache::new("test", 8, Duration::from_secs(60));
        cache.insert("a".into(), 1);
        assert_eq!(cache.peek(&"a".into()), Some((1, false)));
        assert_eq!(cache.peek(&"a".into()), Some((1, false)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expired_entry_peeks_as_expired_and_takes_as_absent() {
        let cache: TtlCache<String, u32> = TtlCache::new("test", 8, Duration::ZERO);
        cache.insert("a".into(), 1);
        assert_eq!(cache.peek(&"a".into()), Some((1, true)));
        assert_eq!(cache.take(&"a".into()), None);
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache: TtlCache<String, u32> =
            TtlCache::new("test", 2, Duration::from_secs(60));
        cache.insert("a".into(), 1);
        std::thread::sleep(Duration::from_millis(5));
        cache.insert("b".into(), 2);
        std::thread::sleep(Duration::from_millis(5));
        // Touch "a" so "b" becomes LRU.
        cache.get(&"a".into());
        cache.insert("c".into(), 3);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&"a".into()).is_some());
        assert!(cache.get(&"b".into()).is_none());
        assert!(cache.get(&"c".into()).is_some());
    }

    #[test]
    fn purge_removes_expired() {
        let cache: TtlCache<String, u32> = TtlCache::new("test", 8, Duration::ZERO);
        cache.insert("a".into(), 1);
        cache.insert("b".into(), 2);
        assert_eq!(cache.purge_expired(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn update_counts_within_window() {
        let cache: TtlCache<String, u32> =
            TtlCache::new("test", 8, Duration::from_secs(60));
        let n = cache.update("ip".into(), 0, |c| {
            *c += 1;
            *c
        });
        assert_eq!(n, 1);
        let n = cache.update("ip".into(), 0, |c| {
            *c += 1;
            *c
        });
        assert_eq!(n, 2);
    }
}
