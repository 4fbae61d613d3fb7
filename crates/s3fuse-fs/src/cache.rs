use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Condvar, Mutex};

use lru::LruCache;
use tracing::debug;

use s3fuse_base::error::{Error, Result};

use crate::object::Object;

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that went to the store.
    pub misses: u64,
    /// Entries found but past their expiry.
    pub expiries: u64,
}

/// One outstanding fetch; waiters block here and share the leader's result.
struct Flight {
    result: Mutex<Option<std::result::Result<Arc<Object>, i32>>>,
    cond: Condvar,
}

impl Flight {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn complete(&self, result: std::result::Result<Arc<Object>, i32>) {
        let mut slot = self.result.lock().unwrap();
        *slot = Some(result);
        self.cond.notify_all();
    }

    fn wait(&self) -> std::result::Result<Arc<Object>, i32> {
        let mut slot = self.result.lock().unwrap();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self.cond.wait(slot).unwrap();
        }
    }
}

struct CacheInner {
    map: LruCache<String, Arc<Object>>,
    in_flight: HashMap<String, Arc<Flight>>,
    stats: CacheStats,
}

/// Path → object map with per-object TTL, bounded capacity, and
/// single-flight fetch coalescing.
pub struct ObjectCache {
    inner: Mutex<CacheInner>,
}

impl ObjectCache {
    /// Builds a cache holding up to `capacity` objects.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(CacheInner {
                map: LruCache::new(capacity),
                in_flight: HashMap::new(),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Returns the cached object for `path`, fetching it with `fetch` when
    /// absent or expired.
    ///
    /// Concurrent lookups of the same path coalesce: one caller runs the
    /// fetch, the rest wait and share its result (errors included).
    pub fn get(
        &self,
        path: &str,
        fetch: impl FnOnce() -> Result<Arc<Object>>,
    ) -> Result<Arc<Object>> {
        let flight = {
            let mut inner = self.inner.lock().unwrap();

            let cached = inner.map.get(path).cloned();
            if let Some(obj) = cached {
                if obj.is_valid() {
                    inner.stats.hits += 1;
                    return Ok(obj);
                }
                inner.stats.expiries += 1;
                inner.map.pop(path);
            }
            inner.stats.misses += 1;

            if let Some(flight) = inner.in_flight.get(path) {
                // someone else is already asking the store
                let flight = flight.clone();
                drop(inner);
                return flight.wait().map_err(Error::from_errno);
            }

            let flight = Flight::new();
            inner.in_flight.insert(path.to_string(), flight.clone());
            flight
        };

        // no lock held across the fetch
        let result = fetch();

        let mut inner = self.inner.lock().unwrap();
        inner.in_flight.remove(path);
        match &result {
            Ok(obj) => {
                inner.map.put(path.to_string(), obj.clone());
                flight.complete(Ok(obj.clone()));
            }
            Err(e) => {
                debug!(path, error = %e, "fetch failed");
                flight.complete(Err(e.to_errno()));
            }
        }

        result
    }

    /// Inserts (or replaces) an entry.
    pub fn insert(&self, obj: Arc<Object>) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.put(obj.path().to_string(), obj);
    }

    /// Drops the entry for `path` and expires the object, so holders of a
    /// stale reference refetch on their next lookup.
    pub fn remove(&self, path: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(obj) = inner.map.pop(path) {
            obj.expire();
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::object::ObjectType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn remote_object(path: &str) -> Arc<Object> {
        let obj = Object::create(test_context(), path, ObjectType::File, None).unwrap();
        obj.refresh_expiry();
        obj
    }

    #[test]
    fn test_hit_skips_fetch() {
        let cache = ObjectCache::new(10);
        let obj = remote_object("a");
        cache.insert(obj.clone());

        let got = cache
            .get("a", || panic!("fetch must not run on a hit"))
            .unwrap();
        assert!(Arc::ptr_eq(&got, &obj));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_miss_fetches_and_caches() {
        let cache = ObjectCache::new(10);
        let calls = AtomicUsize::new(0);

        let got = cache
            .get("a", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(remote_object("a"))
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let again = cache.get("a", || panic!("second lookup must hit")).unwrap();
        assert!(Arc::ptr_eq(&got, &again));
    }

    #[test]
    fn test_expired_entry_refetches() {
        let cache = ObjectCache::new(10);
        let obj = remote_object("a");
        cache.insert(obj.clone());
        obj.expire();

        let fresh = remote_object("a");
        let fresh2 = fresh.clone();
        let got = cache.get("a", move || Ok(fresh2)).unwrap();
        assert!(Arc::ptr_eq(&got, &fresh));
        assert_eq!(cache.stats().expiries, 1);
    }

    #[test]
    fn test_remove_expires_shared_references() {
        let cache = ObjectCache::new(10);
        let obj = remote_object("a");
        cache.insert(obj.clone());

        cache.remove("a");
        assert!(!obj.is_valid());
    }

    #[test]
    fn test_fetch_errors_propagate() {
        let cache = ObjectCache::new(10);
        let result = cache.get("a", || Err(Error::NotFound));
        assert!(matches!(result, Err(Error::NotFound)));

        // the error was not cached
        let got = cache.get("a", || Ok(remote_object("a")));
        assert!(got.is_ok());
    }

    #[test]
    fn test_concurrent_lookups_coalesce() {
        let cache = Arc::new(ObjectCache::new(10));
        let fetches = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let fetches = fetches.clone();
                std::thread::spawn(move || {
                    cache
                        .get("a", || {
                            fetches.fetch_add(1, Ordering::SeqCst);
                            // hold the flight open long enough for the other
                            // threads to pile up behind it
                            std::thread::sleep(Duration::from_millis(50));
                            Ok(remote_object("a"))
                        })
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        for obj in &results[1..] {
            assert!(Arc::ptr_eq(obj, &results[0]));
        }
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache = ObjectCache::new(2);
        cache.insert(remote_object("a"));
        cache.insert(remote_object("b"));
        cache.insert(remote_object("c"));

        // "a" was evicted; a lookup must fetch
        let refetched = AtomicUsize::new(0);
        cache
            .get("a", || {
                refetched.fetch_add(1, Ordering::SeqCst);
                Ok(remote_object("a"))
            })
            .unwrap();
        assert_eq!(refetched.load(Ordering::SeqCst), 1);
    }
}
