//! Seen-object cache and bucket bootstrap tracking.
//!
//! The seen-object cache is advisory: a hit lets the upload path skip a
//! HEAD and an upload, but correctness always rests on digest comparison
//! when the cache misses. The bootstrap set never expires.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use ttl_cache::TtlCache;

use regmirror_core::config::ObjectCacheSettings;

/// Bounded TTL cache of `(bucket, key)` pairs confirmed present.
///
/// Entries are inserted only after an authoritative confirmation: a
/// successful upload, or a HEAD whose stored digest matched.
#[derive(Clone)]
pub struct ObjectCache {
    enabled: bool,
    ttl: Duration,
    capacity: usize,
    inner: Arc<RwLock<TtlCache<String, bool>>>,
}

impl ObjectCache {
    pub fn new(settings: &ObjectCacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            ttl: settings.expiration_time,
            capacity: settings.capacity,
            inner: Arc::new(RwLock::new(TtlCache::new(settings.capacity))),
        }
    }

    fn cache_key(bucket: &str, key: &str) -> String {
        format!("{}/{}", bucket, key)
    }

    /// True when the object was recently confirmed present.
    pub fn has(&self, bucket: &str, key: &str) -> bool {
        if !self.enabled {
            return false;
        }
        self.inner
            .read()
            .expect("object cache lock poisoned")
            .get(&Self::cache_key(bucket, key))
            .copied()
            .unwrap_or(false)
    }

    /// Record an authoritative confirmation of the object.
    pub fn mark(&self, bucket: &str, key: &str) {
        if !self.enabled {
            return;
        }
        self.inner
            .write()
            .expect("object cache lock poisoned")
            .insert(Self::cache_key(bucket, key), true, self.ttl);
    }

    /// Drop the entry for a deleted object.
    pub fn invalidate(&self, bucket: &str, key: &str) {
        if !self.enabled {
            return;
        }
        let removed = self
            .inner
            .write()
            .expect("object cache lock poisoned")
            .remove(&Self::cache_key(bucket, key));
        if removed.is_some() {
            tracing::debug!(bucket, key, "Evicted object from cache");
        }
    }

    /// Clear everything. Test hook.
    pub fn reset(&self) {
        let mut inner = self.inner.write().expect("object cache lock poisoned");
        *inner = TtlCache::new(self.capacity);
    }
}

/// Non-expiring set of buckets whose `v2` sentinel has been written.
///
/// Keyed by `(endpoint, bucket)` so two providers sharing a bucket name
/// stay distinct.
#[derive(Clone, Default)]
pub struct BucketInitSet {
    inner: Arc<Mutex<HashSet<(String, String)>>>,
}

impl BucketInitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, endpoint: &str, bucket: &str) -> bool {
        self.inner
            .lock()
            .expect("bucket init lock poisoned")
            .contains(&(endpoint.to_string(), bucket.to_string()))
    }

    pub fn mark(&self, endpoint: &str, bucket: &str) {
        self.inner
            .lock()
            .expect("bucket init lock poisoned")
            .insert((endpoint.to_string(), bucket.to_string()));
    }

    /// Clear everything. Test hook.
    pub fn reset(&self) {
        self.inner.lock().expect("bucket init lock poisoned").clear();
    }
}
