use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Short-lived in-memory cache in front of repeated reads.
///
/// Advisory only: a miss always falls through to the filesystem, and nothing in
/// here is authoritative.
#[derive(Clone)]
pub struct ResponseCache<K, V> {
    inner: Arc<RwLock<HashMap<K, Entry<V>>>>,
    ttl: Duration,
}

impl<K, V> ResponseCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let guard = self.inner.read();
        let entry = guard.get(key)?;
        (entry.expires_at > now).then(|| entry.value.clone())
    }

    pub fn put(&self, key: K, value: V) {
        if self.ttl.is_zero() {
            return;
        }
        let expires_at = Instant::now() + self.ttl;
        self.inner.write().insert(key, Entry { value, expires_at });
    }

    pub fn remove(&self, key: &K) {
        self.inner.write().remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired entries, returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_at(Instant::now())
    }

    fn purge_at(&self, now: Instant) -> usize {
        let mut guard = self.inner.write();
        let before = guard.len();
        guard.retain(|_, entry| entry.expires_at > now);
        before - guard.len()
    }

    /// Start the background cleanup task
    pub fn start_cleanup_task(&self, period: Duration) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let removed = cache.purge_expired();
                trace!(removed, "Response cache purged");
            }
        });
    }
}
