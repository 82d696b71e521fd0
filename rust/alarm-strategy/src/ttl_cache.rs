use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Upper bound for in-process read-through caches.
pub const MAX_TTL: Duration = Duration::from_secs(600);

/// Read-through cache with per-entry expiry, safe for concurrent readers.
/// Expired entries are swept on insert at most once per `ttl`.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<Entries<K, V>>,
}

#[derive(Debug)]
struct Entries<K, V> {
    map: HashMap<K, (Instant, V)>,
    swept_at: Instant,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: ttl.min(MAX_TTL),
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                swept_at: Instant::now(),
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        let expired = match entries.map.get(key) {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => return Some(value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.map.remove(key);
        }
        None
    }

    pub fn insert(&self, key: K, value: V) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if now.duration_since(entries.swept_at) >= self.ttl {
            let ttl = self.ttl;
            entries.map.retain(|_, (stored_at, _)| now.duration_since(*stored_at) < ttl);
            entries.swept_at = now;
        }
        entries.map.insert(key, (now, value));
    }

    /// Returns the cached value or loads, stores and returns a fresh one.
    /// The lock is not held while `load` runs.
    pub async fn get_or_load<F, Fut, E>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = load().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn loads_once_within_ttl() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value = cache
                .get_or_load("k", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(7)
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_reload() {
        let cache: TtlCache<u8, u8> = TtlCache::new(Duration::from_millis(10));
        cache.insert(1, 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get(&1), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn unread_expired_entries_are_swept_on_insert() {
        let cache: TtlCache<u8, u8> = TtlCache::new(Duration::from_millis(10));
        cache.insert(1, 1);
        cache.insert(2, 2);
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.insert(3, 3);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&3), Some(3));
    }

    #[test]
    fn ttl_is_clamped() {
        let cache: TtlCache<u8, u8> = TtlCache::new(Duration::from_secs(3600));
        assert_eq!(cache.ttl, MAX_TTL);
    }
}
