use crate::error::{AccessError, Result};
use crate::keys;
use cache_backend::CacheBackend;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Cross-process lock held while a group is processed.
pub struct GroupLock {
    cache: Arc<dyn CacheBackend>,
    key: String,
    token: String,
}

impl GroupLock {
    /// Takes the lock or fails with [`AccessError::Locked`].
    pub async fn acquire(cache: Arc<dyn CacheBackend>, group: &str, ttl: Duration) -> Result<Self> {
        let key = keys::lock(group);
        let token = uuid::Uuid::new_v4().to_string();
        if !cache.set_nx(&key, &token, ttl).await? {
            return Err(AccessError::Locked {
                group: group.to_string(),
            });
        }
        Ok(Self { cache, key, token })
    }

    /// Releases the lock if this holder still owns it.
    pub async fn release(self) {
        match self.cache.get(&self.key).await {
            Ok(Some(current)) if current == self.token => {
                if let Err(err) = self.cache.delete(&[self.key.clone()]).await {
                    warn!(key = %self.key, error = %err, "failed to release group lock");
                }
            }
            Ok(_) => warn!(key = %self.key, "group lock expired before release"),
            Err(err) => warn!(key = %self.key, error = %err, "failed to read group lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_backend::MemoryCache;

    #[tokio::test]
    async fn one_holder_at_a_time() {
        let cache: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new());
        let ttl = Duration::from_secs(60);
        let held = GroupLock::acquire(cache.clone(), "g", ttl).await.unwrap();
        let err = GroupLock::acquire(cache.clone(), "g", ttl).await.err().unwrap();
        assert!(err.is_locked());

        held.release().await;
        assert!(GroupLock::acquire(cache, "g", ttl).await.is_ok());
    }
}
