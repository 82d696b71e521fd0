//! Key-value cache contract shared by the strategy cache manager and the
//! access pipeline.
//!
//! Every component talks to the cache through [`CacheBackend`], so the same
//! code runs against Redis in production and against [`MemoryCache`] in
//! tests and single-process deployments.

mod error;
mod memory;
mod pipeline;
#[cfg(feature = "redis")]
mod redis_backend;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use error::{CacheError, Result};
pub use memory::MemoryCache;
pub use pipeline::{Command, Pipeline};
#[cfg(feature = "redis")]
pub use redis_backend::RedisCache;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Sets `key` only when it does not exist yet. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    async fn delete(&self, keys: &[String]) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hmset(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64>;

    async fn hkeys(&self, key: &str) -> Result<Vec<String>>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64>;

    async fn rpop(&self, key: &str) -> Result<Option<String>>;

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    async fn llen(&self, key: &str) -> Result<u64>;

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()>;

    async fn zadd(&self, key: &str, members: &[(f64, String)]) -> Result<u64>;

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    /// Runs every queued command in order as one batch.
    async fn execute(&self, pipeline: Pipeline) -> Result<()>;
}

/// Reads `key` and decodes it as JSON. A missing key reads as `None`.
pub async fn get_json<T>(cache: &dyn CacheBackend, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
{
    match cache.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn set_json<T>(
    cache: &dyn CacheBackend,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let raw = serde_json::to_string(value)?;
    cache.set(key, &raw, ttl).await
}
