use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("cache call timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation against a key holding the wrong kind of value: {0}")]
    WrongType(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
