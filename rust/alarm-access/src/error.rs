use alarm_strategy::StrategyError;
use cache_backend::CacheError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AccessError>;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error("data source query failed: {0}")]
    DataSource(String),

    #[error("batch shard error: {0}")]
    Batch(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("group {group} is being processed elsewhere")]
    Locked { group: String },
}

impl AccessError {
    pub fn data_source(message: impl ToString) -> Self {
        Self::DataSource(message.to_string())
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}
