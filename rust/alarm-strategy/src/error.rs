use cache_backend::CacheError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StrategyError>;

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("{component} call failed: {message}")]
    Facade {
        component: &'static str,
        message: String,
    },

    #[error("{component} call timed out")]
    Timeout { component: &'static str },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("refresh failed at {stage}: {source}")]
    Cycle {
        stage: &'static str,
        #[source]
        source: Box<StrategyError>,
    },
}

impl StrategyError {
    pub fn facade(component: &'static str, message: impl ToString) -> Self {
        Self::Facade {
            component,
            message: message.to_string(),
        }
    }

    /// Wraps an error with the refresh stage it aborted.
    pub fn at_stage(self, stage: &'static str) -> Self {
        match self {
            already @ Self::Cycle { .. } => already,
            other => Self::Cycle {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Label used on failure metrics.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Cycle { stage, .. } => *stage,
            Self::Cache(_) => "cache",
            Self::Facade { component, .. } | Self::Timeout { component } => *component,
            Self::Serde(_) => "serde",
            Self::InvalidInput(_) => "input",
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Cache(CacheError::Timeout(_)) | Self::Timeout { .. } | Self::Facade { .. } => true,
            Self::Cycle { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_label_survives_rewrapping() {
        let err = StrategyError::facade("cmdb", "boom").at_stage("load_strategies");
        assert_eq!(err.stage(), "load_strategies");
        let err = err.at_stage("write_views");
        assert_eq!(err.stage(), "load_strategies");
        assert!(err.is_transient());
    }
}
