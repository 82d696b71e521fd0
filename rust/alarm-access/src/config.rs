use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Runtime settings of the access stage.
#[derive(Debug, Clone)]
pub struct AccessConfig {
    /// Records older than this are dropped before filtering.
    pub expire: Duration,
    /// Lag kept behind `now` so the last aggregation bucket is complete.
    pub time_delay: Duration,
    /// Extra intervals re-read before the checkpoint to absorb late data.
    pub window_count: i64,
    pub detect_merge_enabled: bool,
    /// Strategies allowed on the fused path. Empty means all.
    pub detect_merge_strategy_ids: Vec<i64>,
    /// Point count above which a pull is sharded. Zero disables sharding.
    pub batch_threshold: usize,
    pub batch_size: usize,
    pub batch_wait: Duration,
    /// Distinct timestamps handled per time-series pull; later ones wait for
    /// the next pull. Zero means no limit.
    pub max_time_points: usize,
    pub host_disable_states: Vec<String>,
    pub duplicate_ttl: Duration,
    pub data_list_ttl: Duration,
    pub max_queue_length: u64,
    pub lock_ttl: Duration,
    pub workers: usize,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            expire: Duration::from_secs(default_expire_secs()),
            time_delay: Duration::from_secs(default_time_delay_secs()),
            window_count: default_window_count(),
            detect_merge_enabled: false,
            detect_merge_strategy_ids: Vec::new(),
            batch_threshold: default_batch_threshold(),
            batch_size: default_batch_size(),
            batch_wait: Duration::from_secs(default_batch_wait_secs()),
            max_time_points: 0,
            host_disable_states: parse_csv(DEFAULT_HOST_DISABLE_STATES),
            duplicate_ttl: Duration::from_secs(default_duplicate_ttl_secs()),
            data_list_ttl: Duration::from_secs(default_data_list_ttl_secs()),
            max_queue_length: default_max_queue_length(),
            lock_ttl: Duration::from_secs(default_lock_ttl_secs()),
            workers: default_workers(),
        }
    }
}

const DEFAULT_HOST_DISABLE_STATES: &str = "备用机,测试中,故障中";

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_expire_secs")]
    access_expire_secs: u64,
    #[serde(default = "default_time_delay_secs")]
    access_time_delay_secs: u64,
    #[serde(default = "default_window_count")]
    access_window_count: i64,
    #[serde(default)]
    access_detect_merge_enabled: bool,
    #[serde(default)]
    access_detect_merge_strategy_ids: Option<String>,
    #[serde(default = "default_batch_threshold")]
    access_data_batch_process_threshold: usize,
    #[serde(default = "default_batch_size")]
    access_data_batch_process_size: usize,
    #[serde(default = "default_batch_wait_secs")]
    access_batch_wait_secs: u64,
    #[serde(default)]
    access_data_max_time_points: usize,
    #[serde(default)]
    host_disable_monitor_states: Option<String>,
    #[serde(default = "default_duplicate_ttl_secs")]
    access_duplicate_ttl_secs: u64,
    #[serde(default = "default_data_list_ttl_secs")]
    access_data_list_ttl_secs: u64,
    #[serde(default = "default_max_queue_length")]
    access_max_queue_length: u64,
    #[serde(default = "default_lock_ttl_secs")]
    access_lock_ttl_secs: u64,
    #[serde(default = "default_workers")]
    access_workers: usize,
}

const fn default_expire_secs() -> u64 {
    1800
}

const fn default_time_delay_secs() -> u64 {
    60
}

const fn default_window_count() -> i64 {
    3
}

const fn default_batch_threshold() -> usize {
    500_000
}

const fn default_batch_size() -> usize {
    50_000
}

const fn default_batch_wait_secs() -> u64 {
    300
}

const fn default_duplicate_ttl_secs() -> u64 {
    300
}

const fn default_data_list_ttl_secs() -> u64 {
    1800
}

const fn default_max_queue_length() -> u64 {
    100_000
}

const fn default_lock_ttl_secs() -> u64 {
    120
}

const fn default_workers() -> usize {
    4
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

impl AccessConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse access environment variables")?;
        Self::from_raw(raw)
    }

    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let raw: RawConfig = envy::from_iter(vars).context("failed to parse access variables")?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let detect_merge_strategy_ids = parse_csv(
            raw.access_detect_merge_strategy_ids
                .as_deref()
                .unwrap_or_default(),
        )
        .into_iter()
        .map(|id| {
            id.parse::<i64>()
                .with_context(|| format!("invalid strategy id in ACCESS_DETECT_MERGE_STRATEGY_IDS: {id}"))
        })
        .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            expire: Duration::from_secs(raw.access_expire_secs.max(60)),
            time_delay: Duration::from_secs(raw.access_time_delay_secs),
            window_count: raw.access_window_count.max(0),
            detect_merge_enabled: raw.access_detect_merge_enabled,
            detect_merge_strategy_ids,
            batch_threshold: raw.access_data_batch_process_threshold,
            batch_size: raw.access_data_batch_process_size.max(1),
            batch_wait: Duration::from_secs(raw.access_batch_wait_secs.max(1)),
            max_time_points: raw.access_data_max_time_points,
            host_disable_states: parse_csv(
                raw.host_disable_monitor_states
                    .as_deref()
                    .unwrap_or(DEFAULT_HOST_DISABLE_STATES),
            ),
            // duplicate memory never outlives five minutes
            duplicate_ttl: Duration::from_secs(raw.access_duplicate_ttl_secs.clamp(1, 300)),
            data_list_ttl: Duration::from_secs(raw.access_data_list_ttl_secs.max(1800)),
            max_queue_length: raw.access_max_queue_length.max(1),
            lock_ttl: Duration::from_secs(raw.access_lock_ttl_secs.max(1)),
            workers: raw.access_workers.max(1),
        })
    }

    /// Whether a group made of these strategies may take the fused path.
    pub fn merge_allowed(&self, strategy_ids: impl IntoIterator<Item = i64>) -> bool {
        if !self.detect_merge_enabled {
            return false;
        }
        if self.detect_merge_strategy_ids.is_empty() {
            return true;
        }
        strategy_ids
            .into_iter()
            .all(|id| self.detect_merge_strategy_ids.contains(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn parses_merge_list_and_states() {
        let config = AccessConfig::from_vars(vec![
            ("ACCESS_DETECT_MERGE_ENABLED".to_string(), "true".to_string()),
            ("ACCESS_DETECT_MERGE_STRATEGY_IDS".to_string(), "1, 2".to_string()),
            ("HOST_DISABLE_MONITOR_STATES".to_string(), "3,4".to_string()),
            ("ACCESS_DATA_MAX_TIME_POINTS".to_string(), "10".to_string()),
        ])
        .unwrap();
        assert_eq!(config.max_time_points, 10);
        assert_eq!(config.detect_merge_strategy_ids, vec![1, 2]);
        assert_eq!(config.host_disable_states, vec!["3", "4"]);
        assert!(config.merge_allowed([1]));
        assert!(!config.merge_allowed([1, 3]));
    }

    #[test]
    fn rejects_bad_strategy_ids() {
        let err = AccessConfig::from_vars(vec![(
            "ACCESS_DETECT_MERGE_STRATEGY_IDS".to_string(),
            "1,x".to_string(),
        )])
        .unwrap_err();
        assert!(err.to_string().contains("ACCESS_DETECT_MERGE_STRATEGY_IDS"));
    }

    #[test]
    #[serial]
    fn reads_process_environment() {
        std::env::set_var("ACCESS_WORKERS", "8");
        std::env::set_var("ACCESS_DATA_BATCH_PROCESS_THRESHOLD", "0");
        let config = AccessConfig::from_env().unwrap();
        std::env::remove_var("ACCESS_WORKERS");
        std::env::remove_var("ACCESS_DATA_BATCH_PROCESS_THRESHOLD");

        assert_eq!(config.workers, 8);
        assert_eq!(config.batch_threshold, 0);
        assert_eq!(config.max_time_points, 0);
        assert_eq!(config.host_disable_states.len(), 3);
        assert!(!config.merge_allowed([1]));
    }
}
