use crate::fingerprint::FingerprintRules;
use crate::models::{DataSourceLabel, DataTypeLabel, Strategy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A rule that keeps matching strategies out of the cache. Every populated
/// field must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisableRule {
    #[serde(default)]
    pub data_source_label: Option<String>,
    #[serde(default)]
    pub data_type_label: Option<String>,
    #[serde(default)]
    pub bk_biz_id: Vec<i64>,
    #[serde(default)]
    pub strategy_ids: Vec<i64>,
}

impl DisableRule {
    pub fn matches(&self, strategy: &Strategy) -> bool {
        if let (Some(source), Some(data_type)) = (&self.data_source_label, &self.data_type_label) {
            if !source.is_empty() && !data_type.is_empty() {
                let Some(query) = strategy.first_query() else {
                    return false;
                };
                if query.data_source_label.as_str() != source
                    || query.data_type_label.as_str() != data_type
                {
                    return false;
                }
            }
        }
        if !self.bk_biz_id.is_empty() && !self.bk_biz_id.contains(&strategy.bk_biz_id) {
            return false;
        }
        if !self.strategy_ids.is_empty() && !self.strategy_ids.contains(&strategy.id) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub cache_prefix: String,
    pub cache_ttl: Duration,
    pub fake_event_agg_interval: i64,
    pub disable_rules: Vec<DisableRule>,
    pub fingerprint: FingerprintRules,
    pub smart_refresh_default_window: Duration,
    pub refresh_interval: Duration,
    pub smart_refresh_interval: Duration,
    pub refresh_timeout: Duration,
    pub call_timeout: Duration,
    pub topo_cache_ttl: Duration,
    pub use_intelligent_detect_sdk: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            cache_prefix: default_cache_prefix(),
            cache_ttl: Duration::from_secs(default_cache_ttl_secs()),
            fake_event_agg_interval: default_fake_event_agg_interval(),
            disable_rules: Vec::new(),
            fingerprint: FingerprintRules {
                advance_condition_methods: parse_csv(DEFAULT_ADVANCE_METHODS).into_iter().collect(),
                unify_query_sources: parse_sources(DEFAULT_UNIFY_QUERY_SOURCES),
            },
            smart_refresh_default_window: Duration::from_secs(default_smart_window_secs()),
            refresh_interval: Duration::from_secs(default_refresh_interval_secs()),
            smart_refresh_interval: Duration::from_secs(default_smart_interval_secs()),
            refresh_timeout: Duration::from_secs(default_refresh_timeout_secs()),
            call_timeout: Duration::from_secs(default_call_timeout_secs()),
            topo_cache_ttl: Duration::from_secs(default_topo_cache_ttl_secs()),
            use_intelligent_detect_sdk: false,
        }
    }
}

const DEFAULT_ADVANCE_METHODS: &str = "include,exclude,reg,nreg";
const DEFAULT_UNIFY_QUERY_SOURCES: &str =
    "bk_monitor:time_series,custom:time_series,bk_apm:time_series,prometheus:time_series";

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_cache_prefix")]
    strategy_cache_prefix: String,
    #[serde(default = "default_cache_ttl_secs")]
    strategy_cache_ttl_secs: u64,
    #[serde(default = "default_fake_event_agg_interval")]
    fake_event_agg_interval: i64,
    #[serde(default)]
    alarm_disable_strategy_rules: Option<String>,
    #[serde(default)]
    advance_condition_methods: Option<String>,
    #[serde(default)]
    unify_query_data_sources: Option<String>,
    #[serde(default = "default_smart_window_secs")]
    smart_refresh_default_window_secs: u64,
    #[serde(default = "default_refresh_interval_secs")]
    refresh_interval_secs: u64,
    #[serde(default = "default_smart_interval_secs")]
    smart_refresh_interval_secs: u64,
    #[serde(default = "default_refresh_timeout_secs")]
    refresh_timeout_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    call_timeout_secs: u64,
    #[serde(default = "default_topo_cache_ttl_secs")]
    topo_cache_ttl_secs: u64,
    #[serde(default)]
    use_intelligent_detect_sdk: bool,
}

fn default_cache_prefix() -> String {
    "strategy".to_string()
}

const fn default_cache_ttl_secs() -> u64 {
    86_400
}

const fn default_fake_event_agg_interval() -> i64 {
    60
}

const fn default_smart_window_secs() -> u64 {
    300
}

const fn default_refresh_interval_secs() -> u64 {
    300
}

const fn default_smart_interval_secs() -> u64 {
    60
}

const fn default_refresh_timeout_secs() -> u64 {
    600
}

const fn default_call_timeout_secs() -> u64 {
    30
}

const fn default_topo_cache_ttl_secs() -> u64 {
    600
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_sources(raw: &str) -> std::collections::HashSet<(DataSourceLabel, DataTypeLabel)> {
    parse_csv(raw)
        .into_iter()
        .filter_map(|pair| {
            let (source, data_type) = pair.split_once(':')?;
            Some((
                DataSourceLabel::from(source.trim()),
                DataTypeLabel::from(data_type.trim()),
            ))
        })
        .collect()
}

impl StrategyConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse strategy cache environment variables")?;
        Self::from_raw(raw)
    }

    /// Builds the config from explicit key/value pairs, using the same names
    /// as the environment.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let raw: RawConfig =
            envy::from_iter(vars).context("failed to parse strategy cache variables")?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let disable_rules = match raw.alarm_disable_strategy_rules.as_deref().map(str::trim) {
            Some(rules) if !rules.is_empty() => serde_json::from_str(rules)
                .context("ALARM_DISABLE_STRATEGY_RULES must be a JSON array of rules")?,
            _ => Vec::new(),
        };

        let advance_condition_methods = parse_csv(
            raw.advance_condition_methods
                .as_deref()
                .unwrap_or(DEFAULT_ADVANCE_METHODS),
        )
        .into_iter()
        .collect();
        let unify_query_sources = parse_sources(
            raw.unify_query_data_sources
                .as_deref()
                .unwrap_or(DEFAULT_UNIFY_QUERY_SOURCES),
        );

        Ok(Self {
            cache_prefix: raw.strategy_cache_prefix,
            cache_ttl: Duration::from_secs(raw.strategy_cache_ttl_secs.max(60)),
            fake_event_agg_interval: raw.fake_event_agg_interval.max(1),
            disable_rules,
            fingerprint: FingerprintRules {
                advance_condition_methods,
                unify_query_sources,
            },
            smart_refresh_default_window: Duration::from_secs(
                raw.smart_refresh_default_window_secs.max(1),
            ),
            refresh_interval: Duration::from_secs(raw.refresh_interval_secs.max(1)),
            smart_refresh_interval: Duration::from_secs(raw.smart_refresh_interval_secs.max(1)),
            refresh_timeout: Duration::from_secs(raw.refresh_timeout_secs.max(1)),
            call_timeout: Duration::from_secs(raw.call_timeout_secs.max(1)),
            topo_cache_ttl: Duration::from_secs(raw.topo_cache_ttl_secs.clamp(1, 600)),
            use_intelligent_detect_sdk: raw.use_intelligent_detect_sdk,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Item, QueryConfig};

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_without_variables() {
        let config = StrategyConfig::from_vars(vars(&[])).unwrap();
        assert_eq!(config.fake_event_agg_interval, 60);
        assert_eq!(config.cache_prefix, "strategy");
        assert!(config.disable_rules.is_empty());
        assert!(config
            .fingerprint
            .advance_condition_methods
            .contains("include"));
        assert!(config
            .fingerprint
            .unify_query_sources
            .contains(&(DataSourceLabel::BkMonitor, DataTypeLabel::TimeSeries)));
    }

    #[test]
    fn parses_rules_and_overrides() {
        let config = StrategyConfig::from_vars(vars(&[
            ("FAKE_EVENT_AGG_INTERVAL", "120"),
            (
                "ALARM_DISABLE_STRATEGY_RULES",
                r#"[{"data_source_label": "bk_log_search", "data_type_label": "log", "bk_biz_id": [2]}]"#,
            ),
            ("TOPO_CACHE_TTL_SECS", "3600"),
        ]))
        .unwrap();
        assert_eq!(config.fake_event_agg_interval, 120);
        assert_eq!(config.disable_rules.len(), 1);
        assert_eq!(config.topo_cache_ttl, Duration::from_secs(600));
    }

    #[test]
    #[serial_test::serial]
    fn reads_process_environment() {
        std::env::set_var("STRATEGY_CACHE_PREFIX", "alarm_strategy");
        std::env::set_var("USE_INTELLIGENT_DETECT_SDK", "true");
        let config = StrategyConfig::from_env().unwrap();
        std::env::remove_var("STRATEGY_CACHE_PREFIX");
        std::env::remove_var("USE_INTELLIGENT_DETECT_SDK");

        assert_eq!(config.cache_prefix, "alarm_strategy");
        assert!(config.use_intelligent_detect_sdk);
    }

    #[test]
    fn rejects_malformed_rules() {
        let err = StrategyConfig::from_vars(vars(&[("ALARM_DISABLE_STRATEGY_RULES", "nope")]));
        assert!(err.is_err());
    }

    #[test]
    fn disable_rule_fields_are_and_matched() {
        let query = QueryConfig::new(DataSourceLabel::BkLogSearch, DataTypeLabel::Log, "bk_log_search.log.1");
        let strategy = Strategy::new(5, 2, vec![Item::new(1, vec![query], vec![])]);

        let rule = DisableRule {
            data_source_label: Some("bk_log_search".into()),
            data_type_label: Some("log".into()),
            bk_biz_id: vec![2],
            strategy_ids: vec![],
        };
        assert!(rule.matches(&strategy));

        let other_biz = DisableRule {
            bk_biz_id: vec![3],
            ..rule.clone()
        };
        assert!(!other_biz.matches(&strategy));

        let other_source = DisableRule {
            data_source_label: Some("bk_monitor".into()),
            ..rule
        };
        assert!(!other_source.matches(&strategy));
    }
}
