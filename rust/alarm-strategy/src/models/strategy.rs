use super::labels::{AlgorithmType, InvalidType};
use super::query::QueryConfig;
use super::serde_util::{epoch_seconds, opt_i64};
use super::target::Target;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Algorithm {
    #[serde(
        default,
        deserialize_with = "opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<i64>,
    #[serde(rename = "type")]
    pub kind: AlgorithmType,
    #[serde(default)]
    pub level: i64,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub unit_prefix: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Algorithm {
    pub fn threshold(level: i64, config: Value) -> Self {
        Self {
            id: None,
            kind: AlgorithmType::Threshold,
            level,
            config,
            unit_prefix: String::new(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoDataConfig {
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub continuous: i64,
    #[serde(default)]
    pub agg_dimension: Vec<String>,
    #[serde(default)]
    pub level: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-severity trigger and recovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectSpec {
    pub level: i64,
    #[serde(default)]
    pub expression: String,
    #[serde(default = "default_connector")]
    pub connector: String,
    #[serde(default)]
    pub trigger_config: Value,
    #[serde(default)]
    pub recovery_config: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_connector() -> String {
    "and".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoiseReduceConfig {
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoticeConfig {
    #[serde(default)]
    pub notify_interval: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoticeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_reduce_config: Option<NoiseReduceConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoticeSpec {
    #[serde(default)]
    pub user_groups: Vec<Value>,
    #[serde(default)]
    pub signal: Vec<String>,
    #[serde(default)]
    pub config: NoticeConfig,
    #[serde(default)]
    pub options: NoticeOptions,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NoticeSpec {
    /// Noise reduction settings when switched on.
    pub fn noise_reduce(&self) -> Option<&NoiseReduceConfig> {
        self.options
            .noise_reduce_config
            .as_ref()
            .filter(|config| config.is_enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub expression: String,
    #[serde(default)]
    pub target: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_data_config: Option<NoDataConfig>,
    #[serde(default)]
    pub query_configs: Vec<QueryConfig>,
    #[serde(default)]
    pub algorithms: Vec<Algorithm>,
    #[serde(default)]
    pub query_md5: String,
    #[serde(default, deserialize_with = "epoch_seconds")]
    pub update_time: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Item {
    pub fn new(id: i64, query_configs: Vec<QueryConfig>, algorithms: Vec<Algorithm>) -> Self {
        Self {
            id,
            name: String::new(),
            expression: String::new(),
            target: Target::default(),
            no_data_config: None,
            query_configs,
            algorithms,
            query_md5: String::new(),
            update_time: 0,
            extra: Map::new(),
        }
    }

    pub fn first_query(&self) -> Option<&QueryConfig> {
        self.query_configs.first()
    }

    pub fn no_data_enabled(&self) -> bool {
        self.no_data_config.as_ref().is_some_and(|c| c.is_enabled)
    }

    /// Smallest positive aggregation interval across the item's queries.
    pub fn min_interval(&self) -> Option<i64> {
        self.query_configs
            .iter()
            .map(|q| q.agg_interval)
            .filter(|interval| *interval > 0)
            .min()
    }

    pub fn max_interval(&self) -> Option<i64> {
        self.query_configs
            .iter()
            .map(|q| q.agg_interval)
            .filter(|interval| *interval > 0)
            .max()
    }

    pub fn is_all_threshold(&self) -> bool {
        self.algorithms
            .iter()
            .all(|algorithm| algorithm.kind == AlgorithmType::Threshold)
    }
}

/// An authored alarm strategy in its compiled, cacheable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: i64,
    pub bk_biz_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub scenario: String,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
    #[serde(default)]
    pub is_invalid: bool,
    #[serde(default)]
    pub invalid_type: InvalidType,
    #[serde(default, deserialize_with = "epoch_seconds")]
    pub create_time: i64,
    #[serde(default, deserialize_with = "epoch_seconds")]
    pub update_time: i64,
    #[serde(
        default,
        deserialize_with = "opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_group_key: Option<String>,
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub detects: Vec<DetectSpec>,
    #[serde(default)]
    pub notice: NoticeSpec,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

impl Strategy {
    pub fn new(id: i64, bk_biz_id: i64, items: Vec<Item>) -> Self {
        Self {
            id,
            bk_biz_id,
            name: String::new(),
            scenario: String::new(),
            is_enabled: true,
            is_invalid: false,
            invalid_type: InvalidType::Healthy,
            create_time: 0,
            update_time: 0,
            priority: None,
            priority_group_key: None,
            items,
            detects: Vec::new(),
            notice: NoticeSpec::default(),
            extra: Map::new(),
        }
    }

    pub fn first_item(&self) -> Option<&Item> {
        self.items.first()
    }

    pub fn first_query(&self) -> Option<&QueryConfig> {
        self.first_item().and_then(Item::first_query)
    }

    pub fn is_k8s(&self) -> bool {
        self.scenario.starts_with("kubernetes")
    }

    pub fn has_priority(&self) -> bool {
        self.priority.is_some()
    }

    pub fn needs_no_data(&self) -> bool {
        self.items.iter().any(Item::no_data_enabled)
    }

    /// Marks the strategy invalid. The first recorded reason wins.
    pub fn mark_invalid(&mut self, reason: InvalidType) {
        if !self.is_invalid {
            self.invalid_type = reason;
        }
        self.is_invalid = true;
    }

    pub fn item(&self, item_id: i64) -> Option<&Item> {
        self.items.iter().find(|item| item.id == item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_minimal_strategy() {
        let strategy: Strategy = serde_json::from_value(json!({
            "id": 1,
            "bk_biz_id": 2,
            "update_time": "2023-11-14 22:13:20",
            "items": [{
                "id": 1,
                "query_configs": [{
                    "data_source_label": "bk_monitor",
                    "data_type_label": "time_series",
                    "agg_interval": 60
                }],
                "algorithms": [{"type": "Threshold", "level": 1, "config": [[{"method": "gte", "threshold": 12}]]}]
            }],
            "notice": {"options": {"noise_reduce_config": {"is_enabled": true, "dimensions": ["bk_target_ip"], "count": 10}}}
        }))
        .unwrap();

        assert!(strategy.is_enabled);
        assert_eq!(strategy.update_time, 1_700_000_000);
        assert!(strategy.items[0].is_all_threshold());
        assert_eq!(strategy.items[0].min_interval(), Some(60));
        assert_eq!(
            strategy.notice.noise_reduce().map(|c| c.dimensions.clone()),
            Some(vec!["bk_target_ip".to_string()])
        );
    }

    #[test]
    fn first_invalid_reason_wins() {
        let mut strategy = Strategy::new(1, 2, vec![]);
        strategy.mark_invalid(InvalidType::InvalidBiz);
        strategy.mark_invalid(InvalidType::InvalidMetric);
        assert_eq!(strategy.invalid_type, InvalidType::InvalidBiz);
    }
}
