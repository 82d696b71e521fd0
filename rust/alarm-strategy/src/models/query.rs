use super::labels::{DataSourceLabel, DataTypeLabel};
use super::serde_util::{i64_or_zero, opt_i64};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggCondition {
    pub key: String,
    pub method: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// One normalized query against one data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    pub data_source_label: DataSourceLabel,
    pub data_type_label: DataTypeLabel,
    #[serde(default)]
    pub metric_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    #[serde(default)]
    pub result_table_id: String,
    #[serde(default)]
    pub metric_field: String,
    #[serde(default)]
    pub agg_method: String,
    #[serde(default, deserialize_with = "i64_or_zero")]
    pub agg_interval: i64,
    #[serde(default)]
    pub agg_dimension: Vec<String>,
    #[serde(default)]
    pub agg_condition: Vec<AggCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functions: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_set_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_event_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub bkmonitor_strategy_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intelligent_detect: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_query_config: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QueryConfig {
    pub fn new(
        data_source_label: DataSourceLabel,
        data_type_label: DataTypeLabel,
        metric_id: impl Into<String>,
    ) -> Self {
        Self {
            data_source_label,
            data_type_label,
            metric_id: metric_id.into(),
            alias: String::new(),
            result_table_id: String::new(),
            metric_field: String::new(),
            agg_method: String::new(),
            agg_interval: 0,
            agg_dimension: Vec::new(),
            agg_condition: Vec::new(),
            functions: None,
            promql: None,
            index_set_id: None,
            query_string: None,
            custom_event_name: None,
            alert_name: None,
            bkmonitor_strategy_id: None,
            time_field: None,
            unit: None,
            intelligent_detect: None,
            raw_query_config: None,
            extra: Map::new(),
        }
    }

    pub fn labels(&self) -> (&DataSourceLabel, &DataTypeLabel) {
        (&self.data_source_label, &self.data_type_label)
    }

    pub fn is_time_series(&self) -> bool {
        self.data_type_label == DataTypeLabel::TimeSeries
    }

    pub fn has_promql(&self) -> bool {
        self.promql.as_deref().is_some_and(|q| !q.is_empty())
    }

    /// Query kinds the access stage pulls by fingerprint group.
    pub fn is_groupable(&self) -> bool {
        let is_series = matches!(
            self.data_type_label,
            DataTypeLabel::TimeSeries | DataTypeLabel::Log
        );
        let is_custom_event = self.data_source_label == DataSourceLabel::Custom
            && self.data_type_label == DataTypeLabel::Event;
        let is_fta_event = self.data_source_label == DataSourceLabel::BkFta
            && self.data_type_label == DataTypeLabel::Event;
        is_series || is_custom_event || is_fta_event
    }

    pub fn is_system_event(&self) -> bool {
        self.data_source_label == DataSourceLabel::BkMonitor
            && self.data_type_label == DataTypeLabel::Event
    }

    pub fn uses_sdk(&self) -> bool {
        self.intelligent_detect
            .as_ref()
            .and_then(|detect| detect.get("use_sdk"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
