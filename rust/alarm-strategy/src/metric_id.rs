//! Metric id grammar, e.g. `bk_monitor.system.cpu_load.load5`.

use crate::models::{DataSourceLabel, DataTypeLabel};
use serde::{Deserialize, Serialize};

/// Table name system events are stored under.
pub const SYSTEM_EVENT_RT_TABLE_ID: &str = "system.event";

/// Lookup key for the metric registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricQuery {
    pub data_source_label: DataSourceLabel,
    pub data_type_label: DataTypeLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_table_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_field: Option<String>,
    /// Index set id for log-platform metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_id: Option<String>,
}

impl MetricQuery {
    fn new(source: DataSourceLabel, data_type: DataTypeLabel) -> Self {
        Self {
            data_source_label: source,
            data_type_label: data_type,
            result_table_id: None,
            metric_field: None,
            related_id: None,
        }
    }

    fn table(mut self, table: impl Into<String>) -> Self {
        self.result_table_id = Some(table.into());
        self
    }

    fn field(mut self, field: impl Into<String>) -> Self {
        self.metric_field = Some(field.into());
        self
    }

    fn related(mut self, related_id: impl Into<String>) -> Self {
        self.related_id = Some(related_id.into());
        self
    }
}

/// Splits a metric id into registry lookup fields. Returns `None` for ids
/// that do not follow any known shape.
pub fn parse_metric_id(metric_id: &str) -> Option<MetricQuery> {
    let parts: Vec<&str> = metric_id.split('.').collect();
    if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    let source = DataSourceLabel::from(parts[0]);
    let middle = |from: usize, to: usize| parts[from..to].join(".");
    let last = parts[parts.len() - 1];

    let query = match source {
        DataSourceLabel::BkMonitor => match (parts[1], parts.len()) {
            ("log", n) if n >= 3 => {
                MetricQuery::new(source, DataTypeLabel::Log).table(parts[2])
            }
            (field, 2) => MetricQuery::new(source, DataTypeLabel::Event)
                .table(SYSTEM_EVENT_RT_TABLE_ID)
                .field(field),
            ("alert", n) if n >= 3 => {
                MetricQuery::new(source, DataTypeLabel::Alert).field(parts[2])
            }
            (_, 3 | 4) => MetricQuery::new(source, DataTypeLabel::TimeSeries)
                .table(middle(1, parts.len() - 1))
                .field(last),
            _ => return None,
        },
        DataSourceLabel::Custom => {
            if parts[1] == "event" && parts.len() >= 4 {
                MetricQuery::new(source, DataTypeLabel::Event)
                    .table(parts[2])
                    .field(parts[3])
            } else if parts.len() >= 3 {
                MetricQuery::new(source, DataTypeLabel::TimeSeries)
                    .table(middle(1, parts.len() - 1))
                    .field(last)
            } else {
                return None;
            }
        }
        DataSourceLabel::BkLogSearch => {
            if parts.len() == 3 {
                MetricQuery::new(source, DataTypeLabel::Log).related(parts[2])
            } else if parts.len() > 3 {
                MetricQuery::new(source, DataTypeLabel::TimeSeries)
                    .related(parts[2])
                    .field(middle(3, parts.len()))
            } else {
                return None;
            }
        }
        DataSourceLabel::BkData if parts.len() >= 3 => {
            MetricQuery::new(source, DataTypeLabel::TimeSeries)
                .table(parts[1])
                .field(parts[2])
        }
        DataSourceLabel::BkFta if parts.len() >= 3 => {
            MetricQuery::new(source, DataTypeLabel::from(parts[1])).field(middle(2, parts.len()))
        }
        DataSourceLabel::BkApm => {
            if parts[1] == "log" && parts.len() >= 3 {
                MetricQuery::new(source, DataTypeLabel::Log).table(parts[2])
            } else if parts.len() >= 3 {
                MetricQuery::new(source, DataTypeLabel::TimeSeries)
                    .table(parts[1])
                    .field(middle(2, parts.len()))
            } else {
                return None;
            }
        }
        _ => return None,
    };
    Some(query)
}
