//! Records flowing through the access stage.

use crate::source::RawPoint;
use alarm_strategy::fingerprint::count_md5;
use alarm_strategy::models::{HostKey, Item, Strategy};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const TOPO_NODE_DIMENSION: &str = "bk_topo_node";

/// One strategy item served by a group, with its owning strategy.
#[derive(Debug, Clone)]
pub struct AccessItem {
    pub strategy: Arc<Strategy>,
    pub item: Item,
}

impl AccessItem {
    pub fn strategy_id(&self) -> i64 {
        self.strategy.id
    }

    pub fn item_id(&self) -> i64 {
        self.item.id
    }

    pub fn bk_biz_id(&self) -> i64 {
        self.strategy.bk_biz_id
    }
}

/// The payload handed to detection, as stored in `data_list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordData {
    pub record_id: String,
    pub value: f64,
    #[serde(default)]
    pub values: Map<String, Value>,
    pub dimensions: Map<String, Value>,
    pub time: i64,
}

#[derive(Debug, Clone)]
pub struct DataRecord {
    pub data: RecordData,
    /// `obj|inst` links of the record's host, filled when the point carries none.
    pub topo_links: Vec<String>,
    pub is_retains: BTreeMap<i64, bool>,
    pub inhibitions: BTreeMap<i64, bool>,
    /// Set when the record's host is excluded from monitoring.
    pub host_disabled: bool,
}

impl DataRecord {
    /// Wraps a raw point for the given items. Points without a value yield `None`.
    pub fn new(items: &[AccessItem], point: RawPoint) -> Option<Self> {
        let value = point.value?;
        let dimensions = normalize_dimensions(point.dimensions);
        let topo_links = dimensions
            .get(TOPO_NODE_DIMENSION)
            .map(link_list)
            .unwrap_or_default();
        let record_id = record_id(&dimensions, point.time);
        Some(Self {
            data: RecordData {
                record_id,
                value,
                values: point.values,
                dimensions,
                time: point.time,
            },
            topo_links,
            is_retains: items.iter().map(|item| (item.item_id(), true)).collect(),
            inhibitions: items.iter().map(|item| (item.item_id(), false)).collect(),
            host_disabled: false,
        })
    }

    pub fn time(&self) -> i64 {
        self.data.time
    }

    pub fn record_id(&self) -> &str {
        &self.data.record_id
    }

    /// The dimension half of the record id.
    pub fn dimensions_md5(&self) -> &str {
        self.data
            .record_id
            .split_once('.')
            .map_or(self.data.record_id.as_str(), |(md5, _)| md5)
    }

    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.data.dimensions.get(name).and_then(Value::as_str)
    }

    pub fn is_retained(&self, item_id: i64) -> bool {
        self.is_retains.get(&item_id).copied().unwrap_or(false)
            && !self.inhibitions.get(&item_id).copied().unwrap_or(false)
    }

    pub fn retained_by_any(&self) -> bool {
        self.is_retains.keys().any(|item_id| self.is_retained(*item_id))
    }

    pub fn clear_retains(&mut self) {
        self.is_retains.values_mut().for_each(|retain| *retain = false);
    }

    /// The host the record describes, if its dimensions name one.
    pub fn host_key(&self) -> Option<HostKey> {
        let host_id = self
            .dimension("bk_host_id")
            .and_then(|id| id.parse::<i64>().ok())
            .filter(|id| *id > 0);
        let ip = self
            .dimension("bk_target_ip")
            .or_else(|| self.dimension("ip"))
            .filter(|ip| !ip.is_empty())
            .map(str::to_string);
        let cloud_id = self
            .dimension("bk_target_cloud_id")
            .or_else(|| self.dimension("bk_cloud_id"))
            .unwrap_or("0")
            .to_string();
        let key = HostKey {
            cloud_id: ip.as_ref().map(|_| cloud_id),
            ip,
            host_id,
        };
        (!key.is_empty()).then_some(key)
    }
}

/// `md5(sorted dimensions) + "." + time`.
pub fn record_id(dimensions: &Map<String, Value>, time: i64) -> String {
    format!("{}.{}", count_md5(&Value::Object(dimensions.clone())), time)
}

/// Scalar dimension values are compared as strings downstream.
fn normalize_dimensions(dimensions: Map<String, Value>) -> Map<String, Value> {
    dimensions
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::Number(number) => Value::String(number.to_string()),
                Value::Bool(flag) => Value::String(flag.to_string()),
                other => other,
            };
            (key, value)
        })
        .collect()
}

fn link_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(links) => links
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Value::String(links) => links
            .split(',')
            .map(str::trim)
            .filter(|link| !link.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(dimensions: Value, value: Option<f64>) -> RawPoint {
        serde_json::from_value(json!({"dimensions": dimensions, "value": value, "time": 1_700_000_040}))
            .unwrap()
    }

    #[test]
    fn record_id_ignores_dimension_order() {
        let a = DataRecord::new(&[], point(json!({"bk_target_ip": "127.0.0.1", "bk_target_cloud_id": 0}), Some(1.0)))
            .unwrap();
        let b = DataRecord::new(&[], point(json!({"bk_target_cloud_id": "0", "bk_target_ip": "127.0.0.1"}), Some(2.0)))
            .unwrap();
        assert_eq!(a.record_id(), b.record_id());
        assert!(a.record_id().ends_with(".1700000040"));
        assert_eq!(a.dimensions_md5().len(), 32);
        assert_eq!(a.dimension("bk_target_cloud_id"), Some("0"));
    }

    #[test]
    fn null_values_are_rejected() {
        assert!(DataRecord::new(&[], point(json!({}), None)).is_none());
    }

    #[test]
    fn host_key_prefers_target_dimensions() {
        let record = DataRecord::new(
            &[],
            point(json!({"ip": "10.0.0.1", "bk_cloud_id": 2, "bk_topo_node": ["module|5", "set|3"]}), Some(1.0)),
        )
        .unwrap();
        assert_eq!(record.host_key(), Some(HostKey::by_ip("10.0.0.1", "2")));
        assert_eq!(record.topo_links, vec!["module|5", "set|3"]);
    }
}
