use super::labels::{DataSourceLabel, DataTypeLabel};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Items sharing one query fingerprint, as stored in the `strategy_group`
/// hash. On the wire member strategies are top-level keys next to the
/// bookkeeping fields: `{"1": [1], "bk_biz_id": 2, "interval_list": [60]}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyGroup {
    pub members: BTreeMap<i64, Vec<i64>>,
    pub bk_biz_id: i64,
    pub interval_list: Vec<i64>,
    pub strategy_source: Vec<(DataSourceLabel, DataTypeLabel)>,
}

impl StrategyGroup {
    pub fn new(bk_biz_id: i64) -> Self {
        Self {
            bk_biz_id,
            ..Self::default()
        }
    }

    pub fn add_item(&mut self, strategy_id: i64, item_id: i64) {
        let items = self.members.entry(strategy_id).or_default();
        if !items.contains(&item_id) {
            items.push(item_id);
        }
    }

    pub fn strategy_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.members.keys().copied()
    }

    /// Smallest positive interval, the one the group is queried at.
    pub fn min_interval(&self) -> Option<i64> {
        self.interval_list.iter().copied().filter(|i| *i > 0).min()
    }

    pub fn max_interval(&self) -> Option<i64> {
        self.interval_list.iter().copied().filter(|i| *i > 0).max()
    }

    pub fn remove_strategy(&mut self, strategy_id: i64) -> bool {
        self.members.remove(&strategy_id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for (strategy_id, items) in &self.members {
            map.insert(strategy_id.to_string(), json!(items));
        }
        map.insert("bk_biz_id".into(), json!(self.bk_biz_id));
        if !self.interval_list.is_empty() {
            map.insert("interval_list".into(), json!(self.interval_list));
        }
        if !self.strategy_source.is_empty() {
            let sources: Vec<[&str; 2]> = self
                .strategy_source
                .iter()
                .map(|(source, data_type)| [source.as_str(), data_type.as_str()])
                .collect();
            map.insert("strategy_source".into(), json!(sources));
        }
        map
    }

    fn from_map(map: Map<String, Value>) -> Result<Self, String> {
        let mut group = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "bk_biz_id" => {
                    group.bk_biz_id = value
                        .as_i64()
                        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                        .ok_or_else(|| format!("bad bk_biz_id: {value}"))?;
                }
                "interval_list" => {
                    group.interval_list = serde_json::from_value(value).map_err(|e| e.to_string())?;
                }
                "strategy_source" => {
                    let pairs: Vec<(String, String)> =
                        serde_json::from_value(value).map_err(|e| e.to_string())?;
                    group.strategy_source = pairs
                        .into_iter()
                        .map(|(source, data_type)| (source.into(), data_type.into()))
                        .collect();
                }
                other => {
                    // unknown bookkeeping fields are ignored
                    let Ok(strategy_id) = other.parse::<i64>() else {
                        continue;
                    };
                    let items: Vec<i64> =
                        serde_json::from_value(value).map_err(|e| e.to_string())?;
                    group.members.insert(strategy_id, items);
                }
            }
        }
        Ok(group)
    }
}

impl Serialize for StrategyGroup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StrategyGroup {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        Self::from_map(map).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flat_wire_shape() {
        let mut group = StrategyGroup::new(2);
        group.add_item(1, 1);
        group.add_item(1, 1);
        group.add_item(3, 4);
        group.interval_list = vec![60, 120];
        group
            .strategy_source
            .push((DataSourceLabel::BkMonitor, DataTypeLabel::TimeSeries));

        let value = serde_json::to_value(&group).unwrap();
        assert_eq!(
            value,
            json!({
                "1": [1],
                "3": [4],
                "bk_biz_id": 2,
                "interval_list": [60, 120],
                "strategy_source": [["bk_monitor", "time_series"]]
            })
        );
        let back: StrategyGroup = serde_json::from_value(value).unwrap();
        assert_eq!(back, group);
        assert_eq!(back.min_interval(), Some(60));
    }
}
