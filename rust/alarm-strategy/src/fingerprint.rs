//! Query fingerprints (`query_md5`). Items with the same fingerprint can be
//! served by one data query and form a strategy group.

use crate::models::{DataSourceLabel, DataTypeLabel, Item, QueryConfig};
use md5::{Digest, Md5};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

/// Hashes a JSON value so that object key order and list order do not matter.
pub fn count_md5(value: &Value) -> String {
    hex::encode(Md5::digest(canonical(value).as_bytes()))
}

fn canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|key| format!("{key:?}:{}", count_md5(&map[key])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let mut hashes: Vec<String> = items.iter().map(count_md5).collect();
            hashes.sort();
            format!("[{}]", hashes.join(","))
        }
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Plain md5 hex digest of a string.
pub fn md5_hex(raw: &str) -> String {
    hex::encode(Md5::digest(raw.as_bytes()))
}

/// Rules that decide which conditions survive into the fingerprint.
#[derive(Debug, Clone, Default)]
pub struct FingerprintRules {
    pub advance_condition_methods: HashSet<String>,
    pub unify_query_sources: HashSet<(DataSourceLabel, DataTypeLabel)>,
}

impl FingerprintRules {
    fn drops_conditions(&self, query: &QueryConfig) -> bool {
        let pair = (query.data_source_label.clone(), query.data_type_label.clone());
        !self.unify_query_sources.contains(&pair)
            && query.is_time_series()
            && query
                .agg_condition
                .iter()
                .any(|c| self.advance_condition_methods.contains(&c.method))
    }
}

fn query_params(bk_biz_id: i64, query: &QueryConfig, rules: &FingerprintRules) -> Value {
    let agg_condition = if rules.drops_conditions(query) {
        json!([])
    } else {
        serde_json::to_value(&query.agg_condition).unwrap_or_else(|_| json!([]))
    };

    let mut params = Map::new();
    params.insert("bk_biz_id".into(), json!(bk_biz_id));
    params.insert("data_source_label".into(), json!(query.data_source_label.as_str()));
    params.insert("data_type_label".into(), json!(query.data_type_label.as_str()));
    params.insert("agg_method".into(), json!(query.agg_method));
    params.insert("agg_interval".into(), json!(query.agg_interval));
    params.insert("agg_dimension".into(), json!(query.agg_dimension));
    params.insert("agg_condition".into(), agg_condition);
    params.insert("result_table_id".into(), json!(query.result_table_id));
    params.insert("metric_field".into(), json!(query.metric_field));
    params.insert("keywords_query_string".into(), json!(query.query_string));

    if let Some(functions) = query.functions.as_ref().filter(|f| !f.is_empty()) {
        params.insert("functions".into(), json!(functions));
    }
    if query.has_promql() {
        params.insert("promql".into(), json!(query.promql));
    }

    match (&query.data_source_label, &query.data_type_label) {
        (DataSourceLabel::BkLogSearch, _) => {
            params.insert(
                "index_set_id".into(),
                query.index_set_id.clone().unwrap_or(Value::Null),
            );
        }
        (DataSourceLabel::Custom, DataTypeLabel::Event) => {
            if let Some(name) = query.custom_event_name.as_ref().filter(|n| !n.is_empty()) {
                params.insert("custom_event_name".into(), json!(name));
            }
        }
        (DataSourceLabel::BkFta, _) => {
            params.insert("alert_name".into(), json!(query.alert_name));
        }
        (DataSourceLabel::BkMonitor, DataTypeLabel::Alert) => {
            params.insert("bkmonitor_strategy_id".into(), json!(query.bkmonitor_strategy_id));
        }
        _ => {}
    }

    Value::Object(params)
}

/// Fingerprint of one item, or `""` when the item's query kind is not grouped.
pub fn item_query_md5(bk_biz_id: i64, item: &Item, rules: &FingerprintRules) -> String {
    match item.first_query() {
        Some(first) if first.is_groupable() => {}
        _ => return String::new(),
    }

    let mut configs: Vec<Value> = item
        .query_configs
        .iter()
        .map(|query| query_params(bk_biz_id, query, rules))
        .collect();

    let trivial_expression = item.expression.trim_matches(' ').chars().count() <= 1;
    let canonical = if configs.len() == 1 && trivial_expression {
        configs.remove(0)
    } else {
        json!({"expression": item.expression, "query_configs": configs})
    };
    count_md5(&canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AggCondition, Algorithm};

    fn rules() -> FingerprintRules {
        FingerprintRules {
            advance_condition_methods: ["include", "reg"].iter().map(|s| s.to_string()).collect(),
            unify_query_sources: [(DataSourceLabel::BkMonitor, DataTypeLabel::TimeSeries)]
                .into_iter()
                .collect(),
        }
    }

    fn series_item(source: DataSourceLabel, condition_method: &str) -> Item {
        let mut query = QueryConfig::new(source, DataTypeLabel::TimeSeries, "x.y.z");
        query.agg_method = "AVG".into();
        query.agg_interval = 60;
        query.agg_dimension = vec!["bk_target_ip".into(), "bk_target_cloud_id".into()];
        query.agg_condition = vec![AggCondition {
            key: "device".into(),
            method: condition_method.into(),
            value: json!(["eth0"]),
            condition: None,
        }];
        Item::new(1, vec![query], vec![Algorithm::threshold(1, json!([]))])
    }

    #[test]
    fn key_and_list_order_do_not_matter() {
        let a = json!({"a": 1, "b": [1, 2, {"x": "y", "z": null}]});
        let b = json!({"b": [{"z": null, "x": "y"}, 2, 1], "a": 1});
        assert_eq!(count_md5(&a), count_md5(&b));
        assert_eq!(count_md5(&a).len(), 32);
        assert_ne!(count_md5(&json!({"a": 2})), count_md5(&json!({"a": 1})));
    }

    #[test]
    fn advanced_conditions_are_dropped_outside_unify_query() {
        let rules = rules();
        let advanced = series_item(DataSourceLabel::BkData, "include");
        let mut plain = advanced.clone();
        plain.query_configs[0].agg_condition.clear();
        assert_eq!(
            item_query_md5(2, &advanced, &rules),
            item_query_md5(2, &plain, &rules)
        );

        let unified = series_item(DataSourceLabel::BkMonitor, "include");
        let mut unified_plain = unified.clone();
        unified_plain.query_configs[0].agg_condition.clear();
        assert_ne!(
            item_query_md5(2, &unified, &rules),
            item_query_md5(2, &unified_plain, &rules)
        );
    }

    #[test]
    fn business_is_part_of_the_fingerprint() {
        let item = series_item(DataSourceLabel::BkMonitor, "eq");
        assert_ne!(
            item_query_md5(2, &item, &rules()),
            item_query_md5(3, &item, &rules())
        );
    }

    #[test]
    fn non_groupable_items_get_empty_fingerprint() {
        let query = QueryConfig::new(DataSourceLabel::BkMonitor, DataTypeLabel::Event, "bk_monitor.os_restart");
        let item = Item::new(1, vec![query], vec![]);
        assert_eq!(item_query_md5(2, &item, &rules()), "");
    }

    #[test]
    fn multi_query_items_hash_the_expression() {
        let mut item = series_item(DataSourceLabel::BkMonitor, "eq");
        item.query_configs.push(item.query_configs[0].clone());
        item.expression = "a + b".into();
        let first = item_query_md5(2, &item, &rules());
        item.expression = "a - b".into();
        assert_ne!(first, item_query_md5(2, &item, &rules()));
    }
}
