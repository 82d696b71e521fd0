use alarm_strategy::models::{ConditionMethod, InvalidType, Strategy, TargetField};
use alarm_strategy::{
    DisableRule, Snapshot, SnapshotSource, StrategyCacheManager, StrategyConfig, StrategyKeys,
};
use cache_backend::{CacheBackend, MemoryCache};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;

fn cpu_strategy(id: i64, target: Value) -> Value {
    json!({
        "id": id,
        "bk_biz_id": 2,
        "name": format!("cpu load {id}"),
        "scenario": "os",
        "items": [{
            "id": id,
            "name": "load5",
            "target": target,
            "query_configs": [{
                "data_source_label": "bk_monitor",
                "data_type_label": "time_series",
                "metric_id": "bk_monitor.system.cpu_load.load5",
                "result_table_id": "system.cpu_load",
                "metric_field": "load5",
                "agg_method": "AVG",
                "agg_interval": 60,
                "agg_dimension": ["bk_target_ip", "bk_target_cloud_id"],
                "agg_condition": []
            }],
            "algorithms": [{"type": "Threshold", "level": 1, "config": [[{"method": "gte", "threshold": 12}]]}]
        }],
        "detects": [{"level": 1, "expression": "", "connector": "and"}]
    })
}

fn ip_target() -> Value {
    json!([[{"field": "bk_target_ip", "method": "eq", "value": [{"bk_target_ip": "127.0.0.1", "bk_target_cloud_id": 0}]}]])
}

fn module_target(inst: i64) -> Value {
    json!([[{"field": "host_topo_node", "method": "eq", "value": [{"bk_obj_id": "module", "bk_inst_id": inst}]}]])
}

fn snapshot(strategies: Vec<Value>) -> Snapshot {
    serde_json::from_value(json!({
        "businesses": [2],
        "metrics": ["bk_monitor.system.cpu_load.load5"],
        "hosts": [{
            "bk_host_id": 1,
            "bk_biz_id": 2,
            "bk_host_innerip": "127.0.0.1",
            "bk_cloud_id": 0,
            "topo": [
                {"bk_obj_id": "module", "bk_inst_id": 5},
                {"bk_obj_id": "set", "bk_inst_id": 3},
                {"bk_obj_id": "biz", "bk_inst_id": 2}
            ]
        }],
        "bcs_clusters": {"2": ["BCS-K8S-00001"]},
        "strategies": strategies
    }))
    .unwrap()
}

struct Harness {
    cache: Arc<MemoryCache>,
    source: Arc<SnapshotSource>,
    manager: StrategyCacheManager,
}

fn harness(config: StrategyConfig, strategies: Vec<Value>) -> Harness {
    let cache = Arc::new(MemoryCache::new());
    let source = Arc::new(SnapshotSource::new(snapshot(strategies)));
    let manager = StrategyCacheManager::new(
        config,
        cache.clone(),
        source.clone(),
        source.clone(),
        source.clone(),
    );
    Harness {
        cache,
        source,
        manager,
    }
}

fn keys() -> StrategyKeys {
    StrategyKeys::new(StrategyConfig::default().cache_prefix)
}

#[tokio::test]
async fn full_refresh_publishes_consistent_views() {
    let h = harness(
        StrategyConfig::default(),
        vec![cpu_strategy(1, ip_target()), cpu_strategy(2, module_target(5))],
    );
    let report = h.manager.refresh().await.unwrap();
    assert_eq!(report.strategies, 2);
    assert_eq!(report.invalid, 0);

    let reader = h.manager.reader();
    assert_eq!(reader.strategy_ids().await.unwrap(), vec![1, 2]);
    assert_eq!(reader.bk_biz_ids().await.unwrap(), vec![2]);
    assert_eq!(reader.no_data_strategy_ids().await.unwrap(), Vec::<i64>::new());

    let groups = reader.groups().await.unwrap();
    assert_eq!(groups.len(), 1);
    for (md5, group) in &groups {
        assert_eq!(group.bk_biz_id, 2);
        assert_eq!(group.interval_list, vec![60]);
        for strategy_id in group.strategy_ids() {
            let strategy = reader.strategy(strategy_id).await.unwrap().unwrap();
            assert!(!strategy.is_invalid);
            assert!(strategy.items.iter().any(|item| &item.query_md5 == md5));
        }
    }
}

#[tokio::test]
async fn module_strategy_is_shielded_from_host_strategy() {
    let h = harness(
        StrategyConfig::default(),
        vec![cpu_strategy(1, ip_target()), cpu_strategy(2, module_target(5))],
    );
    h.manager.refresh().await.unwrap();
    let reader = h.manager.reader();

    let host_strategy = reader.strategy(1).await.unwrap().unwrap();
    assert_eq!(host_strategy.items[0].target.0.len(), 1);
    assert_eq!(host_strategy.items[0].target.0[0].len(), 1);

    let module_strategy = reader.strategy(2).await.unwrap().unwrap();
    let branch = &module_strategy.items[0].target.0[0];
    let shield = branch
        .iter()
        .find(|c| c.field == TargetField::BkTargetIp && c.method == ConditionMethod::Neq)
        .expect("neq clause");
    assert_eq!(shield.value.len(), 1);
    assert_eq!(shield.value[0].bk_target_ip.as_deref(), Some("127.0.0.1"));
    assert_eq!(shield.value[0].bk_target_cloud_id.as_deref(), Some("0"));

    // a second refresh leaves the rewritten target as it was
    h.manager.refresh().await.unwrap();
    let again = reader.strategy(2).await.unwrap().unwrap();
    assert_eq!(again.items[0].target, module_strategy.items[0].target);
}

#[tokio::test]
async fn unknown_metric_is_stored_but_not_published() {
    let mut broken = cpu_strategy(3, ip_target());
    broken["items"][0]["query_configs"][0]["metric_id"] = json!("bk_monitor.system.cpu_load.load15");
    broken["items"][0]["query_configs"][0]["metric_field"] = json!("load15");
    let h = harness(StrategyConfig::default(), vec![cpu_strategy(1, ip_target()), broken]);

    let report = h.manager.refresh().await.unwrap();
    assert_eq!(report.invalid, 1);

    let reader = h.manager.reader();
    assert_eq!(reader.strategy_ids().await.unwrap(), vec![1]);
    let stored = reader.strategy(3).await.unwrap().unwrap();
    assert!(stored.is_invalid);
    assert_eq!(stored.invalid_type, InvalidType::InvalidMetric);
    for group in reader.groups().await.unwrap().values() {
        assert!(!group.strategy_ids().collect::<Vec<_>>().contains(&3));
    }
}

#[tokio::test]
async fn strategies_without_items_are_dropped() {
    let mut empty = cpu_strategy(4, ip_target());
    empty["items"] = json!([]);
    let h = harness(StrategyConfig::default(), vec![empty]);

    h.manager.refresh().await.unwrap();
    let reader = h.manager.reader();
    assert!(reader.strategy_ids().await.unwrap().is_empty());
    assert!(reader.strategy(4).await.unwrap().is_none());
}

#[tokio::test]
async fn disable_rule_keeps_strategy_out_of_cache() {
    let config = StrategyConfig {
        disable_rules: vec![DisableRule {
            data_source_label: Some("bk_monitor".into()),
            data_type_label: Some("time_series".into()),
            bk_biz_id: vec![2],
            strategy_ids: vec![],
        }],
        ..StrategyConfig::default()
    };
    let h = harness(config, vec![cpu_strategy(1, ip_target())]);

    h.manager.refresh().await.unwrap();
    assert!(h.manager.reader().strategy_ids().await.unwrap().is_empty());
    assert!(h.manager.reader().strategy(1).await.unwrap().is_none());
}

#[tokio::test]
async fn k8s_strategies_are_scoped_to_enabled_clusters() {
    let mut k8s = cpu_strategy(5, json!([]));
    k8s["scenario"] = json!("kubernetes");
    k8s["items"][0]["query_configs"][0]["result_table_id"] = json!("");
    let h = harness(StrategyConfig::default(), vec![k8s]);

    h.manager.refresh().await.unwrap();
    let stored: Strategy = h.manager.reader().strategy(5).await.unwrap().unwrap();
    let condition = stored.items[0].query_configs[0]
        .agg_condition
        .iter()
        .find(|c| c.key == "bcs_cluster_id")
        .expect("cluster condition");
    assert_eq!(condition.method, "eq");
    assert_eq!(condition.value, json!(["BCS-K8S-00001"]));
}

#[tokio::test]
async fn smart_refresh_drops_disabled_strategy() {
    let h = harness(
        StrategyConfig::default(),
        vec![cpu_strategy(1, ip_target()), cpu_strategy(7, module_target(5))],
    );
    // strategy 7 gets its own group
    h.source.update(|snapshot| {
        snapshot.strategies[1].items[0].query_configs[0].agg_interval = 120;
    });
    h.manager.refresh().await.unwrap();

    let reader = h.manager.reader();
    let owned_md5 = reader.strategy(7).await.unwrap().unwrap().items[0].query_md5.clone();
    assert!(reader.group(&owned_md5).await.unwrap().is_some());

    let now = chrono::Utc::now().timestamp();
    h.cache
        .set(&keys().last_updated(), &(now - 120).to_string(), None)
        .await
        .unwrap();
    h.source.update(|snapshot| {
        snapshot.strategies[1].is_enabled = false;
        snapshot.history = serde_json::from_value(json!([{
            "strategy_id": 7,
            "operate": "update",
            "content": {"bk_biz_id": 2, "is_enabled": false},
            "create_time": now - 30
        }]))
        .unwrap();
    });

    let report = h.manager.smart_refresh().await.unwrap();
    assert!(!report.idle);
    assert_eq!(reader.strategy_ids().await.unwrap(), vec![1]);
    assert!(reader.strategy(7).await.unwrap().is_none());
    assert!(reader.group(&owned_md5).await.unwrap().is_none());
    assert_eq!(reader.groups().await.unwrap().len(), 1);
    assert!(reader.last_updated().await.unwrap().unwrap() >= now);
}

#[tokio::test]
async fn smart_refresh_without_history_keeps_marker() {
    let h = harness(StrategyConfig::default(), vec![cpu_strategy(1, ip_target())]);
    h.manager.refresh().await.unwrap();

    let report = h.manager.smart_refresh().await.unwrap();
    assert!(report.idle);
    assert_eq!(h.manager.reader().last_updated().await.unwrap(), None);
    assert_eq!(h.manager.reader().strategy_ids().await.unwrap(), vec![1]);
}
