//! Per-strategy validation and pre-processing, from config database rows to
//! the cacheable form.

use crate::config::StrategyConfig;
use crate::error::{Result, StrategyError};
use crate::facade::{with_deadline, MetricRegistry};
use crate::fingerprint::item_query_md5;
use crate::ledger::InvalidationLedger;
use crate::metric_id::parse_metric_id;
use crate::models::{
    AlgorithmType, DataSourceLabel, DataTypeLabel, InvalidType, Item, QueryConfig, Strategy,
    TargetField, TargetValue,
};
use crate::topo::TopologyResolver;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const BK_DATA_TIME_FIELD: &str = "dtEventTimeStamp";

/// Metrics stored as time series but alarmed on as system events.
const FAKE_EVENT_METRICS: [(&str, &str); 3] = [
    ("bk_monitor.system.env.uptime", "bk_monitor.os_restart"),
    ("bk_monitor.pingserver.base.loss_percent", "bk_monitor.ping-gse"),
    ("bk_monitor.system.proc_port.proc_exists", "bk_monitor.proc_port"),
];

/// Dimensions that already identify a monitored instance.
const INSTANCE_DIMENSIONS: [&str; 3] = [
    "bk_target_ip",
    "bk_target_service_instance_id",
    "bk_host_id",
];

/// Result of compiling a batch of strategies.
#[derive(Debug, Default)]
pub struct CompiledSet {
    pub strategies: BTreeMap<i64, Strategy>,
    pub ledger: InvalidationLedger,
}

impl CompiledSet {
    pub fn valid(&self) -> impl Iterator<Item = &Strategy> {
        self.strategies.values().filter(|s| !s.is_invalid)
    }

    pub fn invalid(&self) -> impl Iterator<Item = &Strategy> {
        self.strategies.values().filter(|s| s.is_invalid)
    }

    pub fn remove(&mut self, strategy_id: i64) -> Option<Strategy> {
        self.strategies.remove(&strategy_id)
    }

    /// Replaces entries with a recompiled subset.
    pub fn merge(&mut self, other: CompiledSet) {
        self.strategies.extend(other.strategies);
    }
}

pub struct StrategyCompiler<'a> {
    pub config: &'a StrategyConfig,
    pub topo: &'a TopologyResolver,
    pub registry: &'a dyn MetricRegistry,
}

impl StrategyCompiler<'_> {
    pub async fn compile(&self, raw: Vec<Strategy>) -> Result<CompiledSet> {
        let mut ledger = InvalidationLedger::new();
        let businesses = with_deadline(
            "cmdb",
            self.config.call_timeout,
            self.topo.cmdb().list_businesses(),
        )
        .await?;
        ledger.set_businesses(businesses);

        let mut strategies = BTreeMap::new();
        for strategy in raw {
            let strategy_id = strategy.id;
            if strategy.items.is_empty() {
                warn!(strategy_id, "strategy has no items, skipped");
                continue;
            }
            if strategy.items.iter().any(|item| item.query_configs.is_empty()) {
                warn!(strategy_id, "strategy item has no query config, skipped");
                continue;
            }

            match self.compile_with_retry(strategy, &mut ledger).await {
                Ok(Some(compiled)) => {
                    strategies.insert(strategy_id, compiled);
                }
                Ok(None) => {}
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => {
                    warn!(strategy_id, error = %err, "failed to compile strategy, skipped");
                }
            }
        }

        for child in ledger.resolve_related() {
            if let Some(strategy) = strategies.get_mut(&child) {
                strategy.mark_invalid(InvalidType::InvalidRelatedStrategy);
            }
        }

        Ok(CompiledSet { strategies, ledger })
    }

    async fn compile_with_retry(
        &self,
        strategy: Strategy,
        ledger: &mut InvalidationLedger,
    ) -> Result<Option<Strategy>> {
        let mut first = strategy.clone();
        match self.handle_strategy(&mut first, ledger).await {
            Ok(keep) => Ok(keep.then_some(first)),
            Err(err) if err.is_transient() => {
                debug!(strategy_id = strategy.id, error = %err, "retrying strategy compile");
                let mut second = strategy;
                let keep = self.handle_strategy(&mut second, ledger).await?;
                Ok(keep.then_some(second))
            }
            Err(err) => Err(err),
        }
    }

    /// Validates and normalises one strategy in place. Returns `false` when
    /// the strategy must stay out of the cache altogether.
    pub async fn handle_strategy(
        &self,
        strategy: &mut Strategy,
        ledger: &mut InvalidationLedger,
    ) -> Result<bool> {
        strategy.is_invalid = false;
        strategy.invalid_type = InvalidType::Healthy;

        if let Some(rule) = self.config.disable_rules.iter().find(|r| r.matches(strategy)) {
            debug!(strategy_id = strategy.id, ?rule, "strategy disabled by rule");
            return Ok(false);
        }

        let mut reasons = Vec::new();
        if !ledger.business_exists(strategy.bk_biz_id) {
            reasons.push(InvalidType::InvalidBiz);
        }

        let (strategy_id, bk_biz_id, update_time) =
            (strategy.id, strategy.bk_biz_id, strategy.update_time);
        for item in &mut strategy.items {
            item.update_time = update_time;
            item.target.normalize_aliases();

            if let Some(reason) = self.check_metrics(strategy_id, bk_biz_id, item, ledger).await? {
                reasons.push(reason);
            }

            if let Some(first) = item.target.first() {
                let is_ip_target = first.field == TargetField::BkTargetIp;
                self.handle_special_query_config(bk_biz_id, is_ip_target, item)
                    .await?;

                let target_reason = self.check_target(item).await?;
                let target_empty = item
                    .target
                    .first()
                    .map_or(true, |condition| condition.value.is_empty());
                match target_reason {
                    Some(reason) => reasons.push(reason),
                    None if target_empty && reasons.is_empty() => {
                        info!(strategy_id, "target has no value, strategy skipped");
                        return Ok(false);
                    }
                    None => {}
                }
            }

            if !self.config.use_intelligent_detect_sdk {
                for query in &mut item.query_configs {
                    merge_intelligent_detect(query)?;
                }
            }

            item.query_md5 = item_query_md5(bk_biz_id, item, &self.config.fingerprint);
        }

        for reason in reasons {
            if !strategy.is_invalid {
                strategy.mark_invalid(reason);
                ledger.mark(reason, strategy_id);
            }
        }
        Ok(true)
    }

    async fn check_metrics(
        &self,
        strategy_id: i64,
        bk_biz_id: i64,
        item: &mut Item,
        ledger: &mut InvalidationLedger,
    ) -> Result<Option<InvalidType>> {
        let mut found = None;
        if let Some(algorithm) = item.algorithms.first() {
            if algorithm.kind == AlgorithmType::HostAnomalyDetection {
                return Ok(None);
            }
            let unit = item
                .first_query()
                .and_then(|query| query.unit.clone())
                .unwrap_or_default();
            if !ledger.unit(&unit).accepts(&algorithm.unit_prefix) {
                found = Some(InvalidType::InvalidUnit);
            }
        }

        for query in &mut item.query_configs {
            if query.is_time_series()
                && query.data_source_label == DataSourceLabel::BkData
                && query.time_field.as_deref() != Some(BK_DATA_TIME_FIELD)
            {
                warn!(strategy_id, "bk_data time series query had a wrong time field, corrected");
                query.time_field = Some(BK_DATA_TIME_FIELD.to_string());
            }

            let reason = match query.data_type_label {
                DataTypeLabel::TimeSeries => InvalidType::InvalidMetric,
                DataTypeLabel::Alert => InvalidType::DeletedRelatedStrategy,
                _ => continue,
            };
            if query.data_source_label == DataSourceLabel::Prometheus {
                continue;
            }
            if query.data_type_label == DataTypeLabel::Alert
                && query.data_source_label == DataSourceLabel::BkMonitor
            {
                if let Some(parent) = query.bkmonitor_strategy_id {
                    ledger.relate(parent, strategy_id);
                }
            }

            let exists = match ledger.metric_checked(&query.metric_id) {
                Some(known) => known,
                None => {
                    let exists = match parse_metric_id(&query.metric_id) {
                        Some(lookup) => {
                            with_deadline(
                                "metric_registry",
                                self.config.call_timeout,
                                self.registry.exists(bk_biz_id, &lookup),
                            )
                            .await?
                        }
                        None => false,
                    };
                    ledger.record_metric(&query.metric_id, exists);
                    exists
                }
            };
            if !exists && found.is_none() {
                found = Some(reason);
            }
        }
        Ok(found)
    }

    /// Expands templates into topo nodes and checks the nodes still exist.
    async fn check_target(&self, item: &mut Item) -> Result<Option<InvalidType>> {
        let mut found = None;
        for condition in item.target.conditions_mut() {
            if let (Some(kind), Some(field)) =
                (condition.field.template_kind(), condition.field.expanded_topo_field())
            {
                let template_ids: Vec<i64> =
                    condition.value.iter().filter_map(|v| v.bk_inst_id).collect();
                let had_templates = !condition.value.is_empty();
                let nodes = self.topo.expand_templates(kind, &template_ids).await?;
                if had_templates && nodes.is_empty() && found.is_none() {
                    found = Some(InvalidType::InvalidTarget);
                }
                condition.field = field;
                condition.value = nodes.iter().map(TargetValue::node).collect();
                continue;
            }

            if condition.field.is_topo() && !condition.value.is_empty() {
                let nodes: Vec<_> = condition.value.iter().filter_map(TargetValue::topo_node).collect();
                if !self.topo.nodes_valid(&nodes).await? && found.is_none() {
                    found = Some(InvalidType::InvalidTarget);
                }
            }
        }
        Ok(found)
    }

    async fn handle_special_query_config(
        &self,
        bk_biz_id: i64,
        is_ip_target: bool,
        item: &mut Item,
    ) -> Result<()> {
        for query in &mut item.query_configs {
            if query.has_promql() {
                continue;
            }

            if let Some((_, event_id)) = FAKE_EVENT_METRICS.iter().find(|(raw, _)| *raw == query.metric_id) {
                query.metric_id = event_id.to_string();
            }
            if FAKE_EVENT_METRICS.iter().any(|(_, event_id)| *event_id == query.metric_id)
                && query.agg_interval <= 0
            {
                query.agg_interval = self.config.fake_event_agg_interval;
            }

            let has_instance_dimension = query
                .agg_dimension
                .iter()
                .any(|dim| INSTANCE_DIMENSIONS.contains(&dim.as_str()));

            if is_ip_target {
                let is_fta_event = query.data_source_label == DataSourceLabel::BkFta
                    && query.data_type_label == DataTypeLabel::Event;
                if is_fta_event {
                    extend_dimensions(query, &["ip", "bk_cloud_id"]);
                } else if !has_instance_dimension {
                    if self.topo.is_ipv6_biz(bk_biz_id).await? {
                        extend_dimensions(query, &["bk_host_id"]);
                    } else {
                        extend_dimensions(query, &["bk_target_ip", "bk_target_cloud_id"]);
                    }
                }
            }

            let is_monitor_log = query.data_source_label == DataSourceLabel::BkMonitor
                && query.data_type_label == DataTypeLabel::Log;
            if is_monitor_log && !is_ip_target && !has_instance_dimension {
                extend_dimensions(query, &["bk_obj_id", "bk_inst_id"]);
            }
        }
        Ok(())
    }
}

fn extend_dimensions(query: &mut QueryConfig, dims: &[&str]) {
    for dim in dims {
        if !query.agg_dimension.iter().any(|d| d == dim) {
            query.agg_dimension.push(dim.to_string());
        }
    }
}

/// Lifts intelligent detection overrides to the top level, keeping the
/// authored query under `raw_query_config`. SDK-driven detection is left alone.
fn merge_intelligent_detect(query: &mut QueryConfig) -> Result<()> {
    let Some(detect) = query.intelligent_detect.clone() else {
        return Ok(());
    };
    if query.uses_sdk() {
        return Ok(());
    }

    let mut raw = serde_json::to_value(&*query)?;
    if let Value::Object(map) = &mut raw {
        map.remove("intelligent_detect");
        map.remove("raw_query_config");
    }

    let Value::Object(mut merged) = serde_json::to_value(&*query)? else {
        return Err(StrategyError::InvalidInput("query config is not an object".into()));
    };
    merged.extend(detect.clone());
    if let Some(Value::Object(extend_fields)) = detect.get("extend_fields") {
        merged.extend(extend_fields.clone());
    }
    merged.insert("raw_query_config".into(), raw);
    *query = serde_json::from_value(Value::Object(merged))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn intelligent_detect_overrides_are_lifted() {
        let mut query: QueryConfig = serde_json::from_value(json!({
            "data_source_label": "bk_monitor",
            "data_type_label": "time_series",
            "metric_id": "bk_monitor.system.cpu_load.load5",
            "result_table_id": "system.cpu_load",
            "intelligent_detect": {
                "result_table_id": "2_bkaiops_detect",
                "extend_fields": {"values": ["is_anomaly"]}
            }
        }))
        .unwrap();

        merge_intelligent_detect(&mut query).unwrap();
        assert_eq!(query.result_table_id, "2_bkaiops_detect");
        assert_eq!(query.extra.get("values"), Some(&json!(["is_anomaly"])));
        let raw = query.raw_query_config.clone().unwrap();
        assert_eq!(raw["result_table_id"], json!("system.cpu_load"));
        assert!(raw.get("intelligent_detect").is_none());
    }

    #[test]
    fn sdk_detection_is_untouched() {
        let mut query: QueryConfig = serde_json::from_value(json!({
            "data_source_label": "bk_monitor",
            "data_type_label": "time_series",
            "result_table_id": "system.cpu_load",
            "intelligent_detect": {"use_sdk": true, "result_table_id": "x"}
        }))
        .unwrap();
        let before = query.clone();
        merge_intelligent_detect(&mut query).unwrap();
        assert_eq!(query, before);
    }
}
