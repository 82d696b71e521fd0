use super::{FilterOutcome, RecordFilter};
use crate::error::Result;
use crate::record::{AccessItem, DataRecord};
use alarm_strategy::models::{ConditionMethod, Target, TargetCondition, TargetField, TopoNode};
use alarm_strategy::TopologyResolver;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Evaluates item targets against record dimensions.
#[derive(Clone)]
pub struct TargetMatcher {
    topo: Arc<TopologyResolver>,
}

impl TargetMatcher {
    pub fn new(topo: Arc<TopologyResolver>) -> Self {
        Self { topo }
    }

    /// An empty target matches everything.
    pub async fn matches(&self, bk_biz_id: i64, target: &Target, record: &DataRecord) -> Result<bool> {
        if target.is_empty() {
            return Ok(true);
        }
        'branches: for branch in target.branches() {
            for condition in branch {
                if !self.condition_matches(bk_biz_id, condition, record).await? {
                    continue 'branches;
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn condition_matches(
        &self,
        bk_biz_id: i64,
        condition: &TargetCondition,
        record: &DataRecord,
    ) -> Result<bool> {
        let hit = match &condition.field {
            field if field.is_static_ip() => {
                let Some(key) = record.host_key() else {
                    return Ok(condition.method == ConditionMethod::Neq);
                };
                condition
                    .value
                    .iter()
                    .filter_map(|value| value.host_key())
                    .any(|wanted| wanted.matches(&key))
            }
            field if field.is_topo() => {
                let nodes: Vec<TopoNode> =
                    condition.value.iter().filter_map(|value| value.topo_node()).collect();
                links_hit(&nodes, &record.topo_links)
            }
            field if field.template_kind().is_some() => {
                let template_ids: Vec<i64> =
                    condition.value.iter().filter_map(|value| value.bk_inst_id).collect();
                let nodes = match field.template_kind() {
                    Some(kind) => self.topo.expand_templates(kind, &template_ids).await?,
                    None => Vec::new(),
                };
                links_hit(&nodes, &record.topo_links)
            }
            TargetField::DynamicGroup => {
                let host_id = record
                    .dimension("bk_host_id")
                    .and_then(|id| id.parse::<i64>().ok());
                match host_id {
                    Some(host_id) => {
                        let mut hit = false;
                        for group_id in condition.value.iter().filter_map(|v| v.dynamic_group_id.as_deref()) {
                            if self
                                .topo
                                .dynamic_group_hosts(bk_biz_id, group_id)
                                .await?
                                .contains(&host_id)
                            {
                                hit = true;
                                break;
                            }
                        }
                        hit
                    }
                    None => false,
                }
            }
            other => {
                let name = other.as_str();
                let actual = record.dimension(name);
                condition.value.iter().any(|value| {
                    let expected = value.extra.get(name).map(scalar_string);
                    actual.is_some() && expected.as_deref() == actual
                })
            }
        };
        Ok(if condition.method == ConditionMethod::Neq { !hit } else { hit })
    }
}

fn links_hit(nodes: &[TopoNode], links: &[String]) -> bool {
    let wanted: HashSet<String> = nodes.iter().map(TopoNode::link).collect();
    links.iter().any(|link| wanted.contains(link))
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn uses_topology(target: &Target) -> bool {
    target
        .conditions()
        .any(|c| c.field.is_topo() || c.field.template_kind().is_some())
}

/// Clears the retain flag of every item whose target excludes the record.
pub struct RangeFilter {
    items: Arc<Vec<AccessItem>>,
    matcher: TargetMatcher,
    topo: Arc<TopologyResolver>,
    needs_topology: bool,
}

impl RangeFilter {
    pub fn new(items: Arc<Vec<AccessItem>>, topo: Arc<TopologyResolver>) -> Self {
        let needs_topology = items.iter().any(|item| uses_topology(&item.item.target));
        Self {
            items,
            matcher: TargetMatcher::new(topo.clone()),
            topo,
            needs_topology,
        }
    }
}

#[async_trait]
impl RecordFilter for RangeFilter {
    fn name(&self) -> &'static str {
        "out_of_range"
    }

    async fn filter(&self, record: &mut DataRecord) -> Result<FilterOutcome> {
        if self.needs_topology && record.topo_links.is_empty() {
            if let Some(key) = record.host_key() {
                record.topo_links = self.topo.host_topo_links(&key).await?;
            }
        }
        for item in self.items.iter() {
            let matched = self
                .matcher
                .matches(item.bk_biz_id(), &item.item.target, record)
                .await?;
            if !matched {
                record.is_retains.insert(item.item_id(), false);
            }
        }
        Ok(FilterOutcome::Keep)
    }
}
