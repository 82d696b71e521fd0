//! Target shielding between strategies that share a query fingerprint.
//!
//! Within a business, strategies whose first item produces the same query
//! compete for the same data. Their targets are rewritten so an instance is
//! evaluated by the most specific strategy only: a static host beats any
//! topology containing it, and a lower topology level beats a higher one.

use crate::models::{
    AggCondition, ConditionMethod, Strategy, Target, TargetCondition, TargetField, TargetValue,
    TopoNode,
};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

/// Whether a strategy takes part in shielding at all.
pub fn is_shield_candidate(strategy: &Strategy) -> bool {
    let Some(item) = strategy.first_item() else {
        return false;
    };
    let Some(query) = item.first_query() else {
        return false;
    };
    (!item.query_md5.is_empty() || query.is_system_event())
        && !item.target.is_empty()
        && !strategy.has_priority()
}

/// Grouping key inside a business: the fingerprint, or the metric id for
/// ungrouped system events.
fn shield_key(strategy: &Strategy) -> String {
    match strategy.first_item() {
        Some(item) if !item.query_md5.is_empty() => item.query_md5.clone(),
        Some(item) => item
            .first_query()
            .map(|query| query.metric_id.clone())
            .unwrap_or_default(),
        None => String::new(),
    }
}

/// Rewrites the targets of every competing group. `mainline_levels` is leaf
/// first. Returns the number of strategies whose target changed.
pub fn apply_target_shield(strategies: &mut [Strategy], mainline_levels: &[String]) -> usize {
    let mut groups: BTreeMap<(i64, String), Vec<usize>> = BTreeMap::new();
    for (index, strategy) in strategies.iter().enumerate() {
        if is_shield_candidate(strategy) {
            groups
                .entry((strategy.bk_biz_id, shield_key(strategy)))
                .or_default()
                .push(index);
        }
    }

    let mut changed = 0;
    for members in groups.values().filter(|members| members.len() > 1) {
        let shield = TargetShield::new(members.iter().map(|&i| &strategies[i]), mainline_levels);
        for &index in members {
            if shield.rewrite(&mut strategies[index]) {
                changed += 1;
            }
        }
    }
    changed
}

/// Shield state of one competing group.
#[derive(Debug)]
pub struct TargetShield {
    static_nodes: Vec<TargetValue>,
    dynamic_nodes: BTreeMap<String, BTreeSet<i64>>,
    levels_root_first: Vec<String>,
}

impl TargetShield {
    pub fn new<'a>(
        strategies: impl IntoIterator<Item = &'a Strategy>,
        mainline_levels: &[String],
    ) -> Self {
        let mut hosts: BTreeSet<(String, String, Option<i64>)> = BTreeSet::new();
        let mut dynamic_nodes: BTreeMap<String, BTreeSet<i64>> = BTreeMap::new();

        for strategy in strategies {
            let Some(target) = strategy.first_item().map(|item| &item.target) else {
                continue;
            };
            let Some(first) = target.first() else {
                continue;
            };
            if first.field.is_static_ip() {
                for value in &first.value {
                    let ip = value
                        .bk_target_ip
                        .clone()
                        .or_else(|| value.ip.clone())
                        .unwrap_or_default();
                    let cloud = value
                        .bk_target_cloud_id
                        .clone()
                        .or_else(|| value.bk_cloud_id.clone())
                        .unwrap_or_else(|| "0".to_string());
                    hosts.insert((ip, cloud, value.bk_host_id));
                }
            } else if first.field.is_topo() {
                for (obj, insts) in eq_buckets(target) {
                    dynamic_nodes.entry(obj).or_default().extend(insts);
                }
            }
        }

        let static_nodes = hosts
            .into_iter()
            .filter_map(|(ip, cloud, host_id)| {
                let mut value = if ip.is_empty() {
                    TargetValue::default()
                } else {
                    TargetValue::host(ip, cloud)
                };
                value.bk_host_id = host_id;
                (value != TargetValue::default()).then_some(value)
            })
            .collect();

        Self {
            static_nodes,
            dynamic_nodes,
            levels_root_first: mainline_levels.iter().rev().cloned().collect(),
        }
    }

    /// Rewrites the first item's target in place. Returns whether it changed.
    pub fn rewrite(&self, strategy: &mut Strategy) -> bool {
        let Some(item) = strategy.items.first_mut() else {
            return false;
        };
        let Some(first) = item.target.first() else {
            return false;
        };
        if first.field.is_static_ip() {
            return false;
        }

        let mut branches = if first.field.is_topo() {
            self.topo_branches(first.field.clone(), &item.target)
        } else {
            // opaque targets keep their own shape
            item.target
                .branches()
                .iter()
                .map(|branch| {
                    branch
                        .iter()
                        .filter(|c| !is_static_shield(c))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        if !self.static_nodes.is_empty() {
            for branch in &mut branches {
                branch.push(TargetCondition::new(
                    TargetField::BkTargetIp,
                    ConditionMethod::Neq,
                    self.static_nodes.clone(),
                ));
            }
        }

        let rewritten = Target::new(branches);
        if rewritten == item.target {
            return false;
        }
        item.target = rewritten;
        true
    }

    fn topo_branches(&self, field: TargetField, target: &Target) -> Vec<Vec<TargetCondition>> {
        let buckets = eq_buckets(target);
        if buckets.is_empty() {
            let all: Vec<TargetValue> = self
                .dynamic_nodes
                .iter()
                .flat_map(|(obj, insts)| insts.iter().map(move |inst| node_value(obj, *inst)))
                .collect();
            return vec![vec![TargetCondition::new(field, ConditionMethod::Neq, all)]];
        }

        buckets
            .into_iter()
            .map(|(obj, insts)| {
                let mut branch = vec![TargetCondition::new(
                    field.clone(),
                    ConditionMethod::Eq,
                    insts.iter().map(|inst| node_value(&obj, *inst)).collect(),
                )];
                let lower: Vec<TargetValue> = self
                    .levels_root_first
                    .iter()
                    .skip_while(|level| **level != obj)
                    .skip(1)
                    .filter_map(|level| self.dynamic_nodes.get(level).map(|insts| (level, insts)))
                    .flat_map(|(level, insts)| insts.iter().map(move |inst| node_value(level, *inst)))
                    .collect();
                if !lower.is_empty() {
                    branch.push(TargetCondition::new(field.clone(), ConditionMethod::Neq, lower));
                }
                branch
            })
            .collect()
    }
}

fn is_static_shield(condition: &TargetCondition) -> bool {
    condition.field.is_static_ip() && condition.method == ConditionMethod::Neq
}

fn node_value(obj: &str, inst: i64) -> TargetValue {
    TargetValue::node(&TopoNode::new(obj, inst))
}

/// Included topo nodes of a target grouped by object id, first-seen order.
fn eq_buckets(target: &Target) -> Vec<(String, Vec<i64>)> {
    let mut buckets: Vec<(String, Vec<i64>)> = Vec::new();
    for condition in target.conditions() {
        if !condition.field.is_topo() || !condition.is_eq() {
            continue;
        }
        for node in condition.value.iter().filter_map(TargetValue::topo_node) {
            match buckets.iter_mut().find(|(obj, _)| *obj == node.bk_obj_id) {
                Some((_, insts)) if insts.contains(&node.bk_inst_id) => {}
                Some((_, insts)) => insts.push(node.bk_inst_id),
                None => buckets.push((node.bk_obj_id, vec![node.bk_inst_id])),
            }
        }
    }
    buckets
}

/// Restricts a k8s strategy to the business's alert-enabled clusters. Only
/// builtin k8s tables (empty `result_table_id`) are restricted; an empty
/// cluster list adds nothing. The clause is ANDed on top of any cluster
/// condition the strategy already carries.
pub fn add_cluster_condition(strategy: &mut Strategy, cluster_ids: &[String]) -> bool {
    if cluster_ids.is_empty() {
        return false;
    }
    let builtin = strategy
        .items
        .iter()
        .flat_map(|item| item.query_configs.iter())
        .all(|query| query.result_table_id.is_empty());
    if !builtin {
        return false;
    }

    for query in strategy.items.iter_mut().flat_map(|item| item.query_configs.iter_mut()) {
        let clause = AggCondition {
            key: "bcs_cluster_id".to_string(),
            method: "eq".to_string(),
            value: json!(cluster_ids),
            condition: Some("and".to_string()),
        };
        if !query.agg_condition.contains(&clause) {
            query.agg_condition.push(clause);
        }
    }
    true
}
