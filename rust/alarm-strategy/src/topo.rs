//! Topology resolution: templates to nodes, nodes to hosts, hosts to their
//! topology links. Every lookup goes through a short-lived read-through cache.

use crate::error::Result;
use crate::facade::{with_deadline, Cmdb, Host};
use crate::models::{HostKey, TemplateKind, TopoNode};
use crate::ttl_cache::TtlCache;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Dimensions a host expansion knows how to fill.
pub const HOST_DIMENSIONS: [&str; 6] = [
    "bk_target_ip",
    "bk_target_cloud_id",
    "bk_host_id",
    "ip",
    "bk_cloud_id",
    "bk_topo_node",
];

type ExpansionKey = (i64, Vec<TopoNode>, Vec<String>);

pub struct TopologyResolver {
    cmdb: Arc<dyn Cmdb>,
    call_timeout: Duration,
    templates: TtlCache<(TemplateKind, i64), Vec<TopoNode>>,
    node_exists: TtlCache<TopoNode, bool>,
    levels: TtlCache<(), Vec<String>>,
    hosts: TtlCache<HostKey, Option<Host>>,
    dynamic_groups: TtlCache<(i64, String), Vec<i64>>,
    ipv6_biz: TtlCache<i64, bool>,
    expansions: TtlCache<ExpansionKey, Option<Vec<Map<String, Value>>>>,
}

impl TopologyResolver {
    pub fn new(cmdb: Arc<dyn Cmdb>, ttl: Duration, call_timeout: Duration) -> Self {
        Self {
            cmdb,
            call_timeout,
            templates: TtlCache::new(ttl),
            node_exists: TtlCache::new(ttl),
            levels: TtlCache::new(ttl),
            hosts: TtlCache::new(ttl),
            dynamic_groups: TtlCache::new(ttl),
            ipv6_biz: TtlCache::new(ttl),
            expansions: TtlCache::new(ttl),
        }
    }

    pub fn cmdb(&self) -> &Arc<dyn Cmdb> {
        &self.cmdb
    }

    /// Union of the topo nodes of the given templates, first-seen order.
    /// Empty when every template resolves to nothing.
    pub async fn expand_templates(&self, kind: TemplateKind, template_ids: &[i64]) -> Result<Vec<TopoNode>> {
        let mut seen = BTreeSet::new();
        let mut nodes = Vec::new();
        for &template_id in template_ids {
            let expanded = self
                .templates
                .get_or_load((kind, template_id), || {
                    with_deadline(
                        "cmdb",
                        self.call_timeout,
                        self.cmdb.template_nodes(kind, template_id),
                    )
                })
                .await?;
            for node in expanded {
                if seen.insert(node.clone()) {
                    nodes.push(node);
                }
            }
        }
        Ok(nodes)
    }

    /// A node list is valid when at least one of its nodes still exists.
    pub async fn nodes_valid(&self, nodes: &[TopoNode]) -> Result<bool> {
        for node in nodes {
            let exists = self
                .node_exists
                .get_or_load(node.clone(), || {
                    with_deadline("cmdb", self.call_timeout, self.cmdb.topo_node_exists(node))
                })
                .await?;
            if exists {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Main-line levels, leaf first.
    pub async fn mainline_levels(&self) -> Result<Vec<String>> {
        self.levels
            .get_or_load((), || {
                with_deadline("cmdb", self.call_timeout, self.cmdb.mainline_levels())
            })
            .await
    }

    pub async fn host(&self, key: &HostKey) -> Result<Option<Host>> {
        self.hosts
            .get_or_load(key.clone(), || {
                with_deadline("cmdb", self.call_timeout, self.cmdb.get_host(key))
            })
            .await
    }

    /// `obj|inst` links of every node above the host, empty for unknown hosts.
    pub async fn host_topo_links(&self, key: &HostKey) -> Result<Vec<String>> {
        Ok(self
            .host(key)
            .await?
            .map(|host| host.topo_links())
            .unwrap_or_default())
    }

    pub async fn dynamic_group_hosts(&self, bk_biz_id: i64, group_id: &str) -> Result<Vec<i64>> {
        self.dynamic_groups
            .get_or_load((bk_biz_id, group_id.to_string()), || {
                with_deadline(
                    "cmdb",
                    self.call_timeout,
                    self.cmdb.dynamic_group_hosts(bk_biz_id, group_id),
                )
            })
            .await
    }

    pub async fn is_ipv6_biz(&self, bk_biz_id: i64) -> Result<bool> {
        self.ipv6_biz
            .get_or_load(bk_biz_id, || {
                with_deadline("cmdb", self.call_timeout, self.cmdb.is_ipv6_biz(bk_biz_id))
            })
            .await
    }

    /// Expands topo nodes into one dimension map per host underneath them.
    ///
    /// Returns `None` when the expansion cannot be done (no nodes, or a wanted
    /// dimension hosts do not carry), meaning callers should not filter on it.
    /// Hosts missing a wanted value are left out.
    pub async fn expand(
        &self,
        bk_biz_id: i64,
        nodes: &[TopoNode],
        wanted_dimensions: &[&str],
    ) -> Result<Option<Vec<Map<String, Value>>>> {
        if nodes.is_empty()
            || wanted_dimensions
                .iter()
                .any(|dim| !HOST_DIMENSIONS.contains(dim))
        {
            return Ok(None);
        }

        let mut sorted_nodes = nodes.to_vec();
        sorted_nodes.sort();
        let mut dims: Vec<String> = wanted_dimensions.iter().map(|d| d.to_string()).collect();
        dims.sort();
        let key = (bk_biz_id, sorted_nodes.clone(), dims);

        let (cmdb, deadline, nodes) = (&self.cmdb, self.call_timeout, &sorted_nodes);
        self.expansions
            .get_or_load(key, || async move {
                let hosts =
                    with_deadline("cmdb", deadline, cmdb.hosts_under(bk_biz_id, nodes)).await?;
                let instances = hosts
                    .iter()
                    .filter_map(|host| host_dimensions(host, wanted_dimensions))
                    .collect();
                Ok(Some(instances))
            })
            .await
    }
}

fn host_dimensions(host: &Host, wanted: &[&str]) -> Option<Map<String, Value>> {
    let mut dims = Map::new();
    for &dim in wanted {
        let value = match dim {
            "bk_target_ip" | "ip" => {
                if host.bk_host_innerip.is_empty() {
                    return None;
                }
                json!(host.bk_host_innerip)
            }
            "bk_target_cloud_id" | "bk_cloud_id" => json!(host.cloud_id()),
            "bk_host_id" => json!(host.bk_host_id.to_string()),
            "bk_topo_node" => json!(host.topo_links()),
            _ => return None,
        };
        dims.insert(dim.to_string(), value);
    }
    Some(dims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Snapshot, SnapshotSource};
    use pretty_assertions::assert_eq;

    fn resolver() -> TopologyResolver {
        let snapshot: Snapshot = serde_json::from_value(json!({
            "hosts": [
                {"bk_host_id": 1, "bk_biz_id": 2, "bk_host_innerip": "10.0.0.1", "bk_cloud_id": 0,
                 "topo": [{"bk_obj_id": "module", "bk_inst_id": 5}, {"bk_obj_id": "set", "bk_inst_id": 3}]},
                {"bk_host_id": 2, "bk_biz_id": 2, "bk_host_innerip": "",
                 "topo": [{"bk_obj_id": "module", "bk_inst_id": 5}]}
            ],
            "set_templates": {"1": [{"bk_obj_id": "set", "bk_inst_id": 3}], "2": []}
        }))
        .unwrap();
        TopologyResolver::new(
            Arc::new(SnapshotSource::new(snapshot)),
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn expands_templates_and_checks_nodes() {
        let resolver = resolver();
        let nodes = resolver.expand_templates(TemplateKind::Set, &[1, 2, 1]).await.unwrap();
        assert_eq!(nodes, vec![TopoNode::new("set", 3)]);
        assert!(resolver
            .expand_templates(TemplateKind::Set, &[2])
            .await
            .unwrap()
            .is_empty());

        assert!(resolver
            .nodes_valid(&[TopoNode::new("module", 99), TopoNode::new("module", 5)])
            .await
            .unwrap());
        assert!(!resolver.nodes_valid(&[TopoNode::new("module", 99)]).await.unwrap());
    }

    #[tokio::test]
    async fn expansion_drops_hosts_without_needed_fields() {
        let resolver = resolver();
        let expanded = resolver
            .expand(2, &[TopoNode::new("module", 5)], &["bk_target_ip", "bk_target_cloud_id"])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0]["bk_target_ip"], json!("10.0.0.1"));

        let by_id = resolver
            .expand(2, &[TopoNode::new("module", 5)], &["bk_host_id"])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_id.len(), 2);

        assert_eq!(resolver.expand(2, &[], &["bk_host_id"]).await.unwrap(), None);
        assert_eq!(
            resolver
                .expand(2, &[TopoNode::new("module", 5)], &["container_id"])
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn host_links_come_from_cmdb() {
        let resolver = resolver();
        let links = resolver
            .host_topo_links(&HostKey::by_ip("10.0.0.1", "0"))
            .await
            .unwrap();
        assert_eq!(links, vec!["module|5".to_string(), "set|3".to_string()]);
        assert!(resolver
            .host_topo_links(&HostKey::by_ip("10.9.9.9", "0"))
            .await
            .unwrap()
            .is_empty());
    }
}
