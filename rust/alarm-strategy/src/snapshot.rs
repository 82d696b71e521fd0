//! File-backed implementation of the read-only collaborators. One JSON
//! document describes the config database, the metric registry and the CMDB.

use crate::error::{Result, StrategyError};
use crate::facade::{Cmdb, ConfigSource, Host, MetricRegistry};
use crate::metric_id::{parse_metric_id, MetricQuery};
use crate::models::{DataTypeLabel, HistoryRecord, HostKey, Strategy, TemplateKind, TopoNode};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub businesses: Vec<i64>,
    #[serde(default)]
    pub strategies: Vec<Strategy>,
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    /// Registered metric ids.
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub topo_nodes: Vec<TopoNode>,
    /// Main-line object ids, leaf first. Defaults to `module, set, biz`.
    #[serde(default)]
    pub mainline_levels: Vec<String>,
    #[serde(default)]
    pub set_templates: HashMap<String, Vec<TopoNode>>,
    #[serde(default)]
    pub service_templates: HashMap<String, Vec<TopoNode>>,
    #[serde(default)]
    pub dynamic_groups: HashMap<String, Vec<i64>>,
    #[serde(default)]
    pub bcs_clusters: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub ipv6_biz_ids: Vec<i64>,
    /// Raw data points served to the access stage, matched by `metric_id`.
    #[serde(default)]
    pub points: Vec<Value>,
}

/// Shared, mutable view over a [`Snapshot`].
#[derive(Debug, Default)]
pub struct SnapshotSource {
    inner: RwLock<Snapshot>,
}

impl SnapshotSource {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            StrategyError::InvalidInput(format!("cannot read snapshot {}: {err}", path.display()))
        })?;
        let snapshot: Snapshot = serde_json::from_str(&raw)?;
        debug!(
            path = %path.display(),
            strategies = snapshot.strategies.len(),
            hosts = snapshot.hosts.len(),
            "loaded snapshot"
        );
        Ok(Self::new(snapshot))
    }

    /// Applies `change` to the underlying snapshot.
    pub fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut Snapshot),
    {
        change(&mut self.inner.write());
    }

    pub fn read<T, F>(&self, view: F) -> T
    where
        F: FnOnce(&Snapshot) -> T,
    {
        view(&self.inner.read())
    }

    pub fn points(&self) -> Vec<Value> {
        self.inner.read().points.clone()
    }
}

#[async_trait]
impl ConfigSource for SnapshotSource {
    async fn enabled_strategies(&self, biz_filter: Option<&[i64]>) -> Result<Vec<Strategy>> {
        let snapshot = self.inner.read();
        Ok(snapshot
            .strategies
            .iter()
            .filter(|s| s.is_enabled)
            .filter(|s| biz_filter.map_or(true, |bizs| bizs.contains(&s.bk_biz_id)))
            .cloned()
            .collect())
    }

    async fn strategy_history(&self, since: i64) -> Result<Vec<HistoryRecord>> {
        let snapshot = self.inner.read();
        let mut rows: Vec<HistoryRecord> = snapshot
            .history
            .iter()
            .filter(|row| row.create_time > since)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.create_time);
        Ok(rows)
    }
}

#[async_trait]
impl MetricRegistry for SnapshotSource {
    async fn exists(&self, _bk_biz_id: i64, query: &MetricQuery) -> Result<bool> {
        let snapshot = self.inner.read();
        if query.data_type_label == DataTypeLabel::Alert {
            // alert metrics point at a parent strategy
            let parent = query.metric_field.as_deref().and_then(|f| f.parse::<i64>().ok());
            if let Some(parent) = parent {
                return Ok(snapshot.strategies.iter().any(|s| s.id == parent));
            }
        }
        Ok(snapshot
            .metrics
            .iter()
            .filter_map(|metric_id| parse_metric_id(metric_id))
            .any(|registered| registered == *query))
    }
}

#[async_trait]
impl Cmdb for SnapshotSource {
    async fn list_businesses(&self) -> Result<Vec<i64>> {
        Ok(self.inner.read().businesses.clone())
    }

    async fn template_nodes(&self, kind: TemplateKind, template_id: i64) -> Result<Vec<TopoNode>> {
        let snapshot = self.inner.read();
        let templates = match kind {
            TemplateKind::Set => &snapshot.set_templates,
            TemplateKind::Service => &snapshot.service_templates,
        };
        Ok(templates
            .get(&template_id.to_string())
            .cloned()
            .unwrap_or_default())
    }

    async fn topo_node_exists(&self, node: &TopoNode) -> Result<bool> {
        let snapshot = self.inner.read();
        Ok(snapshot.topo_nodes.contains(node)
            || snapshot.hosts.iter().any(|host| host.belongs_to(node)))
    }

    async fn mainline_levels(&self) -> Result<Vec<String>> {
        let levels = self.inner.read().mainline_levels.clone();
        if levels.is_empty() {
            return Ok(vec!["module".into(), "set".into(), "biz".into()]);
        }
        Ok(levels)
    }

    async fn dynamic_group_hosts(&self, _bk_biz_id: i64, group_id: &str) -> Result<Vec<i64>> {
        Ok(self
            .inner
            .read()
            .dynamic_groups
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_host(&self, key: &HostKey) -> Result<Option<Host>> {
        Ok(self
            .inner
            .read()
            .hosts
            .iter()
            .find(|host| host.key().matches(key))
            .cloned())
    }

    async fn hosts_under(&self, bk_biz_id: i64, nodes: &[TopoNode]) -> Result<Vec<Host>> {
        Ok(self
            .inner
            .read()
            .hosts
            .iter()
            .filter(|host| host.bk_biz_id == bk_biz_id)
            .filter(|host| nodes.iter().any(|node| host.belongs_to(node)))
            .cloned()
            .collect())
    }

    async fn enabled_bcs_clusters(&self, bk_biz_id: i64) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .bcs_clusters
            .get(&bk_biz_id.to_string())
            .cloned()
            .unwrap_or_default())
    }

    async fn is_ipv6_biz(&self, bk_biz_id: i64) -> Result<bool> {
        Ok(self.inner.read().ipv6_biz_ids.contains(&bk_biz_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn sample() -> Snapshot {
        serde_json::from_value(json!({
            "businesses": [2],
            "metrics": ["bk_monitor.system.cpu_load.load5"],
            "hosts": [{
                "bk_host_id": 1,
                "bk_biz_id": 2,
                "bk_host_innerip": "127.0.0.1",
                "bk_cloud_id": 0,
                "topo": [{"bk_obj_id": "module", "bk_inst_id": 5}, {"bk_obj_id": "set", "bk_inst_id": 3}]
            }],
            "set_templates": {"9": [{"bk_obj_id": "set", "bk_inst_id": 3}]}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn answers_cmdb_queries() {
        let source = SnapshotSource::new(sample());
        assert!(source.topo_node_exists(&TopoNode::new("module", 5)).await.unwrap());
        assert!(!source.topo_node_exists(&TopoNode::new("module", 6)).await.unwrap());
        assert_eq!(
            source.template_nodes(TemplateKind::Set, 9).await.unwrap(),
            vec![TopoNode::new("set", 3)]
        );
        let host = source
            .get_host(&HostKey::by_ip("127.0.0.1", "0"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(host.bk_host_id, 1);
        assert_eq!(source.mainline_levels().await.unwrap()[0], "module");
    }

    #[tokio::test]
    async fn registry_matches_parsed_metric_ids() {
        let source = SnapshotSource::new(sample());
        let known = parse_metric_id("bk_monitor.system.cpu_load.load5").unwrap();
        let unknown = parse_metric_id("bk_monitor.system.cpu_load.load15").unwrap();
        assert!(source.exists(2, &known).await.unwrap());
        assert!(!source.exists(2, &unknown).await.unwrap());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&sample()).unwrap()).unwrap();
        let source = SnapshotSource::load(file.path()).unwrap();
        assert_eq!(source.read(|s| s.businesses.clone()), vec![2]);
    }
}
