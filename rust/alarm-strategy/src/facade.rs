//! Read-only collaborators: the config database, the metric registry and the
//! CMDB topology service.

use crate::error::{Result, StrategyError};
use crate::metric_id::MetricQuery;
use crate::models::serde_util::opt_string;
use crate::models::{HistoryRecord, HostKey, Strategy, TemplateKind, TopoNode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// A CMDB host with the topology nodes it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub bk_host_id: i64,
    #[serde(default)]
    pub bk_biz_id: i64,
    #[serde(default)]
    pub bk_host_innerip: String,
    #[serde(default, deserialize_with = "opt_string")]
    pub bk_cloud_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string")]
    pub bk_state: Option<String>,
    /// Every node on the host's path to the business root.
    #[serde(default)]
    pub topo: Vec<TopoNode>,
}

impl Host {
    pub fn key(&self) -> HostKey {
        HostKey {
            ip: (!self.bk_host_innerip.is_empty()).then(|| self.bk_host_innerip.clone()),
            cloud_id: Some(self.cloud_id().to_string()),
            host_id: Some(self.bk_host_id),
        }
    }

    pub fn cloud_id(&self) -> &str {
        self.bk_cloud_id.as_deref().unwrap_or("0")
    }

    pub fn topo_links(&self) -> Vec<String> {
        self.topo.iter().map(TopoNode::link).collect()
    }

    pub fn belongs_to(&self, node: &TopoNode) -> bool {
        self.topo.contains(node)
    }
}

#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Enabled strategies, optionally restricted to some businesses.
    async fn enabled_strategies(&self, biz_filter: Option<&[i64]>) -> Result<Vec<Strategy>>;

    /// Journal rows created strictly after `since` (epoch seconds).
    async fn strategy_history(&self, since: i64) -> Result<Vec<HistoryRecord>>;
}

#[async_trait]
pub trait MetricRegistry: Send + Sync {
    async fn exists(&self, bk_biz_id: i64, query: &MetricQuery) -> Result<bool>;
}

#[async_trait]
pub trait Cmdb: Send + Sync {
    async fn list_businesses(&self) -> Result<Vec<i64>>;

    /// Topo nodes contained in a set or service template.
    async fn template_nodes(&self, kind: TemplateKind, template_id: i64) -> Result<Vec<TopoNode>>;

    async fn topo_node_exists(&self, node: &TopoNode) -> Result<bool>;

    /// Main-line object ids ordered leaf to root, e.g. `module, set, biz`.
    async fn mainline_levels(&self) -> Result<Vec<String>>;

    async fn dynamic_group_hosts(&self, bk_biz_id: i64, group_id: &str) -> Result<Vec<i64>>;

    async fn get_host(&self, key: &HostKey) -> Result<Option<Host>>;

    async fn hosts_under(&self, bk_biz_id: i64, nodes: &[TopoNode]) -> Result<Vec<Host>>;

    async fn enabled_bcs_clusters(&self, bk_biz_id: i64) -> Result<Vec<String>>;

    async fn is_ipv6_biz(&self, bk_biz_id: i64) -> Result<bool>;
}

/// Runs one outbound call under a deadline, labelling a timeout with the
/// component that was called.
pub async fn with_deadline<T, F>(component: &'static str, deadline: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| StrategyError::Timeout { component })?
}
