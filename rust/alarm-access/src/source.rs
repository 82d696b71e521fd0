//! Data backend seam: one compound query per strategy group.

use crate::error::{AccessError, Result};
use alarm_strategy::models::QueryConfig;
use alarm_strategy::SnapshotSource;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What a group asks the data backend for.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupQuery {
    pub group_key: String,
    pub bk_biz_id: i64,
    pub query_configs: Vec<QueryConfig>,
    pub interval: i64,
    /// Inclusive lower bound, epoch seconds.
    pub from: i64,
    /// Exclusive upper bound, epoch seconds.
    pub until: i64,
}

/// One row returned by the data backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPoint {
    #[serde(default)]
    pub dimensions: Map<String, Value>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub values: Map<String, Value>,
    pub time: i64,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn query(&self, query: &GroupQuery) -> Result<Vec<RawPoint>>;
}

#[derive(Deserialize)]
struct StoredPoint {
    metric_id: String,
    #[serde(default)]
    bk_biz_id: Option<i64>,
    #[serde(flatten)]
    point: RawPoint,
}

#[async_trait]
impl DataSource for SnapshotSource {
    async fn query(&self, query: &GroupQuery) -> Result<Vec<RawPoint>> {
        let mut points = Vec::new();
        for raw in self.points() {
            let stored: StoredPoint = serde_json::from_value(raw)
                .map_err(|err| AccessError::data_source(format!("malformed point: {err}")))?;
            let wanted = query
                .query_configs
                .iter()
                .any(|config| config.metric_id == stored.metric_id);
            let same_biz = stored.bk_biz_id.map_or(true, |biz| biz == query.bk_biz_id);
            let in_window = stored.point.time >= query.from && stored.point.time < query.until;
            if wanted && same_biz && in_window {
                points.push(stored.point);
            }
        }
        points.sort_by_key(|point| point.time);
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alarm_strategy::models::{DataSourceLabel, DataTypeLabel};
    use alarm_strategy::Snapshot;
    use serde_json::json;

    #[tokio::test]
    async fn snapshot_points_are_filtered_by_metric_and_window() {
        let snapshot: Snapshot = serde_json::from_value(json!({
            "points": [
                {"metric_id": "bk_monitor.system.cpu_load.load5", "dimensions": {"bk_target_ip": "127.0.0.1"}, "value": 1.5, "time": 120},
                {"metric_id": "bk_monitor.system.cpu_load.load5", "value": 2.0, "time": 60},
                {"metric_id": "bk_monitor.system.cpu_load.load5", "value": 2.0, "time": 180},
                {"metric_id": "bk_monitor.system.mem.pct_used", "value": 3.0, "time": 120}
            ]
        }))
        .unwrap();
        let source = SnapshotSource::new(snapshot);
        let query = GroupQuery {
            group_key: "g".into(),
            bk_biz_id: 2,
            query_configs: vec![QueryConfig::new(
                DataSourceLabel::BkMonitor,
                DataTypeLabel::TimeSeries,
                "bk_monitor.system.cpu_load.load5",
            )],
            interval: 60,
            from: 60,
            until: 180,
        };

        let points = source.query(&query).await.unwrap();
        assert_eq!(points.iter().map(|p| p.time).collect::<Vec<_>>(), vec![60, 120]);
        assert_eq!(points[1].dimensions["bk_target_ip"], json!("127.0.0.1"));
    }
}
