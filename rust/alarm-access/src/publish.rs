//! Hand-off of retained records to the detect stage.

use crate::config::AccessConfig;
use crate::detect::{push_anomalies, ThresholdDetector};
use crate::error::Result;
use crate::keys;
use crate::metrics::ACCESS_QUEUE_FULL_TOTAL;
use crate::noise;
use crate::record::{AccessItem, DataRecord, RecordData};
use cache_backend::{CacheBackend, Pipeline};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const NO_DATA_LIST_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PushReport {
    /// Records appended to `data_list` queues, counted per item.
    pub pushed: usize,
    pub anomalies: usize,
    pub strategy_ids: BTreeSet<i64>,
}

impl PushReport {
    pub fn absorb(&mut self, other: PushReport) {
        self.pushed += other.pushed;
        self.anomalies += other.anomalies;
        self.strategy_ids.extend(other.strategy_ids);
    }
}

pub struct Publisher {
    cache: Arc<dyn CacheBackend>,
    config: Arc<AccessConfig>,
}

impl Publisher {
    pub fn new(cache: Arc<dyn CacheBackend>, config: Arc<AccessConfig>) -> Self {
        Self { cache, config }
    }

    /// Queues retained records per item and signals the detect stage.
    pub async fn push_data(&self, items: &[AccessItem], records: &[DataRecord]) -> Result<PushReport> {
        let mut report = PushReport::default();
        let mut pipe = Pipeline::new();
        let mut touched = Vec::new();
        for item in items {
            let payload = retained_payload(item, records)?;
            if payload.is_empty() {
                continue;
            }
            let key = keys::data_list(item.strategy_id(), item.item_id());
            let interval = item.item.min_interval().unwrap_or(0).max(0) as u64;
            let ttl = self.config.data_list_ttl.max(Duration::from_secs(interval * 5));
            report.pushed += payload.len();
            report.strategy_ids.insert(item.strategy_id());
            pipe.rpush(key.clone(), payload);
            pipe.expire(key.clone(), ttl);
            touched.push(key);
        }
        if report.strategy_ids.is_empty() {
            return Ok(report);
        }
        let signals = report.strategy_ids.iter().map(i64::to_string).collect();
        pipe.rpush(keys::DATA_SIGNAL, signals);
        pipe.expire(keys::DATA_SIGNAL, self.config.data_list_ttl);
        self.cache.execute(pipe).await?;

        for key in touched {
            self.guard_queue(&key).await?;
        }
        Ok(report)
    }

    /// Runs threshold detection in-process and queues anomalies directly.
    pub async fn push_detected(&self, items: &[AccessItem], records: &[DataRecord]) -> Result<PushReport> {
        let mut report = PushReport::default();
        for item in items {
            let retained: Vec<&RecordData> = records
                .iter()
                .filter(|record| record.is_retained(item.item_id()))
                .map(|record| &record.data)
                .collect();
            if retained.is_empty() {
                continue;
            }
            let detector = ThresholdDetector::new(&item.strategy, &item.item);
            let anomalies = detector.detect_all(retained);
            report.anomalies += push_anomalies(
                self.cache.as_ref(),
                item.strategy_id(),
                item.item_id(),
                &anomalies,
                self.config.data_list_ttl,
            )
            .await?;
            report.strategy_ids.insert(item.strategy_id());
        }
        Ok(report)
    }

    /// Feeds the no-data detector for items that watch for missing data.
    /// Every de-duplicated record counts as data seen, retained or not.
    pub async fn push_no_data(&self, items: &[AccessItem], records: &[DataRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let payload = records
            .iter()
            .map(|record| serde_json::to_string(&record.data))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut pipe = Pipeline::new();
        let mut pushed = 0;
        for item in items.iter().filter(|item| item.item.no_data_enabled()) {
            let payload = payload.clone();
            let key = keys::no_data_list(item.strategy_id(), item.item_id());
            pushed += payload.len();
            pipe.rpush(key.clone(), payload);
            pipe.expire(key, NO_DATA_LIST_TTL);
        }
        if !pipe.is_empty() {
            self.cache.execute(pipe).await?;
        }
        Ok(pushed)
    }

    /// Records which dimension combinations each noise-reduced strategy saw.
    pub async fn push_noise(&self, items: &[AccessItem], records: &[DataRecord]) -> Result<()> {
        let mut members: BTreeMap<String, Vec<(f64, String)>> = BTreeMap::new();
        let mut seen = BTreeSet::new();
        for item in items {
            if !seen.insert(item.strategy_id()) {
                continue;
            }
            let Some(reduce) = item.strategy.notice.noise_reduce() else {
                continue;
            };
            if reduce.dimensions.is_empty() {
                continue;
            }
            let strategy_items: Vec<i64> = items
                .iter()
                .filter(|other| other.strategy_id() == item.strategy_id())
                .map(AccessItem::item_id)
                .collect();
            let key = keys::noise_reduce(item.strategy_id(), &noise::dimension_hash(&reduce.dimensions));
            let entry = members.entry(key).or_default();
            for record in records {
                if strategy_items.iter().any(|id| record.is_retained(*id)) {
                    entry.push((record.time() as f64, noise::record_member(record, &reduce.dimensions)));
                }
            }
        }

        let mut pipe = Pipeline::new();
        for (key, entries) in members.into_iter().filter(|(_, entries)| !entries.is_empty()) {
            pipe.zadd(key.clone(), entries);
            pipe.expire(key, self.config.data_list_ttl);
        }
        if !pipe.is_empty() {
            self.cache.execute(pipe).await?;
        }
        Ok(())
    }

    /// Keeps the newest `max_queue_length` entries of an overflowing queue.
    async fn guard_queue(&self, key: &str) -> Result<()> {
        let max = self.config.max_queue_length;
        let len = self.cache.llen(key).await?;
        if len <= max {
            return Ok(());
        }
        warn!(key, len, max, "detect queue full, dropping oldest records");
        ACCESS_QUEUE_FULL_TOTAL.inc();
        self.cache.ltrim(key, -(max as isize), -1).await?;
        debug!(key, "detect queue trimmed");
        Ok(())
    }
}

fn retained_payload(item: &AccessItem, records: &[DataRecord]) -> Result<Vec<String>> {
    records
        .iter()
        .filter(|record| record.is_retained(item.item_id()))
        .map(|record| serde_json::to_string(&record.data).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RawPoint;
    use alarm_strategy::models::{DataSourceLabel, DataTypeLabel, Item, QueryConfig, Strategy};
    use cache_backend::MemoryCache;
    use serde_json::json;

    fn items() -> Vec<AccessItem> {
        let query = QueryConfig::new(DataSourceLabel::BkMonitor, DataTypeLabel::TimeSeries, "m");
        let strategy = Arc::new(Strategy::new(1, 2, vec![Item::new(1, vec![query], Vec::new())]));
        vec![AccessItem {
            item: strategy.items[0].clone(),
            strategy,
        }]
    }

    fn record(items: &[AccessItem], time: i64) -> DataRecord {
        let point: RawPoint = serde_json::from_value(json!({
            "dimensions": {"bk_target_ip": "127.0.0.1"},
            "value": 1.0,
            "time": time
        }))
        .unwrap();
        DataRecord::new(items, point).unwrap()
    }

    #[tokio::test]
    async fn overflowing_queue_keeps_newest_records() {
        let cache = Arc::new(MemoryCache::new());
        let config = AccessConfig {
            max_queue_length: 2,
            ..AccessConfig::default()
        };
        let publisher = Publisher::new(cache.clone(), Arc::new(config));
        let items = items();
        let records: Vec<_> = (1..=3).map(|n| record(&items, n * 60)).collect();

        let report = publisher.push_data(&items, &records).await.unwrap();
        assert_eq!(report.pushed, 3);

        let queued = cache.lrange("data_list:1:1", 0, -1).await.unwrap();
        assert_eq!(queued.len(), 2);
        let first: RecordData = serde_json::from_str(&queued[0]).unwrap();
        assert_eq!(first.time, 120);
        assert_eq!(cache.lrange(keys::DATA_SIGNAL, 0, -1).await.unwrap(), vec!["1"]);
    }

    #[tokio::test]
    async fn unretained_records_are_not_queued() {
        let cache = Arc::new(MemoryCache::new());
        let publisher = Publisher::new(cache.clone(), Arc::new(AccessConfig::default()));
        let items = items();
        let mut dropped = record(&items, 60);
        dropped.clear_retains();

        let report = publisher.push_data(&items, &[dropped]).await.unwrap();
        assert_eq!(report, PushReport::default());
        assert_eq!(cache.llen(keys::DATA_SIGNAL).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn no_data_list_sees_unretained_records() {
        let cache = Arc::new(MemoryCache::new());
        let publisher = Publisher::new(cache.clone(), Arc::new(AccessConfig::default()));
        let mut items = items();
        let mut item = items[0].item.clone();
        item.no_data_config = serde_json::from_value(json!({"is_enabled": true, "continuous": 5})).unwrap();
        items[0].item = item;
        let kept = record(&items, 60);
        let mut out_of_range = record(&items, 120);
        out_of_range.clear_retains();

        assert_eq!(publisher.push_no_data(&items, &[kept, out_of_range]).await.unwrap(), 2);
        assert_eq!(cache.llen("no_data_list:1:1").await.unwrap(), 2);
    }
}
