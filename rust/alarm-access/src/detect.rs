//! Static-threshold detection, shared by the fused access path and the
//! standalone detect entrypoint so both emit the same anomalies.

use crate::error::Result;
use crate::keys;
use crate::record::RecordData;
use alarm_strategy::models::{AlgorithmType, Item, Strategy};
use alarm_strategy::StrategyReader;
use cache_backend::{CacheBackend, Pipeline};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub anomaly_id: String,
    pub strategy_id: i64,
    pub item_id: i64,
    pub level: i64,
    pub record_id: String,
    pub value: f64,
    pub dimensions: Map<String, Value>,
    pub time: i64,
    pub anomaly_message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Condition {
    method: String,
    threshold: f64,
}

impl Condition {
    fn holds(&self, value: f64) -> bool {
        match self.method.as_str() {
            "gt" => value > self.threshold,
            "gte" => value >= self.threshold,
            "lt" => value < self.threshold,
            "lte" => value <= self.threshold,
            "eq" => value == self.threshold,
            "neq" => value != self.threshold,
            _ => false,
        }
    }

    fn symbol(&self) -> &str {
        match self.method.as_str() {
            "gt" => ">",
            "gte" => ">=",
            "lt" => "<",
            "lte" => "<=",
            "eq" => "=",
            "neq" => "!=",
            other => other,
        }
    }
}

/// Threshold rules of one level: outer list OR, inner list AND.
#[derive(Debug, Clone, PartialEq)]
struct LevelRule {
    level: i64,
    branches: Vec<Vec<Condition>>,
}

impl LevelRule {
    fn parse(level: i64, config: &Value) -> Option<Self> {
        let raw = match config {
            Value::Object(map) => map.get("threshold")?.clone(),
            other => other.clone(),
        };
        let branches: Vec<Vec<Condition>> = match serde_json::from_value(raw.clone()) {
            Ok(branches) => branches,
            // a flat list is a single AND branch
            Err(_) => vec![serde_json::from_value(raw).ok()?],
        };
        Some(Self { level, branches })
    }

    fn matched_branch(&self, value: f64) -> Option<&[Condition]> {
        self.branches
            .iter()
            .find(|branch| !branch.is_empty() && branch.iter().all(|c| c.holds(value)))
            .map(Vec::as_slice)
    }
}

/// Evaluates an item's threshold algorithms, most severe level first.
#[derive(Debug, Clone)]
pub struct ThresholdDetector {
    strategy_id: i64,
    item_id: i64,
    rules: Vec<LevelRule>,
}

impl ThresholdDetector {
    pub fn new(strategy: &Strategy, item: &Item) -> Self {
        let mut rules: Vec<LevelRule> = item
            .algorithms
            .iter()
            .filter(|algorithm| algorithm.kind == AlgorithmType::Threshold)
            .filter_map(|algorithm| {
                let rule = LevelRule::parse(algorithm.level, &algorithm.config);
                if rule.is_none() {
                    warn!(strategy_id = strategy.id, item_id = item.id, "unreadable threshold config");
                }
                rule
            })
            .collect();
        rules.sort_by_key(|rule| rule.level);
        Self {
            strategy_id: strategy.id,
            item_id: item.id,
            rules,
        }
    }

    pub fn detect(&self, record: &RecordData) -> Option<Anomaly> {
        self.rules.iter().find_map(|rule| {
            let branch = rule.matched_branch(record.value)?;
            let message = branch
                .iter()
                .map(|c| format!("{} {}", c.symbol(), c.threshold))
                .collect::<Vec<_>>()
                .join(" and ");
            Some(Anomaly {
                anomaly_id: format!(
                    "{}.{}.{}.{}",
                    record.record_id, self.strategy_id, self.item_id, rule.level
                ),
                strategy_id: self.strategy_id,
                item_id: self.item_id,
                level: rule.level,
                record_id: record.record_id.clone(),
                value: record.value,
                dimensions: record.dimensions.clone(),
                time: record.time,
                anomaly_message: format!("value {} {}", record.value, message),
            })
        })
    }

    pub fn detect_all<'a>(&self, records: impl IntoIterator<Item = &'a RecordData>) -> Vec<Anomaly> {
        records.into_iter().filter_map(|record| self.detect(record)).collect()
    }
}

/// Appends anomalies to the item's queue and signals the trigger stage.
pub async fn push_anomalies(
    cache: &dyn CacheBackend,
    strategy_id: i64,
    item_id: i64,
    anomalies: &[Anomaly],
    ttl: Duration,
) -> Result<usize> {
    if anomalies.is_empty() {
        return Ok(0);
    }
    let key = keys::anomaly_list(strategy_id, item_id);
    let payload = anomalies
        .iter()
        .map(serde_json::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut pipe = Pipeline::new();
    pipe.rpush(key.clone(), payload);
    pipe.expire(key, ttl);
    pipe.rpush(keys::ANOMALY_SIGNAL, vec![format!("{strategy_id}.{item_id}")]);
    pipe.expire(keys::ANOMALY_SIGNAL, ttl);
    cache.execute(pipe).await?;
    Ok(anomalies.len())
}

/// Standalone detection over the queues the access stage fills.
pub struct DetectProcess {
    cache: Arc<dyn CacheBackend>,
    reader: StrategyReader,
    ttl: Duration,
}

impl DetectProcess {
    pub fn new(cache: Arc<dyn CacheBackend>, reader: StrategyReader, ttl: Duration) -> Self {
        Self { cache, reader, ttl }
    }

    /// Drains `data_signal` and every signalled `data_list`. Returns the number
    /// of anomalies pushed.
    pub async fn run_from_queue(&self) -> Result<usize> {
        let mut strategy_ids = BTreeSet::new();
        while let Some(raw) = self.cache.rpop(keys::DATA_SIGNAL).await? {
            match raw.trim().parse::<i64>() {
                Ok(strategy_id) => {
                    strategy_ids.insert(strategy_id);
                }
                Err(_) => warn!(signal = %raw, "ignoring malformed data signal"),
            }
        }

        let mut pushed = 0;
        for strategy_id in strategy_ids {
            let Some(strategy) = self.reader.strategy(strategy_id).await? else {
                debug!(strategy_id, "signalled strategy no longer cached");
                continue;
            };
            for item in &strategy.items {
                pushed += self.detect_item(&strategy, item).await?;
            }
        }
        Ok(pushed)
    }

    async fn detect_item(&self, strategy: &Strategy, item: &Item) -> Result<usize> {
        let key = keys::data_list(strategy.id, item.id);
        let raw = self.cache.lrange(&key, 0, -1).await?;
        if raw.is_empty() {
            return Ok(0);
        }
        self.cache.delete(&[key]).await?;

        let records: Vec<RecordData> = raw
            .iter()
            .filter_map(|blob| match serde_json::from_str(blob) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(strategy_id = strategy.id, error = %err, "skipping malformed record");
                    None
                }
            })
            .collect();
        let anomalies = ThresholdDetector::new(strategy, item).detect_all(&records);
        let pushed =
            push_anomalies(self.cache.as_ref(), strategy.id, item.id, &anomalies, self.ttl).await?;
        info!(
            strategy_id = strategy.id,
            item_id = item.id,
            records = records.len(),
            anomalies = pushed,
            "detect finished"
        );
        Ok(pushed)
    }
}
