//! Access orchestration for one strategy group: pull, filter, hand off.

use crate::batch::{decode_shard, encode_shard, limit_time_points, split_points, BatchResult};
use crate::checkpoint::{query_window, Checkpoint};
use crate::config::AccessConfig;
use crate::error::{AccessError, Result};
use crate::filters::{
    DuplicateFilter, ExpireFilter, FilterChain, HostStatusFilter, RangeFilter, RecordFilter,
};
use crate::keys;
use crate::lock::GroupLock;
use crate::metrics::{observe_process, record_count};
use crate::priority::PriorityChecker;
use crate::publish::Publisher;
use crate::record::{AccessItem, DataRecord};
use crate::source::{DataSource, GroupQuery, RawPoint};
use alarm_strategy::{StrategyReader, TopologyResolver};
use cache_backend::CacheBackend;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const BATCH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What one `process` call did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    pub group: String,
    pub pulled: usize,
    pub none_value: usize,
    /// Records removed by stage: `expired`, `duplicate`, `out_of_range`,
    /// `disabled_host`, `inhibited`, `error`.
    pub dropped: BTreeMap<&'static str, usize>,
    pub pushed: usize,
    pub anomalies: usize,
    pub no_data: usize,
    pub merged: bool,
    /// Shards handed to background workers.
    pub shards: usize,
    pub last_time: Option<i64>,
}

impl ProcessReport {
    fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            ..Self::default()
        }
    }

    pub fn dropped(&self, stage: &str) -> usize {
        self.dropped.get(stage).copied().unwrap_or(0)
    }

    fn drop_record(&mut self, stage: &'static str) {
        *self.dropped.entry(stage).or_default() += 1;
    }

    fn see_time(&mut self, time: i64) {
        self.last_time = Some(self.last_time.map_or(time, |last| last.max(time)));
    }

    fn absorb(&mut self, other: ProcessReport) {
        self.none_value += other.none_value;
        for (stage, count) in other.dropped {
            *self.dropped.entry(stage).or_default() += count;
        }
        self.pushed += other.pushed;
        self.anomalies += other.anomalies;
        self.no_data += other.no_data;
        if let Some(time) = other.last_time {
            self.see_time(time);
        }
    }
}

/// Everything a pull needs to know about its group.
#[derive(Debug, Clone)]
struct GroupPlan {
    group: String,
    bk_biz_id: i64,
    items: Arc<Vec<AccessItem>>,
    interval: i64,
    merged: bool,
    /// Only time-series pulls are capped by `max_time_points`.
    time_series: bool,
}

impl GroupPlan {
    fn mode(&self) -> &'static str {
        if self.merged {
            "merged"
        } else {
            "access"
        }
    }
}

#[derive(Clone)]
pub struct AccessDataProcessor {
    config: Arc<AccessConfig>,
    cache: Arc<dyn CacheBackend>,
    reader: StrategyReader,
    topo: Arc<TopologyResolver>,
    source: Arc<dyn DataSource>,
}

impl AccessDataProcessor {
    pub fn new(
        config: Arc<AccessConfig>,
        cache: Arc<dyn CacheBackend>,
        reader: StrategyReader,
        topo: Arc<TopologyResolver>,
        source: Arc<dyn DataSource>,
    ) -> Self {
        Self {
            config,
            cache,
            reader,
            topo,
            source,
        }
    }

    pub fn config(&self) -> &AccessConfig {
        &self.config
    }

    pub fn reader(&self) -> &StrategyReader {
        &self.reader
    }

    pub async fn process(&self, group: &str) -> Result<ProcessReport> {
        self.process_at(group, chrono::Utc::now().timestamp()).await
    }

    /// Processes `group` as if the clock read `now`. Fails with
    /// [`AccessError::Locked`] when another worker holds the group.
    pub async fn process_at(&self, group: &str, now: i64) -> Result<ProcessReport> {
        let lock = GroupLock::acquire(self.cache.clone(), group, self.config.lock_ttl).await?;
        let result = self.process_locked(group, now).await;
        lock.release().await;
        result
    }

    async fn process_locked(&self, group: &str, now: i64) -> Result<ProcessReport> {
        let started = Instant::now();
        let mut report = ProcessReport::new(group);
        let Some(plan) = self.plan(group).await? else {
            debug!(group, "no live strategies in group");
            return Ok(report);
        };
        report.merged = plan.merged;

        let checkpoint = Checkpoint::new(self.cache.clone(), group);
        let last_checkpoint = checkpoint.get().await?;
        let (from, until) = query_window(
            now,
            last_checkpoint,
            plan.interval,
            self.config.window_count,
            self.config.time_delay,
            self.config.expire,
        );
        if from >= until {
            debug!(group, from, until, "empty query window");
            return Ok(report);
        }

        let query = GroupQuery {
            group_key: group.to_string(),
            bk_biz_id: plan.bk_biz_id,
            query_configs: plan
                .items
                .iter()
                .flat_map(|item| item.item.query_configs.iter().cloned())
                .collect(),
            interval: plan.interval,
            from,
            until,
        };
        let points = self.source.query(&query).await?;
        report.pulled = points.len();
        record_count(group, "pulled", points.len());

        let (points, limited_at) = if plan.time_series {
            limit_time_points(
                points,
                self.config.max_time_points,
                last_checkpoint.unwrap_or(i64::MIN),
            )
        } else {
            (points, None)
        };
        if let Some(last_time) = limited_at {
            info!(group, last_time, kept = points.len(), "time points limited");
        }

        let threshold = self.config.batch_threshold;
        let mode = if threshold > 0 && points.len() > threshold {
            let mut shards = split_points(points, self.config.batch_size).into_iter();
            let own = shards.next().unwrap_or_default();
            let dispatched = self.dispatch_shards(&plan, now, shards.collect()).await?;
            report.shards = dispatched;
            report.absorb(self.handle_points(&plan, now, own).await?);
            for result in self.collect_batch(group, now, dispatched).await? {
                if !result.result {
                    warn!(group, sub_task_id = %result.sub_task_id, error = %result.error, "batch shard failed");
                    continue;
                }
                report.pushed += result.pushed;
                if result.last_time > 0 {
                    report.see_time(result.last_time);
                }
            }
            "batch"
        } else {
            report.absorb(self.handle_points(&plan, now, points).await?);
            plan.mode()
        };

        if let Some(last_time) = limited_at {
            // resume right after the last time point handled
            checkpoint.set(last_time, self.config.expire).await?;
        } else if let Some(last_time) = report.last_time {
            if last_checkpoint.map_or(true, |previous| last_time > previous) {
                checkpoint.set(last_time, self.config.expire).await?;
            }
        }

        let elapsed = started.elapsed();
        observe_process(mode, elapsed.as_secs_f64());
        info!(
            group,
            mode,
            pulled = report.pulled,
            pushed = report.pushed,
            anomalies = report.anomalies,
            elapsed_ms = elapsed.as_millis() as u64,
            "access finished"
        );
        Ok(report)
    }

    async fn plan(&self, group: &str) -> Result<Option<GroupPlan>> {
        let Some(definition) = self.reader.group(group).await? else {
            return Ok(None);
        };
        let strategy_ids: Vec<i64> = definition.strategy_ids().collect();
        let mut items = Vec::new();
        for strategy in self.reader.strategies(&strategy_ids).await? {
            if strategy.is_invalid {
                debug!(group, strategy_id = strategy.id, "skipping invalid strategy");
                continue;
            }
            let Some(item_ids) = definition.members.get(&strategy.id) else {
                continue;
            };
            let strategy = Arc::new(strategy);
            for item in strategy.items.iter().filter(|item| item_ids.contains(&item.id)) {
                items.push(AccessItem {
                    strategy: strategy.clone(),
                    item: item.clone(),
                });
            }
        }
        if items.is_empty() {
            return Ok(None);
        }
        items.sort_by_key(|item| (item.strategy_id(), item.item_id()));

        let interval = definition
            .min_interval()
            .or_else(|| items.iter().filter_map(|item| item.item.min_interval()).min())
            .unwrap_or(60);
        let merged = self
            .config
            .merge_allowed(items.iter().map(AccessItem::strategy_id))
            && items.iter().all(|item| item.item.is_all_threshold());
        let time_series = items[0]
            .item
            .first_query()
            .is_some_and(|query| query.is_time_series());
        Ok(Some(GroupPlan {
            group: group.to_string(),
            bk_biz_id: definition.bk_biz_id,
            items: Arc::new(items),
            interval,
            merged,
            time_series,
        }))
    }

    /// Filters `points` and publishes the survivors.
    async fn handle_points(&self, plan: &GroupPlan, now: i64, points: Vec<RawPoint>) -> Result<ProcessReport> {
        let mut report = ProcessReport::new(&plan.group);
        let duplicate = Arc::new(DuplicateFilter::new(
            self.cache.clone(),
            &plan.group,
            self.config.duplicate_ttl,
        ));
        let chain = FilterChain::new(vec![
            Box::new(ExpireFilter::new(now, self.config.expire)) as Box<dyn RecordFilter>,
            Box::new(RangeFilter::new(plan.items.clone(), self.topo.clone())),
            Box::new(HostStatusFilter::new(
                self.topo.clone(),
                self.config.host_disable_states.clone(),
            )),
            Box::new(duplicate.clone()),
        ]);

        // every record that survives the chain, retained or not
        let mut records = Vec::new();
        for point in points {
            let Some(mut record) = DataRecord::new(&plan.items, point) else {
                report.none_value += 1;
                continue;
            };
            report.see_time(record.time());
            match chain.run(&mut record).await {
                Ok(Some(stage)) => report.drop_record(stage),
                Ok(None) => records.push(record),
                Err(err) => {
                    warn!(group = %plan.group, record_id = record.record_id(), error = %err, "skipping record");
                    report.drop_record("error");
                }
            }
        }

        let in_scope: Vec<bool> = records.iter().map(DataRecord::retained_by_any).collect();
        PriorityChecker::new(self.cache.clone())
            .check_records(&plan.items, &mut records)
            .await?;
        let mut retained = 0;
        for (record, in_scope) in records.iter().zip(in_scope) {
            if record.retained_by_any() {
                retained += 1;
            } else if !in_scope {
                report.drop_record(if record.host_disabled {
                    "disabled_host"
                } else {
                    "out_of_range"
                });
            } else {
                report.drop_record("inhibited");
            }
        }

        let publisher = Publisher::new(self.cache.clone(), self.config.clone());
        let pushed = if plan.merged {
            publisher.push_detected(&plan.items, &records).await?
        } else {
            publisher.push_data(&plan.items, &records).await?
        };
        report.pushed = pushed.pushed;
        report.anomalies = pushed.anomalies;
        // ids are remembered only once the records were handed off
        duplicate.flush().await?;
        report.no_data = publisher.push_no_data(&plan.items, &records).await?;
        if let Err(err) = publisher.push_noise(&plan.items, &records).await {
            warn!(group = %plan.group, error = %err, "failed to record noise reduce members");
        }

        record_count(&plan.group, "none_value", report.none_value);
        for (stage, count) in &report.dropped {
            record_count(&plan.group, stage, *count);
        }
        record_count(&plan.group, "pushed", retained);
        Ok(report)
    }

    /// Parks each shard in the cache and starts a worker for it. Returns the
    /// number of shards dispatched.
    async fn dispatch_shards(&self, plan: &GroupPlan, batch_ts: i64, shards: Vec<Vec<RawPoint>>) -> Result<usize> {
        let ttl = self.config.batch_wait * 2;
        let mut dispatched = 0;
        for (n, shard) in shards.into_iter().enumerate() {
            let sub_task_id = format!("{batch_ts}.{}", n + 1);
            let key = keys::batch_data(&plan.group, &sub_task_id);
            self.cache.set(&key, &encode_shard(&shard)?, Some(ttl)).await?;

            let processor = self.clone();
            let plan = plan.clone();
            tokio::spawn(async move {
                processor.run_shard(plan, batch_ts, sub_task_id).await;
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn run_shard(&self, plan: GroupPlan, batch_ts: i64, sub_task_id: String) {
        let started = Instant::now();
        let outcome = self.process_shard(&plan, batch_ts, &sub_task_id).await;
        let result = match outcome {
            Ok(report) => BatchResult {
                sub_task_id: sub_task_id.clone(),
                result: true,
                error: String::new(),
                pushed: report.pushed,
                last_time: report.last_time.unwrap_or(0),
            },
            Err(err) => BatchResult {
                sub_task_id: sub_task_id.clone(),
                result: false,
                error: err.to_string(),
                pushed: 0,
                last_time: 0,
            },
        };
        observe_process("batch", started.elapsed().as_secs_f64());

        let key = keys::batch_result(&plan.group, batch_ts);
        let published = match serde_json::to_string(&result) {
            Ok(payload) => self.cache.rpush(&key, &[payload]).await.map_err(AccessError::from),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = published {
            warn!(group = %plan.group, sub_task_id = %sub_task_id, error = %err, "failed to report batch result");
            return;
        }
        if let Err(err) = self.cache.expire(&key, self.config.batch_wait * 2).await {
            warn!(group = %plan.group, error = %err, "failed to expire batch result");
        }
    }

    async fn process_shard(&self, plan: &GroupPlan, batch_ts: i64, sub_task_id: &str) -> Result<ProcessReport> {
        let key = keys::batch_data(&plan.group, sub_task_id);
        let encoded = self
            .cache
            .get(&key)
            .await?
            .ok_or_else(|| AccessError::Batch(format!("shard {sub_task_id} is gone")))?;
        self.cache.delete(&[key]).await?;
        let points = decode_shard(&encoded)?;
        self.handle_points(plan, batch_ts, points).await
    }

    /// Waits up to `batch_wait` for `expected` shard results.
    async fn collect_batch(&self, group: &str, batch_ts: i64, expected: usize) -> Result<Vec<BatchResult>> {
        if expected == 0 {
            return Ok(Vec::new());
        }
        let key = keys::batch_result(group, batch_ts);
        let deadline = Instant::now() + self.config.batch_wait;
        loop {
            if self.cache.llen(&key).await? >= expected as u64 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(group, expected, "batch results incomplete at deadline");
                break;
            }
            tokio::time::sleep(BATCH_POLL_INTERVAL).await;
        }

        let raw = self.cache.lrange(&key, 0, -1).await?;
        self.cache.delete(&[key]).await?;
        let results: Vec<BatchResult> = raw
            .iter()
            .filter_map(|raw| match serde_json::from_str(raw) {
                Ok(result) => Some(result),
                Err(err) => {
                    warn!(group, error = %err, "malformed batch result");
                    None
                }
            })
            .collect();
        let failed = results.iter().filter(|result| !result.result).count();
        let pushed: usize = results.iter().map(|result| result.pushed).sum();
        info!(group, expected, received = results.len(), failed, pushed, "batch summary");
        Ok(results)
    }
}
