//! Strategy cache manager: compiles enabled strategies and publishes the
//! cache views, either in full or incrementally from the change journal.

mod compile;
mod reader;
mod views;

pub use compile::{CompiledSet, StrategyCompiler};
pub use reader::StrategyReader;
pub use views::{StrategyViews, AGG_METHOD_REAL_TIME};

use crate::config::StrategyConfig;
use crate::error::{Result, StrategyError};
use crate::facade::{with_deadline, Cmdb, ConfigSource, MetricRegistry};
use crate::keys::StrategyKeys;
use crate::metrics;
use crate::models::{HistoryRecord, Strategy, StrategyGroup};
use crate::shield::{add_cluster_condition, apply_target_shield};
use crate::topo::TopologyResolver;
use cache_backend::{CacheBackend, Pipeline};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Summary of one refresh cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub strategies: usize,
    pub invalid: usize,
    pub groups: usize,
    pub deleted: usize,
    /// True when an incremental refresh found nothing to do.
    pub idle: bool,
}

/// Strategies removed or disabled according to the journal, with the
/// fingerprints they owned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryChanges {
    pub touched_biz: BTreeSet<i64>,
    pub deleted: BTreeSet<(i64, String)>,
}

impl HistoryChanges {
    pub fn deleted_ids(&self) -> BTreeSet<i64> {
        self.deleted.iter().map(|(id, _)| *id).collect()
    }

    pub fn deleted_md5s(&self) -> BTreeSet<String> {
        self.deleted
            .iter()
            .filter(|(_, md5)| !md5.is_empty())
            .map(|(_, md5)| md5.clone())
            .collect()
    }
}

pub struct StrategyCacheManager {
    config: StrategyConfig,
    cache: Arc<dyn CacheBackend>,
    source: Arc<dyn ConfigSource>,
    registry: Arc<dyn MetricRegistry>,
    topo: Arc<TopologyResolver>,
    keys: StrategyKeys,
    reader: StrategyReader,
}

impl StrategyCacheManager {
    pub fn new(
        config: StrategyConfig,
        cache: Arc<dyn CacheBackend>,
        source: Arc<dyn ConfigSource>,
        registry: Arc<dyn MetricRegistry>,
        cmdb: Arc<dyn Cmdb>,
    ) -> Self {
        let keys = StrategyKeys::new(config.cache_prefix.clone());
        let topo = Arc::new(TopologyResolver::new(
            cmdb,
            config.topo_cache_ttl,
            config.call_timeout,
        ));
        let reader = StrategyReader::new(cache.clone(), keys.clone());
        Self {
            config,
            cache,
            source,
            registry,
            topo,
            keys,
            reader,
        }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn reader(&self) -> &StrategyReader {
        &self.reader
    }

    pub fn topology(&self) -> &Arc<TopologyResolver> {
        &self.topo
    }

    /// Full refresh of every view.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let started = Instant::now();
        let outcome = self.run_refresh().await;
        observe("refresh", started, &outcome);
        outcome
    }

    /// Incremental refresh driven by the change journal since the last
    /// successful run.
    pub async fn smart_refresh(&self) -> Result<RefreshReport> {
        let started = Instant::now();
        let outcome = self.run_smart_refresh().await;
        observe("smart_refresh", started, &outcome);
        outcome
    }

    /// Loads and compiles enabled strategies, optionally for some businesses only.
    pub async fn compile(&self, biz_filter: Option<&[i64]>) -> Result<CompiledSet> {
        let raw = with_deadline(
            "config_db",
            self.config.call_timeout,
            self.source.enabled_strategies(biz_filter),
        )
        .await?;
        let compiler = StrategyCompiler {
            config: &self.config,
            topo: &self.topo,
            registry: self.registry.as_ref(),
        };
        let compiled = compiler.compile(raw).await?;
        metrics::record_invalid(&compiled.ledger.counts());
        Ok(compiled)
    }

    async fn run_refresh(&self) -> Result<RefreshReport> {
        let cycle_start = now_secs();
        let mut compiled = self
            .compile(None)
            .await
            .map_err(|err| err.at_stage("load_strategies"))?;

        // changes that landed while compiling
        let changes = self
            .history_since(cycle_start - 1, false)
            .await
            .map_err(|err| err.at_stage("history"))?;
        for strategy_id in changes.deleted_ids() {
            compiled.remove(strategy_id);
        }
        if !changes.touched_biz.is_empty() {
            let touched: Vec<i64> = changes.touched_biz.iter().copied().collect();
            match self.compile(Some(&touched)).await {
                Ok(changed) => compiled.merge(changed),
                Err(err) => warn!(error = %err, "failed to reload strategies changed mid-refresh"),
            }
        }

        self.post_process(&mut compiled).await?;

        let process_start = now_secs();
        let report = self
            .write_full(&compiled)
            .await
            .map_err(|err| err.at_stage("write_views"))?;

        let late = self
            .history_since(process_start - 1, false)
            .await
            .map_err(|err| err.at_stage("cleanup"))?;
        let late_deleted: Vec<String> = late
            .deleted_ids()
            .into_iter()
            .map(|id| self.keys.strategy(id))
            .collect();
        if !late_deleted.is_empty() {
            self.cache
                .delete(&late_deleted)
                .await
                .map_err(|err| StrategyError::from(err).at_stage("cleanup"))?;
        }

        info!(
            strategies = report.strategies,
            invalid = report.invalid,
            groups = report.groups,
            deleted = report.deleted,
            "strategy cache refreshed"
        );
        Ok(report)
    }

    async fn run_smart_refresh(&self) -> Result<RefreshReport> {
        let cycle_start = now_secs();
        let window = match self.reader.last_updated().await? {
            Some(last) if last > 0 => (cycle_start - last).max(1),
            _ => self.config.smart_refresh_default_window.as_secs() as i64,
        };

        let changes = self
            .history_since(cycle_start - window, true)
            .await
            .map_err(|err| err.at_stage("history"))?;
        if changes.touched_biz.is_empty() && changes.deleted.is_empty() {
            debug!(window, "no strategy changes in window");
            return Ok(RefreshReport {
                idle: true,
                ..RefreshReport::default()
            });
        }
        info!(
            window,
            businesses = changes.touched_biz.len(),
            deleted = changes.deleted.len(),
            "strategy changes found"
        );

        let mut compiled = if changes.touched_biz.is_empty() {
            CompiledSet::default()
        } else {
            let touched: Vec<i64> = changes.touched_biz.iter().copied().collect();
            self.compile(Some(&touched))
                .await
                .map_err(|err| err.at_stage("load_strategies"))?
        };
        self.post_process(&mut compiled).await?;

        let report = self
            .write_partial(&compiled, &changes)
            .await
            .map_err(|err| err.at_stage("write_views"))?;

        self.cache
            .set(
                &self.keys.last_updated(),
                &cycle_start.to_string(),
                Some(self.config.cache_ttl),
            )
            .await
            .map_err(|err| StrategyError::from(err).at_stage("last_updated"))?;

        info!(
            strategies = report.strategies,
            invalid = report.invalid,
            groups = report.groups,
            deleted = report.deleted,
            "strategy cache smart refreshed"
        );
        Ok(report)
    }

    /// Target shielding and k8s cluster scoping over the valid strategies.
    async fn post_process(&self, compiled: &mut CompiledSet) -> Result<()> {
        let levels = self
            .topo
            .mainline_levels()
            .await
            .map_err(|err| err.at_stage("shield"))?;
        let mut valid: Vec<Strategy> = compiled.valid().cloned().collect();
        let shielded = apply_target_shield(&mut valid, &levels);
        debug!(shielded, "target shield applied");

        let mut clusters: HashMap<i64, Vec<String>> = HashMap::new();
        for strategy in valid.iter_mut().filter(|s| s.is_k8s()) {
            let bk_biz_id = strategy.bk_biz_id;
            if !clusters.contains_key(&bk_biz_id) {
                let enabled = with_deadline(
                    "cmdb",
                    self.config.call_timeout,
                    self.topo.cmdb().enabled_bcs_clusters(bk_biz_id),
                )
                .await
                .unwrap_or_else(|err| {
                    warn!(bk_biz_id, error = %err, "failed to load enabled clusters");
                    Vec::new()
                });
                clusters.insert(bk_biz_id, enabled);
            }
            if let Some(enabled) = clusters.get(&bk_biz_id) {
                add_cluster_condition(strategy, enabled);
            }
        }

        for strategy in valid {
            compiled.strategies.insert(strategy.id, strategy);
        }
        Ok(())
    }

    /// Splits journal rows after `since` into touched businesses and removed
    /// strategies. In smart mode strategies with no cached copy are ignored.
    pub async fn history_since(&self, since: i64, smart: bool) -> Result<HistoryChanges> {
        let rows = with_deadline(
            "config_db",
            self.config.call_timeout,
            self.source.strategy_history(since),
        )
        .await?;
        self.handle_history(&rows, smart).await
    }

    async fn handle_history(&self, rows: &[HistoryRecord], smart: bool) -> Result<HistoryChanges> {
        let mut changes = HistoryChanges::default();
        for row in rows {
            if !row.is_delete() {
                if let Some(bk_biz_id) = row.bk_biz_id() {
                    changes.touched_biz.insert(bk_biz_id);
                }
                if row.is_enabled() {
                    continue;
                }
            }

            let Some(cached) = self.reader.strategy(row.strategy_id).await? else {
                if !smart {
                    changes.deleted.insert((row.strategy_id, String::new()));
                }
                continue;
            };
            let md5s: Vec<&String> = cached
                .items
                .iter()
                .map(|item| &item.query_md5)
                .filter(|md5| !md5.is_empty())
                .collect();
            if md5s.is_empty() {
                changes.deleted.insert((row.strategy_id, String::new()));
            }
            for md5 in md5s {
                changes.deleted.insert((row.strategy_id, md5.clone()));
            }
        }
        Ok(changes)
    }

    async fn write_full(&self, compiled: &CompiledSet) -> Result<RefreshReport> {
        let ttl = Some(self.config.cache_ttl);
        let views = StrategyViews::build(compiled.valid());
        let invalid_ids: BTreeSet<i64> = compiled.invalid().map(|s| s.id).collect();

        let old_ids: BTreeSet<i64> = self.reader.strategy_ids().await?.into_iter().collect();
        let old_groups = self.reader.group_keys().await?;
        let old_fta = self.cache.hkeys(&self.keys.fta_alert()).await?;

        let mut pipe = Pipeline::new();
        let stale: Vec<String> = old_ids
            .iter()
            .filter(|id| !views.strategy_ids.contains(id) && !invalid_ids.contains(id))
            .map(|id| self.keys.strategy(*id))
            .collect();
        let deleted = stale.len();
        pipe.delete(stale);

        for strategy in compiled.strategies.values() {
            pipe.set(
                self.keys.strategy(strategy.id),
                serde_json::to_string(strategy)?,
                ttl,
            );
        }
        pipe.set(self.keys.strategy_ids(), to_json(&views.strategy_ids)?, ttl);
        pipe.set(self.keys.bk_biz_ids(), to_json(&views.bk_biz_ids)?, ttl);

        let group_key = self.keys.strategy_group();
        let removed_groups: Vec<String> = old_groups
            .into_iter()
            .filter(|md5| !views.groups.contains_key(md5))
            .collect();
        pipe.hdel(group_key.clone(), removed_groups);
        let group_fields = encode_fields(&views.groups)?;
        pipe.hmset(group_key.clone(), group_fields);
        pipe.expire(group_key, self.config.cache_ttl);

        pipe.set(self.keys.real_time(), to_json(&views.real_time)?, ttl);
        pipe.set(self.keys.gse_alarm(), to_json(&views.gse_alarm)?, ttl);

        let fta_key = self.keys.fta_alert();
        pipe.hmset(fta_key.clone(), encode_fields(&views.fta_alert)?);
        let removed_fta: Vec<String> = old_fta
            .into_iter()
            .filter(|field| !views.fta_alert.contains_key(field))
            .collect();
        pipe.hdel(fta_key.clone(), removed_fta);
        pipe.expire(fta_key, self.config.cache_ttl);

        pipe.set(self.keys.no_data(), to_json(&views.no_data)?, ttl);

        self.cache.execute(pipe).await?;
        Ok(RefreshReport {
            strategies: views.strategy_ids.len(),
            invalid: invalid_ids.len(),
            groups: views.groups.len(),
            deleted,
            idle: false,
        })
    }

    async fn write_partial(
        &self,
        compiled: &CompiledSet,
        changes: &HistoryChanges,
    ) -> Result<RefreshReport> {
        let ttl = Some(self.config.cache_ttl);
        let views = StrategyViews::build(compiled.valid());
        let invalid_ids: BTreeSet<i64> = compiled.invalid().map(|s| s.id).collect();
        let deleted_ids: BTreeSet<i64> = changes
            .deleted_ids()
            .into_iter()
            .filter(|id| !views.strategy_ids.contains(id))
            .collect();

        let old_ids: BTreeSet<i64> = self.reader.strategy_ids().await?.into_iter().collect();
        let mut new_ids: BTreeSet<i64> = old_ids
            .iter()
            .copied()
            .filter(|id| !deleted_ids.contains(id) && !invalid_ids.contains(id))
            .collect();
        new_ids.extend(views.strategy_ids.iter().copied());

        let mut pipe = Pipeline::new();
        let dropped: BTreeSet<i64> = old_ids
            .iter()
            .copied()
            .filter(|id| !new_ids.contains(id) && !invalid_ids.contains(id))
            .chain(deleted_ids.iter().copied())
            .collect();
        let deleted = dropped.len();
        pipe.delete(dropped.iter().map(|id| self.keys.strategy(*id)).collect());

        for strategy in compiled.strategies.values() {
            pipe.set(
                self.keys.strategy(strategy.id),
                serde_json::to_string(strategy)?,
                ttl,
            );
        }
        pipe.set(self.keys.strategy_ids(), to_json(&new_ids)?, ttl);

        let mut biz_ids: BTreeSet<i64> = self.reader.bk_biz_ids().await?.into_iter().collect();
        biz_ids.extend(changes.touched_biz.iter().copied());
        pipe.set(self.keys.bk_biz_ids(), to_json(&biz_ids)?, ttl);

        let mut no_data: BTreeSet<i64> = self.reader.no_data_strategy_ids().await?.into_iter().collect();
        no_data.extend(views.no_data.iter().copied());
        no_data.retain(|id| {
            !views.without_no_data.contains(id) && !deleted_ids.contains(id) && !invalid_ids.contains(id)
        });
        pipe.set(self.keys.no_data(), to_json(&no_data)?, ttl);

        // groups of touched businesses are rebuilt whole; other groups only
        // lose the deleted strategies
        let group_key = self.keys.strategy_group();
        let deleted_md5s = changes.deleted_md5s();
        let mut removed_groups = Vec::new();
        let mut trimmed_groups: Vec<(String, StrategyGroup)> = Vec::new();
        for (md5, mut group) in self.reader.groups().await? {
            if views.groups.contains_key(&md5) {
                continue;
            }
            if changes.touched_biz.contains(&group.bk_biz_id) {
                removed_groups.push(md5);
                continue;
            }
            if !deleted_md5s.contains(&md5) {
                continue;
            }
            for id in &dropped {
                group.remove_strategy(*id);
            }
            if group.is_empty() {
                removed_groups.push(md5);
            } else {
                trimmed_groups.push((md5, group));
            }
        }
        for md5 in &deleted_md5s {
            if !views.groups.contains_key(md5) && !removed_groups.contains(md5)
                && !trimmed_groups.iter().any(|(key, _)| key == md5)
            {
                removed_groups.push(md5.clone());
            }
        }
        for md5 in &removed_groups {
            info!(query_md5 = %md5, "removing strategy group");
        }
        pipe.hdel(group_key.clone(), removed_groups);
        let mut group_fields = encode_fields(&views.groups)?;
        for (md5, group) in &trimmed_groups {
            group_fields.push((md5.clone(), serde_json::to_string(group)?));
        }
        pipe.hmset(group_key.clone(), group_fields);
        pipe.expire(group_key, self.config.cache_ttl);

        self.cache.execute(pipe).await?;
        Ok(RefreshReport {
            strategies: views.strategy_ids.len(),
            invalid: invalid_ids.len(),
            groups: views.groups.len(),
            deleted,
            idle: false,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn encode_fields<T: serde::Serialize>(
    map: &std::collections::BTreeMap<String, T>,
) -> Result<Vec<(String, String)>> {
    map.iter()
        .map(|(field, value)| Ok((field.clone(), serde_json::to_string(value)?)))
        .collect()
}

fn observe(task: &str, started: Instant, outcome: &Result<RefreshReport>) {
    let seconds = started.elapsed().as_secs_f64();
    match outcome {
        Ok(_) => metrics::record_task(task, "success", "", seconds),
        Err(err) => {
            warn!(task, stage = err.stage(), error = %err, "strategy cache cycle failed");
            metrics::record_task(task, "failure", err.stage(), seconds);
        }
    }
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
