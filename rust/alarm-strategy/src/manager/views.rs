//! Index views derived from the compiled strategies.

use crate::keys::{fta_alert_field, fta_strategy_field};
use crate::models::{DataSourceLabel, DataTypeLabel, Strategy, StrategyGroup};
use std::collections::{BTreeMap, BTreeSet};

pub const AGG_METHOD_REAL_TIME: &str = "REAL_TIME";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyViews {
    pub strategy_ids: BTreeSet<i64>,
    pub bk_biz_ids: BTreeSet<i64>,
    pub groups: BTreeMap<String, StrategyGroup>,
    /// result table -> business -> strategy ids
    pub real_time: BTreeMap<String, BTreeMap<String, Vec<i64>>>,
    /// business -> strategy ids
    pub gse_alarm: BTreeMap<String, Vec<i64>>,
    /// `strategy|id` or `alert|name` -> business -> strategy ids
    pub fta_alert: BTreeMap<String, BTreeMap<String, Vec<i64>>>,
    pub no_data: BTreeSet<i64>,
    /// Strategies listed without a no-data item, for partial merges.
    pub without_no_data: BTreeSet<i64>,
}

impl StrategyViews {
    pub fn build<'a>(strategies: impl IntoIterator<Item = &'a Strategy>) -> Self {
        let mut views = Self::default();
        for strategy in strategies {
            views.add(strategy);
        }
        views
    }

    fn add(&mut self, strategy: &Strategy) {
        let (strategy_id, bk_biz_id) = (strategy.id, strategy.bk_biz_id);
        let biz_key = bk_biz_id.to_string();
        self.strategy_ids.insert(strategy_id);
        self.bk_biz_ids.insert(bk_biz_id);

        if strategy.needs_no_data() {
            self.no_data.insert(strategy_id);
        } else {
            self.without_no_data.insert(strategy_id);
        }

        for item in strategy.items.iter().filter(|item| !item.query_md5.is_empty()) {
            let group = self
                .groups
                .entry(item.query_md5.clone())
                .or_insert_with(|| StrategyGroup::new(bk_biz_id));
            group.bk_biz_id = bk_biz_id;
            group.add_item(strategy_id, item.id);
            for query in &item.query_configs {
                if query.agg_interval <= 0 {
                    continue;
                }
                if !group.interval_list.contains(&query.agg_interval) {
                    group.interval_list.push(query.agg_interval);
                }
                if group.strategy_source.is_empty() {
                    group
                        .strategy_source
                        .push((query.data_source_label.clone(), query.data_type_label.clone()));
                }
            }
        }

        if let Some(query) = strategy.first_query() {
            if query.is_time_series() && query.agg_method == AGG_METHOD_REAL_TIME {
                push_unique(
                    self.real_time
                        .entry(query.result_table_id.clone())
                        .or_default()
                        .entry(biz_key.clone())
                        .or_default(),
                    strategy_id,
                );
            }
            if query.is_system_event() {
                push_unique(self.gse_alarm.entry(biz_key.clone()).or_default(), strategy_id);
            }
        }

        for query in strategy.items.iter().flat_map(|item| item.query_configs.iter()) {
            if query.data_type_label != DataTypeLabel::Alert {
                continue;
            }
            let field = match (&query.data_source_label, &query.bkmonitor_strategy_id, &query.alert_name) {
                (DataSourceLabel::BkMonitor, Some(parent), _) => fta_strategy_field(*parent),
                (DataSourceLabel::BkFta, _, Some(name)) => fta_alert_field(name),
                _ => continue,
            };
            push_unique(
                self.fta_alert
                    .entry(field)
                    .or_default()
                    .entry(biz_key.clone())
                    .or_default(),
                strategy_id,
            );
        }
    }
}

fn push_unique(ids: &mut Vec<i64>, id: i64) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Item, NoDataConfig, QueryConfig};

    fn series(id: i64, md5: &str, interval: i64) -> Strategy {
        let mut query = QueryConfig::new(
            DataSourceLabel::BkMonitor,
            DataTypeLabel::TimeSeries,
            "bk_monitor.system.cpu_load.load5",
        );
        query.agg_interval = interval;
        query.result_table_id = "system.cpu_load".into();
        let mut item = Item::new(id * 10, vec![query], vec![]);
        item.query_md5 = md5.into();
        Strategy::new(id, 2, vec![item])
    }

    #[test]
    fn groups_collect_members_and_intervals() {
        let a = series(1, "m1", 60);
        let b = series(2, "m1", 120);
        let c = series(3, "m1", 0);
        let views = StrategyViews::build([&a, &b, &c]);

        let group = &views.groups["m1"];
        assert_eq!(group.members.len(), 3);
        assert_eq!(group.interval_list, vec![60, 120]);
        assert_eq!(group.bk_biz_id, 2);
        assert_eq!(views.strategy_ids.len(), 3);
    }

    #[test]
    fn fast_path_indices() {
        let mut realtime = series(1, "m1", 60);
        realtime.items[0].query_configs[0].agg_method = AGG_METHOD_REAL_TIME.into();
        realtime.items[0].no_data_config = Some(NoDataConfig {
            is_enabled: true,
            ..NoDataConfig::default()
        });

        let event = Strategy::new(
            2,
            3,
            vec![Item::new(
                1,
                vec![QueryConfig::new(DataSourceLabel::BkMonitor, DataTypeLabel::Event, "bk_monitor.os_restart")],
                vec![],
            )],
        );

        let mut alert_query = QueryConfig::new(DataSourceLabel::BkMonitor, DataTypeLabel::Alert, "bk_monitor.alert.1");
        alert_query.bkmonitor_strategy_id = Some(1);
        let alert = Strategy::new(4, 2, vec![Item::new(1, vec![alert_query], vec![])]);

        let views = StrategyViews::build([&realtime, &event, &alert]);
        assert_eq!(views.real_time["system.cpu_load"]["2"], vec![1]);
        assert_eq!(views.gse_alarm["3"], vec![2]);
        assert_eq!(views.fta_alert["strategy|1"]["2"], vec![4]);
        assert_eq!(views.no_data.iter().copied().collect::<Vec<_>>(), vec![1]);
        assert!(views.without_no_data.contains(&2));
    }
}
