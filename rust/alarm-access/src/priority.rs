//! Inhibition between strategies that share a priority group: for the same
//! dimensions only the highest-priority strategies keep the record.

use crate::error::Result;
use crate::keys;
use crate::record::{AccessItem, DataRecord};
use cache_backend::CacheBackend;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const PRIORITY_TTL: Duration = Duration::from_secs(600);

/// A stored claim is honoured for this many agg intervals after its data time.
const CLAIM_INTERVALS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Claim {
    priority: i64,
    time: i64,
}

impl Claim {
    fn parse(raw: &str) -> Option<Self> {
        let (priority, time) = raw.split_once(':')?;
        Some(Self {
            priority: priority.trim().parse().ok()?,
            time: time.trim().parse().ok()?,
        })
    }

    fn encode(&self) -> String {
        format!("{}:{}", self.priority, self.time)
    }
}

/// Per priority group, the cache remembers the highest priority that recently
/// claimed each dimension set, so groups pulled separately still inhibit each
/// other.
pub struct PriorityChecker {
    cache: Arc<dyn CacheBackend>,
}

impl PriorityChecker {
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self { cache }
    }

    /// Marks `inhibitions` for every retained item outranked on the record's
    /// dimensions. Returns the number of (record, item) pairs inhibited.
    pub async fn check_records(&self, items: &[AccessItem], records: &mut [DataRecord]) -> Result<usize> {
        let mut groups: BTreeMap<&str, Vec<(i64, i64)>> = BTreeMap::new();
        let mut interval = i64::MAX;
        for item in items {
            let (Some(priority), Some(group_key)) =
                (item.strategy.priority, item.strategy.priority_group_key.as_deref())
            else {
                continue;
            };
            if group_key.is_empty() {
                continue;
            }
            groups.entry(group_key).or_default().push((item.item_id(), priority));
            interval = interval.min(item.item.min_interval().unwrap_or(60));
        }
        if groups.is_empty() {
            return Ok(0);
        }
        let window = interval.max(1) * CLAIM_INTERVALS;

        let mut inhibited = 0;
        for (group_key, members) in groups {
            let key = keys::priority(group_key);
            let stored: HashMap<String, Claim> = self
                .cache
                .hgetall(&key)
                .await?
                .into_iter()
                .filter_map(|(md5, raw)| Some((md5, Claim::parse(&raw)?)))
                .collect();

            let mut claims: HashMap<String, Claim> = HashMap::new();
            for record in records.iter_mut() {
                let retained: Vec<(i64, i64)> = members
                    .iter()
                    .copied()
                    .filter(|(item_id, _)| record.is_retains.get(item_id).copied().unwrap_or(false))
                    .collect();
                let Some(top) = retained.iter().map(|(_, priority)| *priority).max() else {
                    continue;
                };
                let md5 = record.dimensions_md5().to_string();
                let time = record.time();

                let earlier = claims.get(&md5).or_else(|| stored.get(&md5)).copied();
                let outranked_by = earlier
                    .filter(|claim| claim.priority > top && time - claim.time <= window)
                    .map(|claim| claim.priority);
                let effective = match outranked_by {
                    Some(priority) => priority,
                    None => {
                        let time = earlier
                            .filter(|claim| claim.priority == top)
                            .map_or(time, |claim| claim.time.max(time));
                        claims.insert(md5, Claim { priority: top, time });
                        top
                    }
                };

                for (item_id, priority) in retained {
                    if priority < effective {
                        record.inhibitions.insert(item_id, true);
                        inhibited += 1;
                    }
                }
            }

            if !claims.is_empty() {
                let fields: Vec<(String, String)> = claims
                    .iter()
                    .map(|(md5, claim)| (md5.clone(), claim.encode()))
                    .collect();
                self.cache.hmset(&key, &fields).await?;
                self.cache.expire(&key, PRIORITY_TTL).await?;
            }
            debug!(priority_group = group_key, inhibited, "priority check done");
        }
        Ok(inhibited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RawPoint;
    use alarm_strategy::models::{DataSourceLabel, DataTypeLabel, Item, QueryConfig, Strategy};
    use cache_backend::MemoryCache;
    use serde_json::json;

    fn item(id: i64, priority: Option<i64>, group: &str) -> AccessItem {
        let mut query = QueryConfig::new(DataSourceLabel::BkMonitor, DataTypeLabel::TimeSeries, "m");
        query.agg_interval = 60;
        let mut strategy = Strategy::new(id, 2, vec![Item::new(id, vec![query], Vec::new())]);
        strategy.priority = priority;
        strategy.priority_group_key = Some(group.to_string());
        let strategy = Arc::new(strategy);
        AccessItem {
            item: strategy.items[0].clone(),
            strategy,
        }
    }

    fn record(items: &[AccessItem], ip: &str, time: i64) -> DataRecord {
        let point: RawPoint = serde_json::from_value(json!({
            "dimensions": {"bk_target_ip": ip},
            "value": 1.0,
            "time": time
        }))
        .unwrap();
        DataRecord::new(items, point).unwrap()
    }

    #[tokio::test]
    async fn lower_priority_in_same_group_is_inhibited() {
        let cache: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new());
        let items = vec![item(1, Some(10), "g"), item(2, Some(5), "g"), item(3, None, "g")];
        let mut records = vec![record(&items, "127.0.0.1", 60)];

        let inhibited = PriorityChecker::new(cache.clone())
            .check_records(&items, &mut records)
            .await
            .unwrap();
        assert_eq!(inhibited, 1);
        assert!(records[0].is_retained(1));
        assert!(!records[0].is_retained(2));
        assert!(records[0].is_retained(3));

        let stored = cache.hgetall(&keys::priority("g")).await.unwrap();
        assert_eq!(stored.get(records[0].dimensions_md5()).map(String::as_str), Some("10:60"));
    }

    #[tokio::test]
    async fn claim_from_another_pull_inhibits_until_stale() {
        let cache: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new());
        let checker = PriorityChecker::new(cache.clone());
        let high = vec![item(1, Some(10), "g")];
        let low = vec![item(2, Some(5), "g")];

        let mut first = vec![record(&high, "127.0.0.1", 60)];
        checker.check_records(&high, &mut first).await.unwrap();

        let mut fresh = vec![record(&low, "127.0.0.1", 120)];
        assert_eq!(checker.check_records(&low, &mut fresh).await.unwrap(), 1);
        assert!(!fresh[0].retained_by_any());

        let mut other_host = vec![record(&low, "10.0.0.1", 120)];
        assert_eq!(checker.check_records(&low, &mut other_host).await.unwrap(), 0);

        let mut stale = vec![record(&low, "127.0.0.1", 60 + 6 * 60)];
        assert_eq!(checker.check_records(&low, &mut stale).await.unwrap(), 0);
        assert!(stale[0].is_retained(2));
    }

    #[tokio::test]
    async fn unprioritised_items_touch_nothing() {
        let cache = Arc::new(MemoryCache::new());
        let items = vec![item(1, None, "g")];
        let mut records = vec![record(&items, "127.0.0.1", 60)];
        let checker = PriorityChecker::new(cache.clone());
        assert_eq!(checker.check_records(&items, &mut records).await.unwrap(), 0);
        assert!(cache.is_empty());
    }
}
