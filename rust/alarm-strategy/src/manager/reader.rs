use crate::error::Result;
use crate::keys::{fta_alert_field, fta_strategy_field, StrategyKeys};
use crate::models::{Strategy, StrategyGroup};
use cache_backend::CacheBackend;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Read side of the strategy cache views. Missing or malformed values read
/// as empty so consumers ride out a half-written refresh.
#[derive(Clone)]
pub struct StrategyReader {
    cache: Arc<dyn CacheBackend>,
    keys: StrategyKeys,
}

impl StrategyReader {
    pub fn new(cache: Arc<dyn CacheBackend>, keys: StrategyKeys) -> Self {
        Self { cache, keys }
    }

    pub fn keys(&self) -> &StrategyKeys {
        &self.keys
    }

    async fn get_or_default<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let raw = self.cache.get(key).await?;
        Ok(decode(key, raw.as_deref()))
    }

    pub async fn strategy_ids(&self) -> Result<Vec<i64>> {
        self.get_or_default(&self.keys.strategy_ids()).await
    }

    pub async fn strategy(&self, strategy_id: i64) -> Result<Option<Strategy>> {
        let key = self.keys.strategy(strategy_id);
        let raw = self.cache.get(&key).await?;
        Ok(decode(&key, raw.as_deref()))
    }

    /// Strategies for the given ids in one round trip; unknown ids are skipped.
    pub async fn strategies(&self, strategy_ids: &[i64]) -> Result<Vec<Strategy>> {
        if strategy_ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = strategy_ids.iter().map(|id| self.keys.strategy(*id)).collect();
        let values = self.cache.mget(&keys).await?;
        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(key, raw)| decode::<Option<Strategy>>(key, raw.as_deref()))
            .collect())
    }

    pub async fn bk_biz_ids(&self) -> Result<Vec<i64>> {
        self.get_or_default(&self.keys.bk_biz_ids()).await
    }

    pub async fn group_keys(&self) -> Result<Vec<String>> {
        Ok(self.cache.hkeys(&self.keys.strategy_group()).await?)
    }

    pub async fn group(&self, query_md5: &str) -> Result<Option<StrategyGroup>> {
        let key = self.keys.strategy_group();
        let raw = self.cache.hget(&key, query_md5).await?;
        Ok(decode(&key, raw.as_deref()))
    }

    pub async fn groups(&self) -> Result<BTreeMap<String, StrategyGroup>> {
        let key = self.keys.strategy_group();
        let all = self.cache.hgetall(&key).await?;
        Ok(all
            .into_iter()
            .filter_map(|(md5, raw)| {
                decode::<Option<StrategyGroup>>(&key, Some(&raw)).map(|group| (md5, group))
            })
            .collect())
    }

    pub async fn real_time_strategy_ids(&self) -> Result<BTreeMap<String, BTreeMap<String, Vec<i64>>>> {
        self.get_or_default(&self.keys.real_time()).await
    }

    pub async fn gse_alarm_strategy_ids(&self) -> Result<BTreeMap<String, Vec<i64>>> {
        self.get_or_default(&self.keys.gse_alarm()).await
    }

    /// Alert-on-alert subscribers, by parent strategy id or by alert name.
    pub async fn fta_alert_strategy_ids(
        &self,
        strategy_id: Option<i64>,
        alert_name: Option<&str>,
    ) -> Result<BTreeMap<String, Vec<i64>>> {
        let field = match (strategy_id, alert_name) {
            (Some(id), _) => fta_strategy_field(id),
            (None, Some(name)) => fta_alert_field(name),
            (None, None) => return Ok(BTreeMap::new()),
        };
        let key = self.keys.fta_alert();
        let raw = self.cache.hget(&key, &field).await?;
        Ok(decode(&key, raw.as_deref()))
    }

    pub async fn no_data_strategy_ids(&self) -> Result<Vec<i64>> {
        self.get_or_default(&self.keys.no_data()).await
    }

    pub async fn last_updated(&self) -> Result<Option<i64>> {
        let raw = self.cache.get(&self.keys.last_updated()).await?;
        Ok(raw.and_then(|raw| raw.trim().parse::<f64>().ok()).map(|ts| ts as i64))
    }
}

fn decode<T>(key: &str, raw: Option<&str>) -> T
where
    T: DeserializeOwned + Default,
{
    let Some(raw) = raw else {
        return T::default();
    };
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(key, error = %err, "malformed cache value ignored");
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_backend::MemoryCache;

    #[tokio::test]
    async fn malformed_values_read_as_empty() {
        let cache = Arc::new(MemoryCache::new());
        let reader = StrategyReader::new(cache.clone(), StrategyKeys::default());
        cache.set("strategy.strategy_ids", "not json", None).await.unwrap();
        cache.set("strategy.strategy_1", "{", None).await.unwrap();
        cache
            .hset("strategy.strategy_group", "abc", r#"{"1": [1], "bk_biz_id": 2}"#)
            .await
            .unwrap();
        cache.hset("strategy.strategy_group", "bad", "[").await.unwrap();

        assert!(reader.strategy_ids().await.unwrap().is_empty());
        assert_eq!(reader.strategy(1).await.unwrap(), None);
        assert!(reader.strategies(&[1, 2]).await.unwrap().is_empty());
        let groups = reader.groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups["abc"].bk_biz_id, 2);
        assert_eq!(reader.last_updated().await.unwrap(), None);
    }
}
