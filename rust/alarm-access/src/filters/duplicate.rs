use super::{FilterOutcome, RecordFilter};
use crate::error::Result;
use crate::keys;
use crate::record::DataRecord;
use async_trait::async_trait;
use cache_backend::CacheBackend;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Drops records whose id was already accepted for the group, either in this
/// pull or in one of the recent ones.
pub struct DuplicateFilter {
    cache: Arc<dyn CacheBackend>,
    key: String,
    ttl: Duration,
    seen: Mutex<HashSet<String>>,
    pending: Mutex<Vec<String>>,
}

impl DuplicateFilter {
    pub fn new(cache: Arc<dyn CacheBackend>, group: &str, ttl: Duration) -> Self {
        Self {
            cache,
            key: keys::duplicate(group),
            ttl,
            seen: Mutex::new(HashSet::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Persists ids accepted since the last flush.
    pub async fn flush(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return Ok(());
        }
        self.cache.sadd(&self.key, &pending).await?;
        self.cache.expire(&self.key, self.ttl).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordFilter for DuplicateFilter {
    fn name(&self) -> &'static str {
        "duplicate"
    }

    async fn filter(&self, record: &mut DataRecord) -> Result<FilterOutcome> {
        let record_id = record.record_id().to_string();
        if self.seen.lock().contains(&record_id) {
            return Ok(FilterOutcome::Drop);
        }
        if self.cache.sismember(&self.key, &record_id).await? {
            return Ok(FilterOutcome::Drop);
        }
        self.seen.lock().insert(record_id.clone());
        self.pending.lock().push(record_id);
        Ok(FilterOutcome::Keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DataRecord;
    use crate::source::RawPoint;
    use cache_backend::MemoryCache;
    use serde_json::json;

    fn record() -> DataRecord {
        let point: RawPoint = serde_json::from_value(json!({
            "dimensions": {"bk_target_ip": "127.0.0.1", "bk_target_cloud_id": "0"},
            "value": 1.38,
            "time": 1_700_000_040
        }))
        .unwrap();
        DataRecord::new(&[], point).unwrap()
    }

    #[tokio::test]
    async fn second_copy_is_dropped_within_and_across_pulls() {
        let cache: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new());
        let filter = DuplicateFilter::new(cache.clone(), "g", Duration::from_secs(300));
        assert_eq!(filter.filter(&mut record()).await.unwrap(), FilterOutcome::Keep);
        assert_eq!(filter.filter(&mut record()).await.unwrap(), FilterOutcome::Drop);
        filter.flush().await.unwrap();

        let next_pull = DuplicateFilter::new(cache, "g", Duration::from_secs(300));
        assert_eq!(next_pull.filter(&mut record()).await.unwrap(), FilterOutcome::Drop);
    }
}
