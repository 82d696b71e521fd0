use super::{FilterOutcome, RecordFilter};
use crate::error::Result;
use crate::record::DataRecord;
use async_trait::async_trait;
use std::time::Duration;

/// Drops records older than the expiry horizon.
pub struct ExpireFilter {
    now: i64,
    expire: Duration,
}

impl ExpireFilter {
    pub fn new(now: i64, expire: Duration) -> Self {
        Self { now, expire }
    }
}

#[async_trait]
impl RecordFilter for ExpireFilter {
    fn name(&self) -> &'static str {
        "expired"
    }

    async fn filter(&self, record: &mut DataRecord) -> Result<FilterOutcome> {
        if self.now - record.time() > self.expire.as_secs() as i64 {
            return Ok(FilterOutcome::Drop);
        }
        Ok(FilterOutcome::Keep)
    }
}
