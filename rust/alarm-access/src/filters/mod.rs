//! Per-record filter chain: expiry, target range, host status, duplicates.

mod duplicate;
mod expire;
mod host_status;
mod range;

pub use duplicate::DuplicateFilter;
pub use expire::ExpireFilter;
pub use host_status::HostStatusFilter;
pub use range::{RangeFilter, TargetMatcher};

use crate::error::Result;
use crate::record::DataRecord;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Keep,
    Drop,
}

#[async_trait]
pub trait RecordFilter: Send + Sync {
    /// Label used for drop counters.
    fn name(&self) -> &'static str;

    async fn filter(&self, record: &mut DataRecord) -> Result<FilterOutcome>;
}

#[async_trait]
impl<F: RecordFilter + ?Sized> RecordFilter for Arc<F> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn filter(&self, record: &mut DataRecord) -> Result<FilterOutcome> {
        (**self).filter(record).await
    }
}

/// Filters applied in order; the first drop wins.
pub struct FilterChain {
    filters: Vec<Box<dyn RecordFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn RecordFilter>>) -> Self {
        Self { filters }
    }

    /// Runs the chain. Returns the name of the filter that dropped the
    /// record, or `None` when it survived.
    pub async fn run(&self, record: &mut DataRecord) -> Result<Option<&'static str>> {
        for filter in &self.filters {
            if filter.filter(record).await? == FilterOutcome::Drop {
                return Ok(Some(filter.name()));
            }
        }
        Ok(None)
    }
}
