use super::{FilterOutcome, RecordFilter};
use crate::error::Result;
use crate::record::DataRecord;
use alarm_strategy::TopologyResolver;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Clears every retain flag of records whose host is in a state that
/// excludes it from monitoring.
pub struct HostStatusFilter {
    topo: Arc<TopologyResolver>,
    disabled_states: Vec<String>,
}

impl HostStatusFilter {
    pub fn new(topo: Arc<TopologyResolver>, disabled_states: Vec<String>) -> Self {
        Self {
            topo,
            disabled_states,
        }
    }
}

#[async_trait]
impl RecordFilter for HostStatusFilter {
    fn name(&self) -> &'static str {
        "disabled_host"
    }

    async fn filter(&self, record: &mut DataRecord) -> Result<FilterOutcome> {
        if self.disabled_states.is_empty() {
            return Ok(FilterOutcome::Keep);
        }
        let Some(key) = record.host_key() else {
            return Ok(FilterOutcome::Keep);
        };
        let Some(host) = self.topo.host(&key).await? else {
            return Ok(FilterOutcome::Keep);
        };
        let disabled = host
            .bk_state
            .as_deref()
            .is_some_and(|state| self.disabled_states.iter().any(|s| s == state));
        if disabled {
            debug!(bk_host_id = host.bk_host_id, record_id = record.record_id(), "host monitoring disabled");
            record.clear_retains();
            record.host_disabled = true;
        }
        Ok(FilterOutcome::Keep)
    }
}
