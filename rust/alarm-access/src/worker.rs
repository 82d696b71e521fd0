use crate::error::Result;
use crate::processor::{AccessDataProcessor, ProcessReport};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Outcome of one round over a set of groups.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoundSummary {
    pub processed: usize,
    pub locked: usize,
    pub failed: usize,
    pub pushed: usize,
    pub anomalies: usize,
}

/// Runs access for many groups concurrently, at most `workers` at a time.
pub struct AccessWorkerPool {
    processor: AccessDataProcessor,
    permits: Arc<Semaphore>,
}

impl AccessWorkerPool {
    pub fn new(processor: AccessDataProcessor) -> Self {
        let workers = processor.config().workers.max(1);
        Self {
            processor,
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    pub async fn run_round(&self, groups: Vec<String>) -> RoundSummary {
        let mut tasks: JoinSet<(String, Result<ProcessReport>)> = JoinSet::new();
        for group in groups {
            let processor = self.processor.clone();
            let permits = self.permits.clone();
            tasks.spawn(async move {
                // the semaphore is never closed
                let _permit = permits.acquire_owned().await;
                let result = processor.process(&group).await;
                (group, result)
            });
        }

        let mut summary = RoundSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(report))) => {
                    summary.processed += 1;
                    summary.pushed += report.pushed;
                    summary.anomalies += report.anomalies;
                }
                Ok((group, Err(err))) if err.is_locked() => {
                    debug!(group = %group, "group locked by another worker");
                    summary.locked += 1;
                }
                Ok((group, Err(err))) => {
                    warn!(group = %group, error = %err, "access failed");
                    summary.failed += 1;
                }
                Err(err) => {
                    error!(error = %err, "access task panicked");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// One round over every group currently in the strategy cache.
    pub async fn run_all(&self) -> Result<RoundSummary> {
        let groups = self.processor.reader().group_keys().await?;
        let count = groups.len();
        let summary = self.run_round(groups).await;
        info!(
            groups = count,
            processed = summary.processed,
            locked = summary.locked,
            failed = summary.failed,
            pushed = summary.pushed,
            "access round finished"
        );
        Ok(summary)
    }

    /// Repeats `run_all` every `period` until `shutdown` flips.
    pub async fn start(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_all().await {
                        warn!(error = %err, "access round failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("access workers stopping");
                        break;
                    }
                }
            }
        }
    }
}

