//! Periodic driver for full and incremental refresh cycles.

use crate::error::{Result, StrategyError};
use crate::manager::{RefreshReport, StrategyCacheManager};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

pub struct RefreshScheduler {
    manager: Arc<StrategyCacheManager>,
    // full and smart cycles never overlap
    running: Mutex<()>,
    refresh_interval: Duration,
    smart_refresh_interval: Duration,
    refresh_timeout: Duration,
}

impl RefreshScheduler {
    pub fn new(manager: Arc<StrategyCacheManager>) -> Self {
        let config = manager.config();
        let (refresh_interval, smart_refresh_interval, refresh_timeout) = (
            config.refresh_interval,
            config.smart_refresh_interval,
            config.refresh_timeout,
        );
        Self {
            manager,
            running: Mutex::new(()),
            refresh_interval,
            smart_refresh_interval,
            refresh_timeout,
        }
    }

    pub async fn refresh_once(&self) -> Result<RefreshReport> {
        self.guarded("refresh", self.manager.refresh()).await
    }

    pub async fn smart_refresh_once(&self) -> Result<RefreshReport> {
        self.guarded("smart_refresh", self.manager.smart_refresh()).await
    }

    async fn guarded<F>(&self, task: &'static str, cycle: F) -> Result<RefreshReport>
    where
        F: Future<Output = Result<RefreshReport>>,
    {
        let _guard = self.running.lock().await;
        time::timeout(self.refresh_timeout, cycle)
            .await
            .map_err(|_| StrategyError::Timeout { component: task })?
    }

    /// Runs until `shutdown` flips to true. A full refresh runs first.
    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut full = time::interval(self.refresh_interval);
        let mut smart = time::interval(self.smart_refresh_interval);
        full.set_missed_tick_behavior(MissedTickBehavior::Delay);
        smart.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first smart tick would race the first full refresh
        smart.tick().await;

        info!(
            refresh_secs = self.refresh_interval.as_secs(),
            smart_refresh_secs = self.smart_refresh_interval.as_secs(),
            "strategy refresh scheduler started"
        );
        loop {
            tokio::select! {
                _ = full.tick() => {
                    if let Err(err) = self.refresh_once().await {
                        error!(error = %err, "full strategy refresh failed");
                    }
                }
                _ = smart.tick() => {
                    if let Err(err) = self.smart_refresh_once().await {
                        error!(error = %err, "smart strategy refresh failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("strategy refresh scheduler stopping");
                        break;
                    }
                }
            }
        }
    }
}
