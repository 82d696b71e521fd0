use alarm_access::{
    AccessConfig, AccessDataProcessor, AccessWorkerPool, DataSource, DetectProcess,
};
use alarm_strategy::telemetry::init_tracing;
use alarm_strategy::{
    RefreshScheduler, Snapshot, SnapshotSource, StrategyCacheManager, StrategyConfig,
};
use anyhow::{Context, Result};
use cache_backend::{CacheBackend, MemoryCache};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "alarm-backend")]
#[command(about = "Alarm strategy cache refresh and access processing")]
#[command(version)]
struct Cli {
    /// Redis URL for the shared cache. Without it an in-process cache is used.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// JSON snapshot standing in for the config database, CMDB and data backend
    #[arg(long, env = "ALARM_SNAPSHOT", value_name = "FILE")]
    snapshot: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Rebuild every strategy cache view once
    Refresh,
    /// Apply recent strategy changes to the cache once
    SmartRefresh,
    /// Process one strategy group, or all of them, once
    Access {
        /// Group fingerprint (`query_md5`)
        #[arg(long)]
        group: Option<String>,
    },
    /// Drain the data queues through threshold detection once
    Detect,
    /// Run refresh cycles and access rounds until interrupted
    Run {
        #[arg(long, env = "ACCESS_INTERVAL_SECS", default_value_t = 60)]
        access_interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let strategy_config = StrategyConfig::from_env()?;
    let access_config = Arc::new(AccessConfig::from_env()?);
    let cache = connect_cache(cli.redis_url.as_deref(), strategy_config.call_timeout).await?;
    let source = Arc::new(match &cli.snapshot {
        Some(path) => SnapshotSource::load(path)
            .with_context(|| format!("failed to load snapshot {}", path.display()))?,
        None => SnapshotSource::new(Snapshot::default()),
    });

    let manager = Arc::new(StrategyCacheManager::new(
        strategy_config,
        cache.clone(),
        source.clone(),
        source.clone(),
        source.clone(),
    ));
    let processor = AccessDataProcessor::new(
        access_config.clone(),
        cache.clone(),
        manager.reader().clone(),
        manager.topology().clone(),
        source.clone() as Arc<dyn DataSource>,
    );

    match cli.command {
        Command::Refresh => {
            let report = manager.refresh().await?;
            info!(?report, "refresh finished");
        }
        Command::SmartRefresh => {
            let report = manager.smart_refresh().await?;
            info!(?report, "smart refresh finished");
        }
        Command::Access { group: Some(group) } => {
            let report = processor.process(&group).await?;
            info!(?report, "group processed");
        }
        Command::Access { group: None } => {
            let summary = AccessWorkerPool::new(processor).run_all().await?;
            info!(?summary, "access round finished");
        }
        Command::Detect => {
            let detect = DetectProcess::new(
                cache.clone(),
                manager.reader().clone(),
                access_config.data_list_ttl,
            );
            let pushed = detect.run_from_queue().await?;
            info!(anomalies = pushed, "detect finished");
        }
        Command::Run {
            access_interval_secs,
        } => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let scheduler = Arc::new(RefreshScheduler::new(manager.clone()));
            let pool = Arc::new(AccessWorkerPool::new(processor));

            let refresh = tokio::spawn(scheduler.start(shutdown_rx.clone()));
            let access = tokio::spawn(
                pool.start(Duration::from_secs(access_interval_secs.max(1)), shutdown_rx),
            );
            info!("alarm backend running");

            tokio::signal::ctrl_c().await?;
            info!("shutdown signal received, stopping");
            let _ = shutdown_tx.send(true);
            for handle in [refresh, access] {
                if let Err(err) = handle.await {
                    warn!(error = %err, "background task ended abnormally");
                }
            }
        }
    }
    Ok(())
}

#[cfg(feature = "redis")]
async fn connect_cache(url: Option<&str>, timeout: Duration) -> Result<Arc<dyn CacheBackend>> {
    match url {
        Some(url) => {
            let cache = cache_backend::RedisCache::connect(url, timeout)
                .await
                .context("failed to connect to redis")?;
            Ok(Arc::new(cache))
        }
        None => {
            info!("no redis url given, using in-process cache");
            Ok(Arc::new(MemoryCache::new()))
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_cache(url: Option<&str>, _timeout: Duration) -> Result<Arc<dyn CacheBackend>> {
    if url.is_some() {
        anyhow::bail!("built without redis support; drop --redis-url");
    }
    Ok(Arc::new(MemoryCache::new()))
}
