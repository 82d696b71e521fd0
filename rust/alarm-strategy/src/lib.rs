//! Alarm strategy compilation and the strategy cache.
//!
//! Enabled strategies are validated, expanded against the CMDB, grouped by
//! query fingerprint and published to the cache as a set of read views that
//! the access, detect and no-data stages consume.

pub mod config;
pub mod error;
pub mod facade;
pub mod fingerprint;
pub mod keys;
pub mod ledger;
pub mod manager;
pub mod metric_id;
pub mod metrics;
pub mod models;
pub mod scheduler;
pub mod shield;
pub mod snapshot;
pub mod telemetry;
pub mod topo;
pub mod ttl_cache;
pub mod unit;

pub use config::{DisableRule, StrategyConfig};
pub use error::{Result, StrategyError};
pub use facade::{Cmdb, ConfigSource, Host, MetricRegistry};
pub use keys::StrategyKeys;
pub use manager::{RefreshReport, StrategyCacheManager, StrategyReader};
pub use scheduler::RefreshScheduler;
pub use snapshot::{Snapshot, SnapshotSource};
pub use topo::TopologyResolver;
