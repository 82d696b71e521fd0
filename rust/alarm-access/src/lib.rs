//! Access stage of the alarm pipeline: pulls each strategy group's data,
//! filters the records and hands them to detection.

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod detect;
pub mod error;
pub mod filters;
pub mod keys;
pub mod lock;
pub mod metrics;
pub mod noise;
pub mod priority;
pub mod processor;
pub mod publish;
pub mod record;
pub mod source;
pub mod worker;

pub use config::AccessConfig;
pub use detect::{Anomaly, DetectProcess, ThresholdDetector};
pub use error::{AccessError, Result};
pub use processor::{AccessDataProcessor, ProcessReport};
pub use record::{AccessItem, DataRecord, RecordData};
pub use source::{DataSource, GroupQuery, RawPoint};
pub use worker::{AccessWorkerPool, RoundSummary};
