mod group;
mod history;
mod labels;
mod query;
pub(crate) mod serde_util;
mod strategy;
mod target;

pub use group::StrategyGroup;
pub use history::HistoryRecord;
pub use labels::{
    AlgorithmType, ConditionMethod, DataSourceLabel, DataTypeLabel, HistoryOperate, InvalidType,
    TargetField, TemplateKind,
};
pub use query::{AggCondition, QueryConfig};
pub use strategy::{
    Algorithm, DetectSpec, Item, NoDataConfig, NoiseReduceConfig, NoticeConfig, NoticeOptions,
    NoticeSpec, Strategy,
};
pub use target::{HostKey, Target, TargetCondition, TargetValue, TopoNode};
