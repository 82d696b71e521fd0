//! Cache keys written and read by the access and detect stages.

pub const DATA_SIGNAL: &str = "data_signal";
pub const ANOMALY_SIGNAL: &str = "anomaly_signal";

pub fn data_list(strategy_id: i64, item_id: i64) -> String {
    format!("data_list:{strategy_id}:{item_id}")
}

pub fn no_data_list(strategy_id: i64, item_id: i64) -> String {
    format!("no_data_list:{strategy_id}:{item_id}")
}

pub fn anomaly_list(strategy_id: i64, item_id: i64) -> String {
    format!("anomaly_list:{strategy_id}:{item_id}")
}

pub fn noise_reduce(strategy_id: i64, dimension_hash: &str) -> String {
    format!("noise_reduce:{strategy_id}:{dimension_hash}")
}

pub fn checkpoint(group: &str) -> String {
    format!("access_checkpoint:{group}")
}

pub fn lock(group: &str) -> String {
    format!("access_lock:{group}")
}

/// Hash of `dimensions_md5 -> "priority:time"` per priority group.
pub fn priority(priority_group_key: &str) -> String {
    format!("access_priority:{priority_group_key}")
}

pub fn duplicate(group: &str) -> String {
    format!("access_duplicate:{group}")
}

/// Shard `n` of the batch started at `timestamp`; `sub_task_id` is `"{timestamp}.{n}"`.
pub fn batch_data(group: &str, sub_task_id: &str) -> String {
    format!("access_batch_data:{group}:{sub_task_id}")
}

pub fn batch_result(group: &str, timestamp: i64) -> String {
    format!("access_batch_data_result:{group}:{timestamp}")
}
