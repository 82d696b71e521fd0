use super::labels::HistoryOperate;
use super::serde_util::{epoch_seconds, opt_i64};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row of the strategy change journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub strategy_id: i64,
    pub operate: HistoryOperate,
    #[serde(default)]
    pub content: Value,
    #[serde(default, deserialize_with = "epoch_seconds")]
    pub create_time: i64,
}

#[derive(Deserialize)]
struct ContentHead {
    #[serde(default, deserialize_with = "opt_i64")]
    bk_biz_id: Option<i64>,
    #[serde(default)]
    is_enabled: Option<bool>,
}

impl HistoryRecord {
    pub fn is_delete(&self) -> bool {
        self.operate == HistoryOperate::Delete
    }

    pub fn bk_biz_id(&self) -> Option<i64> {
        self.head().and_then(|head| head.bk_biz_id)
    }

    /// Whether the snapshot leaves the strategy enabled. Missing flags count as enabled.
    pub fn is_enabled(&self) -> bool {
        self.head()
            .and_then(|head| head.is_enabled)
            .unwrap_or(true)
    }

    fn head(&self) -> Option<ContentHead> {
        serde_json::from_value(self.content.clone()).ok()
    }
}
