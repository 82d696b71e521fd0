//! Per-group progress marker and the query window derived from it.

use crate::error::Result;
use crate::keys;
use cache_backend::CacheBackend;
use std::sync::Arc;
use std::time::Duration;

pub struct Checkpoint {
    cache: Arc<dyn CacheBackend>,
    key: String,
}

impl Checkpoint {
    pub fn new(cache: Arc<dyn CacheBackend>, group: &str) -> Self {
        Self {
            cache,
            key: keys::checkpoint(group),
        }
    }

    /// Last processed data time, if any.
    pub async fn get(&self) -> Result<Option<i64>> {
        let raw = self.cache.get(&self.key).await?;
        Ok(raw.and_then(|raw| raw.trim().parse::<i64>().ok()).filter(|ts| *ts > 0))
    }

    pub async fn set(&self, timestamp: i64, ttl: Duration) -> Result<()> {
        self.cache.set(&self.key, &timestamp.to_string(), Some(ttl)).await?;
        Ok(())
    }
}

/// `[from, until)` for a pull at `now`.
///
/// `until` trails `now` by `time_delay` and is aligned to the interval. `from`
/// re-reads `window_count` intervals before the checkpoint but never reaches
/// past the expiry horizon. Without a checkpoint the pull starts
/// `window_count` intervals before `until`.
pub fn query_window(
    now: i64,
    checkpoint: Option<i64>,
    interval: i64,
    window_count: i64,
    time_delay: Duration,
    expire: Duration,
) -> (i64, i64) {
    let interval = interval.max(1);
    let until = (now - time_delay.as_secs() as i64).div_euclid(interval) * interval;
    let anchor = checkpoint.unwrap_or(until).div_euclid(interval) * interval;
    let from = (anchor - window_count * interval).max(now - expire.as_secs() as i64);
    (from, until)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_trails_now_and_rereads_checkpoint() {
        let delay = Duration::from_secs(60);
        let expire = Duration::from_secs(1800);
        let (from, until) = query_window(10_000, Some(9_800), 60, 3, delay, expire);
        assert_eq!(until, 9_900);
        assert_eq!(from, 9_780 - 180);

        let (from, _) = query_window(10_000, Some(1_000), 60, 3, delay, expire);
        assert_eq!(from, 10_000 - 1800);

        let (from, until) = query_window(10_000, None, 60, 3, delay, expire);
        assert_eq!((from, until), (9_900 - 180, 9_900));
    }
}
