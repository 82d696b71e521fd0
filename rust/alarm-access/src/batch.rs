//! Shard transport for oversized pulls: gzip-compressed, base64-encoded JSON.

use crate::error::{AccessError, Result};
use crate::source::RawPoint;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::{Read, Write};

/// Outcome a shard worker reports back to the coordinating worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub sub_task_id: String,
    pub result: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub pushed: usize,
    #[serde(default)]
    pub last_time: i64,
}

pub fn encode_shard(points: &[RawPoint]) -> Result<String> {
    let json = serde_json::to_vec(points)?;
    let compress = |json: &[u8]| -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(json)?;
        encoder.finish()
    };
    let compressed =
        compress(&json).map_err(|err| AccessError::Batch(format!("compress failed: {err}")))?;
    Ok(STANDARD.encode(compressed))
}

pub fn decode_shard(encoded: &str) -> Result<Vec<RawPoint>> {
    let compressed = STANDARD
        .decode(encoded.trim())
        .map_err(|err| AccessError::Batch(format!("invalid base64: {err}")))?;
    let mut json = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut json)
        .map_err(|err| AccessError::Batch(format!("decompress failed: {err}")))?;
    Ok(serde_json::from_slice(&json)?)
}

/// Keeps only the points of the earliest `max` distinct timestamps after
/// `after`; points at or before `after` are re-reads and always kept. Returns
/// the last kept timestamp when anything was cut. Zero keeps everything.
pub fn limit_time_points(points: Vec<RawPoint>, max: usize, after: i64) -> (Vec<RawPoint>, Option<i64>) {
    if max == 0 {
        return (points, None);
    }
    let times: BTreeSet<i64> = points
        .iter()
        .map(|point| point.time)
        .filter(|time| *time > after)
        .collect();
    if times.len() <= max {
        return (points, None);
    }
    let Some(&last_kept) = times.iter().nth(max - 1) else {
        return (points, None);
    };
    let kept = points
        .into_iter()
        .filter(|point| point.time <= last_kept)
        .collect();
    (kept, Some(last_kept))
}

/// Splits time-ordered points into shards of about `size` points. A shard
/// never ends between two points with the same timestamp.
pub fn split_points(points: Vec<RawPoint>, size: usize) -> Vec<Vec<RawPoint>> {
    let size = size.max(1);
    let mut points = points;
    points.sort_by_key(|point| point.time);
    let mut shards = Vec::new();
    let mut current: Vec<RawPoint> = Vec::new();
    for point in points {
        let boundary = current.len() >= size
            && current.last().is_some_and(|last| last.time != point.time);
        if boundary {
            shards.push(std::mem::take(&mut current));
        }
        current.push(point);
    }
    if !current.is_empty() {
        shards.push(current);
    }
    shards
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(time: i64) -> RawPoint {
        serde_json::from_value(json!({"dimensions": {"bk_target_ip": "127.0.0.1"}, "value": 1.0, "time": time}))
            .unwrap()
    }

    #[test]
    fn shard_survives_transport() {
        let points = vec![point(60), point(120)];
        let encoded = encode_shard(&points).unwrap();
        assert_eq!(decode_shard(&encoded).unwrap(), points);
        assert!(matches!(decode_shard("not base64!"), Err(AccessError::Batch(_))));
    }

    #[test]
    fn equal_timestamps_stay_together() {
        let points = vec![point(60), point(60), point(60), point(120), point(180)];
        let shards = split_points(points, 2);
        let times: Vec<Vec<i64>> = shards
            .iter()
            .map(|shard| shard.iter().map(|p| p.time).collect())
            .collect();
        assert_eq!(times, vec![vec![60, 60, 60], vec![120, 180]]);
    }

    #[test]
    fn unordered_pull_is_sorted_before_splitting() {
        let points = vec![point(120), point(60), point(180), point(60)];
        let shards = split_points(points, 1);
        let times: Vec<Vec<i64>> = shards
            .iter()
            .map(|shard| shard.iter().map(|p| p.time).collect())
            .collect();
        assert_eq!(times, vec![vec![60, 60], vec![120], vec![180]]);
    }

    #[test]
    fn time_point_limit_keeps_whole_timestamps() {
        let points = vec![point(180), point(60), point(120), point(60)];
        let (kept, last) = limit_time_points(points.clone(), 2, i64::MIN);
        let mut times: Vec<i64> = kept.iter().map(|p| p.time).collect();
        times.sort_unstable();
        assert_eq!(times, vec![60, 60, 120]);
        assert_eq!(last, Some(120));

        assert_eq!(limit_time_points(points.clone(), 3, i64::MIN), (points.clone(), None));
        assert_eq!(limit_time_points(points.clone(), 0, i64::MIN), (points, None));
    }

    #[test]
    fn time_point_limit_ignores_reread_timestamps() {
        let points = vec![point(60), point(120), point(180), point(240)];
        let (kept, last) = limit_time_points(points.clone(), 1, 120);
        let times: Vec<i64> = kept.iter().map(|p| p.time).collect();
        assert_eq!(times, vec![60, 120, 180]);
        assert_eq!(last, Some(180));

        assert_eq!(limit_time_points(points.clone(), 2, 120), (points, None));
    }
}
