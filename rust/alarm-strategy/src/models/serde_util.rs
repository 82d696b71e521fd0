//! Lenient field decoders. Upstream records are inconsistent about numbers
//! versus strings for ids, so both shapes are accepted.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?.and_then(value_to_string))
}

pub fn opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?
        .as_ref()
        .and_then(value_to_i64))
}

pub fn i64_or_zero<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(opt_i64(deserializer)?.unwrap_or_default())
}

/// Renders a JSON scalar the way it appears in record dimensions.
pub fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn as_i64(value: &Value) -> Option<i64> {
    value_to_i64(value)
}

/// Accepts epoch seconds or a datetime string (`RFC 3339` or `%Y-%m-%d %H:%M:%S`, UTC).
pub fn epoch_seconds<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(raw)) => parse_datetime(&raw).unwrap_or_default(),
        Some(other) => value_to_i64(&other).unwrap_or_default(),
        None => 0,
    })
}

fn parse_datetime(raw: &str) -> Option<i64> {
    if let Ok(parsed) = raw.trim().parse::<i64>() {
        return Some(parsed);
    }
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.timestamp());
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Stamp {
        #[serde(deserialize_with = "epoch_seconds")]
        at: i64,
    }

    #[test]
    fn timestamps_accept_several_shapes() {
        let cases = [
            (json!({"at": 1_700_000_000}), 1_700_000_000),
            (json!({"at": "1700000000"}), 1_700_000_000),
            (json!({"at": "2023-11-14T22:13:20Z"}), 1_700_000_000),
            (json!({"at": "2023-11-14 22:13:20"}), 1_700_000_000),
            (json!({"at": null}), 0),
        ];
        for (raw, expected) in cases {
            let stamp: Stamp = serde_json::from_value(raw).unwrap();
            assert_eq!(stamp.at, expected);
        }
    }

    #[test]
    fn scalars_render_like_dimensions() {
        assert_eq!(scalar_string(&json!(0)), "0");
        assert_eq!(scalar_string(&json!("0")), "0");
        assert_eq!(as_i64(&json!("12")), Some(12));
    }
}
