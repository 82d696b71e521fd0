//! Noise-reduction counters: distinct dimension combinations seen per
//! strategy, scored by record time.

use crate::record::DataRecord;
use alarm_strategy::fingerprint::count_md5;
use serde_json::{json, Map, Value};

/// Hash naming the dimension set a strategy reduces noise over.
pub fn dimension_hash(dimensions: &[String]) -> String {
    count_md5(&json!(dimensions))
}

/// Hash of the record's values for the noise dimensions. Missing dimensions
/// count as null.
pub fn record_member(record: &DataRecord, dimensions: &[String]) -> String {
    let picked: Map<String, Value> = dimensions
        .iter()
        .map(|name| {
            let value = record.data.dimensions.get(name).cloned().unwrap_or(Value::Null);
            (name.clone(), value)
        })
        .collect();
    count_md5(&Value::Object(picked))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RawPoint;

    fn record(ip: &str, extra: &str) -> DataRecord {
        let point: RawPoint = serde_json::from_value(json!({
            "dimensions": {"bk_target_ip": ip, "device": extra},
            "value": 1.0,
            "time": 60
        }))
        .unwrap();
        DataRecord::new(&[], point).unwrap()
    }

    #[test]
    fn members_depend_only_on_noise_dimensions() {
        let dims = vec!["bk_target_ip".to_string()];
        assert_eq!(record_member(&record("a", "x"), &dims), record_member(&record("a", "y"), &dims));
        assert_ne!(record_member(&record("a", "x"), &dims), record_member(&record("b", "x"), &dims));
        assert_eq!(
            dimension_hash(&["b".into(), "a".into()]),
            dimension_hash(&["a".into(), "b".into()])
        );
    }
}
