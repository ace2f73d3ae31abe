use crate::error::ValidationError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;

const TIMESTAMP_FIELD: &str = "timestamp";
const CHANNELS_FIELD: &str = "data";

/// One normalized sample ready for buffering.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub timestamp: String,
    pub payload: Value,
    pub owner: Arc<str>,
}

impl Record {
    /// Number of channels in the sample, when the payload carries a `data` array.
    pub fn channel_count(&self) -> usize {
        self.payload
            .get(CHANNELS_FIELD)
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Turns raw device values into [`Record`]s for a single owner.
#[derive(Debug, Clone)]
pub struct Normalizer {
    owner: Arc<str>,
}

impl Normalizer {
    pub fn new(owner: impl Into<Arc<str>>) -> Self {
        Self {
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Decode a device payload and normalize it against the wall clock.
    pub fn normalize_payload(&self, payload: &mut [u8]) -> Result<Record, ValidationError> {
        let raw: Value = simd_json::serde::from_slice(payload)
            .map_err(|err| ValidationError::Malformed(err.to_string()))?;
        self.normalize(raw)
    }

    pub fn normalize(&self, raw: Value) -> Result<Record, ValidationError> {
        self.normalize_at(raw, Utc::now())
    }

    /// Upstream timestamps are kept verbatim; a missing one is stamped with `now`.
    ///
    /// Numeric timestamps go through `serde_json::Number`, so integers keep their
    /// exact text while floats are rendered in serde_json's shortest form
    /// (`1.50` becomes `"1.5"`).
    pub fn normalize_at(&self, raw: Value, now: DateTime<Utc>) -> Result<Record, ValidationError> {
        let mut fields = match raw {
            Value::Object(fields) => fields,
            other => {
                return Err(ValidationError::NotAnObject {
                    kind: value_kind(&other),
                })
            }
        };

        let existing = match fields.get(TIMESTAMP_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(other) => {
                return Err(ValidationError::InvalidTimestamp {
                    kind: value_kind(other),
                })
            }
        };

        let timestamp = match existing {
            Some(ts) => ts,
            None => {
                let stamped = now.to_rfc3339_opts(SecondsFormat::Micros, true);
                fields.insert(TIMESTAMP_FIELD.to_string(), Value::String(stamped.clone()));
                stamped
            }
        };

        Ok(Record {
            timestamp,
            payload: Value::Object(fields),
            owner: self.owner.clone(),
        })
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap() + chrono::Duration::microseconds(250)
    }

    #[test]
    fn keeps_upstream_string_timestamp_verbatim() {
        let normalizer = Normalizer::new("ada");
        let raw = json!({"timestamp": "2024-03-01T12:00:00.123456789+02:00", "data": [[1.0]]});
        let record = normalizer.normalize_at(raw.clone(), fixed_now()).unwrap();
        assert_eq!(record.timestamp, "2024-03-01T12:00:00.123456789+02:00");
        assert_eq!(record.payload, raw);
        assert_eq!(&*record.owner, "ada");
        assert_eq!(normalizer.owner(), "ada");
    }

    #[test]
    fn keeps_numeric_timestamp_text() {
        let normalizer = Normalizer::new("ada");
        let record = normalizer
            .normalize_at(json!({"timestamp": 1709296205123_i64}), fixed_now())
            .unwrap();
        assert_eq!(record.timestamp, "1709296205123");

        let record = normalizer
            .normalize_at(json!({"timestamp": 1709296205.5}), fixed_now())
            .unwrap();
        assert_eq!(record.timestamp, "1709296205.5");
        assert_eq!(record.payload["timestamp"], json!(1709296205.5));
    }

    #[test]
    fn stamps_missing_timestamp_with_microseconds() {
        let normalizer = Normalizer::new("ada");
        let record = normalizer
            .normalize_at(json!({"data": [[1.0, 2.0], [3.0, 4.0]]}), fixed_now())
            .unwrap();
        assert_eq!(record.timestamp, "2024-03-01T12:30:05.000250Z");
        assert_eq!(record.payload["timestamp"], json!("2024-03-01T12:30:05.000250Z"));
        assert_eq!(record.channel_count(), 2);
    }

    #[test]
    fn empty_or_null_timestamp_is_restamped() {
        let normalizer = Normalizer::new("ada");
        for raw in [json!({"timestamp": ""}), json!({"timestamp": null})] {
            let record = normalizer.normalize_at(raw, fixed_now()).unwrap();
            assert_eq!(record.timestamp, "2024-03-01T12:30:05.000250Z");
        }
    }

    #[test]
    fn rejects_non_object_values() {
        let normalizer = Normalizer::new("ada");
        let err = normalizer.normalize(json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, ValidationError::NotAnObject { kind: "array" }));
    }

    #[test]
    fn rejects_structured_timestamp() {
        let normalizer = Normalizer::new("ada");
        let err = normalizer
            .normalize(json!({"timestamp": {"ms": 1}}))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidTimestamp { kind: "object" }));
    }

    #[test]
    fn normalize_payload_rejects_garbage_bytes() {
        let normalizer = Normalizer::new("ada");
        let mut bytes = b"{not json".to_vec();
        let err = normalizer.normalize_payload(&mut bytes).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));

        let mut bytes = br#"{"data":[[0.5]],"info":{"channelNames":["CP3"]}}"#.to_vec();
        let record = normalizer.normalize_payload(&mut bytes).unwrap();
        assert_eq!(record.channel_count(), 1);
        assert_eq!(record.payload["info"]["channelNames"][0], json!("CP3"));
    }
}
