//! Decoding of broker message payloads into measurement records.
//!
//! A payload is a UTF-8 JSON object carrying a `metrics` array:
//!
//! ```json
//! {"metrics": [{
//!     "metric": {
//!         "namespace": "SYS.DMS",
//!         "metric_name": "queue_depth",
//!         "dimensions": [{"name": "instance_id", "value": "abc"}]
//!     },
//!     "value": 42,
//!     "unit": "count"
//! }]}
//! ```
//!
//! Envelope-level problems (not JSON, no `metrics` key) fail the whole
//! payload. Problems with an individual record only reject that record; its
//! siblings are still returned.

use serde_json::{Map, Value};
use thiserror::Error;

/// Unit reported when a record carries none.
pub const DEFAULT_UNIT: &str = "unknown";

/// One observation extracted from a broker message.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    /// Cloud service namespace (e.g. "SYS.DMS").
    pub namespace: String,
    /// Metric name as published upstream.
    pub metric_name: String,
    /// Dimension name/value pairs in publication order, unique by name.
    pub dimensions: Vec<(String, String)>,
    /// The observed value.
    pub value: f64,
    /// Unit of the value, `"unknown"` when absent.
    pub unit: String,
}

impl MeasurementRecord {
    /// Create a record with no dimensions and the default unit.
    pub fn new(namespace: impl Into<String>, metric_name: impl Into<String>, value: f64) -> Self {
        Self {
            namespace: namespace.into(),
            metric_name: metric_name.into(),
            dimensions: Vec::new(),
            value,
            unit: DEFAULT_UNIT.to_string(),
        }
    }

    /// Add a dimension. A dimension with the same name is overwritten in place.
    pub fn with_dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        insert_dimension(&mut self.dimensions, name.into(), value.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }
}

/// Result of decoding one payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    /// Well-formed records, in payload order.
    pub records: Vec<MeasurementRecord>,
    /// Records that were skipped.
    pub rejected: Vec<RejectedRecord>,
}

impl Envelope {
    /// Total number of entries found in the `metrics` array.
    pub fn total(&self) -> usize {
        self.records.len() + self.rejected.len()
    }
}

/// A skipped entry of the `metrics` array.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    /// Position in the `metrics` array.
    pub index: usize,
    pub error: RecordError,
}

/// Payload-level decoding failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvelopeError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("no 'metrics' key found in message")]
    MissingMetrics,

    #[error("'metrics' is not an array")]
    MetricsNotArray,
}

/// Why an individual record was skipped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' has the wrong type")]
    InvalidField(&'static str),

    #[error("value is not numeric: {0}")]
    NonNumericValue(String),

    #[error("dimension {0} is malformed")]
    InvalidDimension(usize),
}

/// Decode a raw payload.
pub fn decode_envelope(payload: &[u8]) -> Result<Envelope, EnvelopeError> {
    let text =
        std::str::from_utf8(payload).map_err(|e| EnvelopeError::InvalidUtf8(e.to_string()))?;
    let root: Value =
        serde_json::from_str(text).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;

    let object = root.as_object().ok_or(EnvelopeError::NotAnObject)?;
    let metrics = object.get("metrics").ok_or(EnvelopeError::MissingMetrics)?;
    let entries = metrics.as_array().ok_or(EnvelopeError::MetricsNotArray)?;

    let mut envelope = Envelope {
        records: Vec::with_capacity(entries.len()),
        rejected: Vec::new(),
    };

    for (index, entry) in entries.iter().enumerate() {
        match decode_record(entry) {
            Ok(record) => envelope.records.push(record),
            Err(error) => envelope.rejected.push(RejectedRecord { index, error }),
        }
    }

    Ok(envelope)
}

/// Decode a single entry of the `metrics` array.
pub fn decode_record(entry: &Value) -> Result<MeasurementRecord, RecordError> {
    let entry = entry.as_object().ok_or(RecordError::NotAnObject)?;

    let metric = entry
        .get("metric")
        .ok_or(RecordError::MissingField("metric"))?
        .as_object()
        .ok_or(RecordError::InvalidField("metric"))?;

    let metric_name = required_str(metric, "metric_name")?;
    let namespace = required_str(metric, "namespace")?;
    let dimensions = decode_dimensions(metric.get("dimensions"))?;

    let value = decode_value(entry.get("value").ok_or(RecordError::MissingField("value"))?)?;

    let unit = match entry.get("unit") {
        None | Some(Value::Null) => DEFAULT_UNIT.to_string(),
        Some(Value::String(unit)) => unit.clone(),
        Some(_) => return Err(RecordError::InvalidField("unit")),
    };

    Ok(MeasurementRecord {
        namespace,
        metric_name,
        dimensions,
        value,
        unit,
    })
}

fn required_str(object: &Map<String, Value>, field: &'static str) -> Result<String, RecordError> {
    match object.get(field) {
        None | Some(Value::Null) => Err(RecordError::MissingField(field)),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(RecordError::MissingField(field)),
        Some(_) => Err(RecordError::InvalidField(field)),
    }
}

// A missing dimension list is an empty one.
fn decode_dimensions(value: Option<&Value>) -> Result<Vec<(String, String)>, RecordError> {
    let items = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(RecordError::InvalidField("dimensions")),
    };

    let mut dimensions = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let item = item.as_object().ok_or(RecordError::InvalidDimension(i))?;
        let name = match item.get("name") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            _ => return Err(RecordError::InvalidDimension(i)),
        };
        let value = match item.get("value") {
            Some(Value::String(v)) => v.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => return Err(RecordError::InvalidDimension(i)),
        };
        insert_dimension(&mut dimensions, name, value);
    }

    Ok(dimensions)
}

// Numbers, numeric strings and booleans are accepted.
fn decode_value(value: &Value) -> Result<f64, RecordError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| RecordError::NonNumericValue(n.to_string())),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| RecordError::NonNumericValue(s.clone())),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(RecordError::NonNumericValue(other.to_string())),
    }
}

fn insert_dimension(dimensions: &mut Vec<(String, String)>, name: String, value: String) {
    match dimensions.iter_mut().find(|(n, _)| *n == name) {
        Some(existing) => existing.1 = value,
        None => dimensions.push((name, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DMS_MESSAGE: &str = r#"{"metrics":[{"metric":{"namespace":"SYS.DMS","metric_name":"queue_depth","dimensions":[{"name":"instance_id","value":"abc"}]},"value":42,"unit":"count"}]}"#;

    #[test]
    fn test_decode_single_record() {
        let envelope = decode_envelope(DMS_MESSAGE.as_bytes()).unwrap();

        assert_eq!(envelope.records.len(), 1);
        assert!(envelope.rejected.is_empty());

        let record = &envelope.records[0];
        assert_eq!(record.namespace, "SYS.DMS");
        assert_eq!(record.metric_name, "queue_depth");
        assert_eq!(
            record.dimensions,
            vec![("instance_id".to_string(), "abc".to_string())]
        );
        assert_eq!(record.value, 42.0);
        assert_eq!(record.unit, "count");
    }

    #[test]
    fn test_malformed_record_does_not_discard_siblings() {
        let payload = r#"{"metrics":[
            {"metric":{"namespace":"SYS.RDS","metric_name":"cpu_util","dimensions":[]},"value":12.5},
            {"metric":{"namespace":"SYS.RDS","dimensions":[]},"value":1},
            {"metric":{"namespace":"SYS.RDS","metric_name":"mem_util","dimensions":[]},"value":"n/a"},
            {"metric":{"namespace":"SYS.RDS","metric_name":"conn_count","dimensions":[]},"value":7}
        ]}"#;

        let envelope = decode_envelope(payload.as_bytes()).unwrap();

        assert_eq!(envelope.total(), 4);
        let names: Vec<_> = envelope
            .records
            .iter()
            .map(|r| r.metric_name.as_str())
            .collect();
        assert_eq!(names, vec!["cpu_util", "conn_count"]);

        assert_eq!(envelope.rejected.len(), 2);
        assert_eq!(envelope.rejected[0].index, 1);
        assert_eq!(
            envelope.rejected[0].error,
            RecordError::MissingField("metric_name")
        );
        assert_eq!(envelope.rejected[1].index, 2);
        assert!(matches!(
            envelope.rejected[1].error,
            RecordError::NonNumericValue(_)
        ));
    }

    #[test]
    fn test_unit_defaults_to_unknown() {
        let payload = concat!(
            r#"{"metrics":[{"metric":{"namespace":"SYS.DCS","metric_name":"keys","#,
            r#""dimensions":[]},"value":3}]}"#
        );
        let envelope = decode_envelope(payload.as_bytes()).unwrap();

        assert_eq!(envelope.records[0].unit, DEFAULT_UNIT);
    }

    #[test]
    fn test_missing_metrics_key() {
        assert_eq!(
            decode_envelope(br#"{"other": []}"#),
            Err(EnvelopeError::MissingMetrics)
        );
    }

    #[test]
    fn test_empty_metrics_array() {
        let envelope = decode_envelope(br#"{"metrics": []}"#).unwrap();
        assert_eq!(envelope, Envelope::default());
    }

    #[test]
    fn test_invalid_payloads() {
        assert!(matches!(
            decode_envelope(b"not json"),
            Err(EnvelopeError::InvalidJson(_))
        ));
        assert!(matches!(
            decode_envelope(&[0xff, 0xfe, 0x00]),
            Err(EnvelopeError::InvalidUtf8(_))
        ));
        assert_eq!(
            decode_envelope(b"[1, 2, 3]"),
            Err(EnvelopeError::NotAnObject)
        );
        assert_eq!(
            decode_envelope(br#"{"metrics": null}"#),
            Err(EnvelopeError::MetricsNotArray)
        );
    }

    #[test]
    fn test_value_coercion() {
        assert_eq!(decode_value(&Value::from(3)), Ok(3.0));
        assert_eq!(decode_value(&Value::from(0.25)), Ok(0.25));
        assert_eq!(decode_value(&Value::from(" 17.5 ")), Ok(17.5));
        assert_eq!(decode_value(&Value::from(true)), Ok(1.0));
        assert!(decode_value(&Value::Null).is_err());
        assert!(decode_value(&serde_json::json!([1])).is_err());
    }

    #[test]
    fn test_duplicate_dimension_last_wins() {
        let entry = serde_json::json!({
            "metric": {
                "namespace": "SYS.DDS",
                "metric_name": "ops",
                "dimensions": [
                    {"name": "node", "value": "a"},
                    {"name": "shard", "value": 2},
                    {"name": "node", "value": "b"}
                ]
            },
            "value": 1
        });

        let record = decode_record(&entry).unwrap();
        assert_eq!(
            record.dimensions,
            vec![
                ("node".to_string(), "b".to_string()),
                ("shard".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn test_missing_dimensions_is_empty() {
        let entry = serde_json::json!({
            "metric": {"namespace": "SYS.DMS", "metric_name": "up"},
            "value": 1
        });
        assert!(decode_record(&entry).unwrap().dimensions.is_empty());
    }

    #[test]
    fn test_malformed_dimension_rejects_record() {
        let entry = serde_json::json!({
            "metric": {
                "namespace": "SYS.DMS",
                "metric_name": "up",
                "dimensions": [{"name": "ok", "value": "1"}, {"value": "orphan"}]
            },
            "value": 1
        });
        assert_eq!(decode_record(&entry), Err(RecordError::InvalidDimension(1)));
    }

    #[test]
    fn test_record_builder() {
        let record = MeasurementRecord::new("SYS.DMS", "lag", 5.0)
            .with_dimension("group", "g1")
            .with_dimension("group", "g2")
            .with_unit("count");

        assert_eq!(
            record.dimensions,
            vec![("group".to_string(), "g2".to_string())]
        );
        assert_eq!(record.unit, "count");
    }
}
