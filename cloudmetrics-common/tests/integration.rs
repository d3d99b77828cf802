//! Integration tests for cloudmetrics-common library.

use cloudmetrics_common::{
    DEFAULT_UNIT, EnvelopeError, KafkaConfig, LogFormat, LoggingConfig, MeasurementRecord,
    decode_envelope, load_config,
};
use serde::Deserialize;

/// Build a `metrics` entry the way the cloud telemetry pipeline publishes it.
fn entry(
    namespace: &str,
    metric: &str,
    dims: &[(&str, &str)],
    value: serde_json::Value,
) -> serde_json::Value {
    let dimensions: Vec<_> = dims
        .iter()
        .map(|(n, v)| serde_json::json!({"name": n, "value": v}))
        .collect();
    serde_json::json!({
        "metric": {"namespace": namespace, "metric_name": metric, "dimensions": dimensions},
        "value": value,
        "unit": "count"
    })
}

#[test]
fn test_well_formed_batch_yields_every_record() {
    let entries: Vec<_> = (0..25)
        .map(|i| {
            let instance = format!("inst-{}", i);
            entry(
                "SYS.DMS",
                "queue_depth",
                &[("instance_id", instance.as_str())],
                serde_json::json!(i),
            )
        })
        .collect();
    let payload = serde_json::to_vec(&serde_json::json!({ "metrics": entries })).unwrap();

    let envelope = decode_envelope(&payload).unwrap();

    assert_eq!(envelope.records.len(), 25);
    assert!(envelope.rejected.is_empty());
    for (i, record) in envelope.records.iter().enumerate() {
        assert_eq!(record.value, i as f64);
        assert_eq!(record.dimensions[0].1, format!("inst-{}", i));
    }
}

#[test]
fn test_mixed_batch_keeps_well_formed_subset() {
    let payload = serde_json::to_vec(&serde_json::json!({
        "metrics": [
            entry("SYS.RDS", "cpu", &[("rds_id", "r1")], serde_json::json!(10)),
            {"metric": "not-an-object", "value": 1},
            entry("SYS.RDS", "cpu", &[("rds_id", "r2")], serde_json::json!(null)),
            42,
            entry("SYS.RDS", "cpu", &[("rds_id", "r3")], serde_json::json!("30.5")),
        ]
    }))
    .unwrap();

    let envelope = decode_envelope(&payload).unwrap();

    assert_eq!(envelope.total(), 5);
    let expected = vec![
        MeasurementRecord::new("SYS.RDS", "cpu", 10.0)
            .with_dimension("rds_id", "r1")
            .with_unit("count"),
        MeasurementRecord::new("SYS.RDS", "cpu", 30.5)
            .with_dimension("rds_id", "r3")
            .with_unit("count"),
    ];
    assert_eq!(envelope.records, expected);
    let rejected: Vec<_> = envelope.rejected.iter().map(|r| r.index).collect();
    assert_eq!(rejected, vec![1, 2, 3]);
}

#[test]
fn test_envelope_level_failures() {
    assert_eq!(
        decode_envelope(br#"{"data": {}}"#),
        Err(EnvelopeError::MissingMetrics)
    );
    assert!(decode_envelope(b"").is_err());
    assert!(decode_envelope(br#"{"metrics": [}"#).is_err());
}

#[test]
fn test_record_builder_defaults() {
    let record = MeasurementRecord::new("SYS.DCS", "used_memory", 1024.0);
    assert_eq!(record.unit, DEFAULT_UNIT);
    assert!(record.dimensions.is_empty());
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    kafka: KafkaConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[test]
fn test_load_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exporter.json5");
    std::fs::write(
        &path,
        r#"{
            // comments are allowed in JSON5
            kafka: {
                brokers: ["192.168.0.10:9093"],
                username: "exporter",
                password: "pw",
            },
            logging: { format: "json" },
        }"#,
    )
    .unwrap();

    let config: FileConfig = load_config(&path).unwrap();

    assert_eq!(config.kafka.brokers, vec!["192.168.0.10:9093"]);
    assert_eq!(config.kafka.username, "exporter");
    assert_eq!(config.logging.format, LogFormat::Json);
}

#[test]
fn test_load_config_missing_file() {
    let result: cloudmetrics_common::Result<FileConfig> =
        load_config("/nonexistent/exporter.json5");
    let err = result.unwrap_err().to_string();
    assert!(err.contains("Failed to read config file"));
}
