//! Mapping from measurement records to Prometheus series identities.

use std::collections::{BTreeMap, HashMap};

use cloudmetrics_common::MeasurementRecord;
use thiserror::Error;

/// Label that always carries the record's cloud namespace.
pub const NAMESPACE_LABEL: &str = "namespace";

/// A concrete label assignment, ordered by label name.
pub type LabelSet = BTreeMap<String, String>;

/// A record that cannot be turned into a label assignment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("dimensions '{first}' and '{second}' both map to label '{label}'")]
    LabelCollision {
        label: String,
        first: String,
        second: String,
    },
}

/// Sanitize a metric name to be Prometheus-compatible.
///
/// Prometheus metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
/// This function:
/// - Replaces invalid characters with underscores
/// - Ensures the name starts with a letter or underscore
/// - Collapses multiple underscores into one
pub fn sanitize_metric_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len() + 1);
    let mut last_was_underscore = false;
    let mut chars = name.chars().peekable();

    // A leading digit is kept behind an underscore
    if let Some(&first) = chars.peek()
        && first.is_ascii_digit()
    {
        result.push('_');
        last_was_underscore = true;
    }

    for c in chars {
        let is_valid_char = c.is_ascii_alphanumeric() || c == '_' || c == ':';

        if is_valid_char {
            if c == '_' {
                if !last_was_underscore {
                    result.push(c);
                    last_was_underscore = true;
                }
            } else {
                result.push(c);
                last_was_underscore = false;
            }
        } else if !last_was_underscore {
            result.push('_');
            last_was_underscore = true;
        }
    }

    while result.ends_with('_') {
        result.pop();
    }

    if result.is_empty() {
        result.push_str("unnamed");
    }

    result
}

/// Sanitize a label name to be Prometheus-compatible.
///
/// Prometheus label names must match `[a-zA-Z_][a-zA-Z0-9_]*`.
/// Labels starting with `__` are reserved for internal use.
pub fn sanitize_label_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    let mut last_was_underscore = false;

    for (i, c) in name.chars().enumerate() {
        let valid = if i == 0 {
            c.is_ascii_alphabetic() || c == '_'
        } else {
            c.is_ascii_alphanumeric() || c == '_'
        };

        if valid {
            result.push(c);
            last_was_underscore = c == '_';
        } else if !last_was_underscore {
            result.push('_');
            last_was_underscore = true;
        }
    }

    while result.ends_with('_') {
        result.pop();
    }

    if result.is_empty() {
        return "label".to_string();
    }

    if result.starts_with("__") {
        result.insert(0, 'z');
    }

    result
}

/// Sanitize a topic name for use inside a metric name.
///
/// Every character outside `[a-zA-Z0-9_]` becomes exactly one underscore.
/// Runs are not collapsed, so `a-b` and `a--b` stay distinct.
pub fn sanitize_topic(topic: &str) -> String {
    let sanitized: String = topic
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    if sanitized.is_empty() {
        "unnamed".to_string()
    } else {
        sanitized
    }
}

/// Build the exposed metric name for a record published on `topic`.
///
/// Format: `{prefix}_{topic}_{metric}`
pub fn build_metric_name(prefix: &str, topic: &str, metric: &str) -> String {
    let topic = sanitize_topic(topic);
    let metric = sanitize_metric_name(metric);

    let name = if prefix.is_empty() {
        format!("{}_{}", topic, metric)
    } else {
        format!("{}_{}_{}", prefix, topic, metric)
    };

    // A topic starting with a digit under an empty prefix
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        format!("_{}", name)
    } else {
        name
    }
}

/// The name and label-name set of one logical time series.
///
/// Label names are kept sorted and unique, so two identities built from the
/// same names in any order compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesIdentity {
    /// Full exposed metric name.
    pub name: String,
    /// Sorted label names.
    pub label_names: Vec<String>,
}

impl SeriesIdentity {
    pub fn new<I, S>(name: impl Into<String>, label_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut label_names: Vec<String> = label_names.into_iter().map(Into::into).collect();
        label_names.sort();
        label_names.dedup();
        Self {
            name: name.into(),
            label_names,
        }
    }

    /// Identity of the series a label assignment belongs to.
    pub fn for_labels(name: impl Into<String>, labels: &LabelSet) -> Self {
        Self {
            name: name.into(),
            label_names: labels.keys().cloned().collect(),
        }
    }

    /// Whether a label assignment names exactly this identity's labels.
    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.label_names.len() == labels.len()
            && self.label_names.iter().zip(labels.keys()).all(|(a, b)| a == b)
    }

    /// Same identity under a different exposed name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label_names: self.label_names.clone(),
        }
    }
}

/// A record resolved into series coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSample {
    pub identity: SeriesIdentity,
    /// One value per label name of `identity`.
    pub labels: LabelSet,
    pub value: f64,
    pub unit: String,
    /// Cloud namespace of the originating record.
    pub namespace: String,
}

/// Resolves records into series identities for one exporter.
#[derive(Debug, Clone)]
pub struct SeriesResolver {
    prefix: String,
    default_labels: Vec<(String, String)>,
}

impl SeriesResolver {
    pub fn new(prefix: impl Into<String>, default_labels: &HashMap<String, String>) -> Self {
        let mut default_labels: Vec<(String, String)> = default_labels
            .iter()
            .map(|(k, v)| (sanitize_label_name(k), v.clone()))
            .collect();
        default_labels.sort();

        Self {
            prefix: prefix.into(),
            default_labels,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Resolve a record received on `topic`.
    ///
    /// Labels are `namespace` plus every dimension. A dimension that is itself
    /// called `namespace` replaces the record namespace. Default labels fill
    /// in only names the record does not already carry. Two dimensions that
    /// sanitize to the same label name reject the record.
    pub fn resolve(
        &self,
        topic: &str,
        record: &MeasurementRecord,
    ) -> Result<ResolvedSample, MappingError> {
        let name = build_metric_name(&self.prefix, topic, &record.metric_name);

        let mut labels = LabelSet::new();
        labels.insert(NAMESPACE_LABEL.to_string(), record.namespace.clone());
        let mut sources: HashMap<String, &str> = HashMap::with_capacity(record.dimensions.len());
        for (dim, value) in &record.dimensions {
            let label = sanitize_label_name(dim);
            if let Some(first) = sources.insert(label.clone(), dim.as_str()) {
                return Err(MappingError::LabelCollision {
                    label,
                    first: first.to_string(),
                    second: dim.clone(),
                });
            }
            labels.insert(label, value.clone());
        }
        for (key, value) in &self.default_labels {
            labels
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }

        Ok(ResolvedSample {
            identity: SeriesIdentity::for_labels(name, &labels),
            labels,
            value: record.value,
            unit: record.unit.clone(),
            namespace: record.namespace.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_metric_name_simple() {
        assert_eq!(sanitize_metric_name("cpu_util"), "cpu_util");
        assert_eq!(sanitize_metric_name("queue_depth"), "queue_depth");
    }

    #[test]
    fn test_sanitize_metric_name_special_chars() {
        assert_eq!(sanitize_metric_name("cpu.usage%"), "cpu_usage");
        assert_eq!(sanitize_metric_name("memory-used"), "memory_used");
        assert_eq!(sanitize_metric_name("disk[sda]"), "disk_sda");
    }

    #[test]
    fn test_sanitize_metric_name_collapse_underscores() {
        assert_eq!(sanitize_metric_name("cpu___usage"), "cpu_usage");
        assert_eq!(sanitize_metric_name("a//b//c"), "a_b_c");
    }

    #[test]
    fn test_sanitize_metric_name_leading_number() {
        assert_eq!(sanitize_metric_name("1cpu"), "_1cpu");
    }

    #[test]
    fn test_sanitize_metric_name_empty() {
        assert_eq!(sanitize_metric_name(""), "unnamed");
        assert_eq!(sanitize_metric_name("///"), "unnamed");
    }

    #[test]
    fn test_sanitize_label_name() {
        assert_eq!(sanitize_label_name("instance_id"), "instance_id");
        assert_eq!(sanitize_label_name("kafka-topic"), "kafka_topic");
        assert_eq!(sanitize_label_name("rds.node"), "rds_node");
        assert_eq!(sanitize_label_name("__meta"), "z__meta");
    }

    #[test]
    fn test_sanitize_topic_is_per_character() {
        assert_eq!(
            sanitize_topic("metrics-from-cloud-dms"),
            "metrics_from_cloud_dms"
        );
        assert_ne!(sanitize_topic("a-b"), sanitize_topic("a--b"));
        assert_eq!(sanitize_topic("a.b"), "a_b");
        assert_eq!(sanitize_topic(""), "unnamed");
    }

    #[test]
    fn test_build_metric_name() {
        assert_eq!(
            build_metric_name("cloud_kafka_exporter", "metrics-from-cloud-dms", "queue_depth"),
            "cloud_kafka_exporter_metrics_from_cloud_dms_queue_depth"
        );
        assert_eq!(build_metric_name("", "rds", "cpu"), "rds_cpu");
        assert_eq!(build_metric_name("", "9topic", "cpu"), "_9topic_cpu");
    }

    #[test]
    fn test_identity_label_order_irrelevant() {
        let a = SeriesIdentity::new("m", ["namespace", "instance_id"]);
        let b = SeriesIdentity::new("m", vec!["instance_id", "namespace", "instance_id"]);
        assert_eq!(a, b);
        assert_eq!(a.label_names, vec!["instance_id", "namespace"]);

        let c = SeriesIdentity::new("m", ["namespace"]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_identity_matches_labels() {
        let identity = SeriesIdentity::new("m", ["namespace", "node"]);
        let mut labels = LabelSet::new();
        labels.insert("namespace".into(), "SYS.DDS".into());
        assert!(!identity.matches(&labels));
        labels.insert("node".into(), "n1".into());
        assert!(identity.matches(&labels));
        labels.insert("extra".into(), "x".into());
        assert!(!identity.matches(&labels));
    }

    #[test]
    fn test_resolve_dms_record() {
        let resolver = SeriesResolver::new("cloud_kafka_exporter", &HashMap::new());
        let record = MeasurementRecord::new("SYS.DMS", "queue_depth", 42.0)
            .with_dimension("instance_id", "abc")
            .with_unit("count");

        let sample = resolver.resolve("metrics-from-cloud-dms", &record).unwrap();

        assert_eq!(
            sample.identity.name,
            "cloud_kafka_exporter_metrics_from_cloud_dms_queue_depth"
        );
        assert_eq!(sample.identity.label_names, vec!["instance_id", "namespace"]);
        assert_eq!(sample.labels["namespace"], "SYS.DMS");
        assert_eq!(sample.labels["instance_id"], "abc");
        assert_eq!(sample.value, 42.0);
        assert_eq!(sample.unit, "count");
        assert!(sample.identity.matches(&sample.labels));
    }

    #[test]
    fn test_resolve_dimension_overrides_namespace() {
        let resolver = SeriesResolver::new("p", &HashMap::new());
        let record =
            MeasurementRecord::new("SYS.RDS", "cpu", 1.0).with_dimension("namespace", "custom");

        let sample = resolver.resolve("t", &record).unwrap();

        assert_eq!(sample.labels.len(), 1);
        assert_eq!(sample.labels["namespace"], "custom");
        assert_eq!(sample.namespace, "SYS.RDS");
    }

    #[test]
    fn test_resolve_default_labels_do_not_override() {
        let mut defaults = HashMap::new();
        defaults.insert("region".to_string(), "ru-moscow-1".to_string());
        defaults.insert("instance_id".to_string(), "default".to_string());
        let resolver = SeriesResolver::new("p", &defaults);

        let record =
            MeasurementRecord::new("SYS.DCS", "keys", 5.0).with_dimension("instance_id", "dcs-1");
        let sample = resolver.resolve("t", &record).unwrap();

        assert_eq!(sample.labels["region"], "ru-moscow-1");
        assert_eq!(sample.labels["instance_id"], "dcs-1");
        assert_eq!(
            sample.identity.label_names,
            vec!["instance_id", "namespace", "region"]
        );
    }

    #[test]
    fn test_resolve_different_dimensions_different_identity() {
        let resolver = SeriesResolver::new("p", &HashMap::new());
        let a = MeasurementRecord::new("SYS.DMS", "lag", 1.0).with_dimension("instance_id", "i");
        let b = MeasurementRecord::new("SYS.DMS", "lag", 1.0)
            .with_dimension("instance_id", "i")
            .with_dimension("topic", "orders");

        let ia = resolver.resolve("t", &a).unwrap().identity;
        let ib = resolver.resolve("t", &b).unwrap().identity;

        assert_eq!(ia.name, ib.name);
        assert_ne!(ia, ib);
    }

    #[test]
    fn test_resolve_rejects_colliding_dimensions() {
        let resolver = SeriesResolver::new("p", &HashMap::new());
        let record = MeasurementRecord::new("SYS.X", "m", 1.0)
            .with_dimension("instance-id", "a")
            .with_dimension("instance_id", "b");

        let err = resolver.resolve("t", &record).unwrap_err();

        assert_eq!(
            err,
            MappingError::LabelCollision {
                label: "instance_id".to_string(),
                first: "instance-id".to_string(),
                second: "instance_id".to_string(),
            }
        );
    }
}
