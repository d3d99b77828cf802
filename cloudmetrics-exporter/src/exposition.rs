//! Prometheus text exposition format (version 0.0.4).

use std::fmt::Write;

use crate::mapping::LabelSet;
use crate::registry::{RegistryStats, SeriesSnapshot};
use crate::worker::{WorkerPhase, WorkerStatus};

/// Content type of a rendered scrape body.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Render every registry series as a gauge family.
pub fn render_series(output: &mut String, series: &[SeriesSnapshot]) {
    for family in series {
        if family.samples.is_empty() {
            continue;
        }

        let name = &family.identity.name;
        writeln!(output, "# HELP {} {}", name, escape_help(&family.help)).ok();
        writeln!(output, "# TYPE {} gauge", name).ok();
        for (labels, value) in &family.samples {
            writeln!(
                output,
                "{}{} {}",
                name,
                format_labels(labels),
                format_value(*value)
            )
            .ok();
        }
    }
}

/// Render the exporter's own registry counters.
pub fn render_registry_stats(
    output: &mut String,
    prefix: &str,
    stats: &RegistryStats,
    series: usize,
) {
    let metrics: [(&str, &str, &str, f64); 7] = [
        (
            "series",
            "gauge",
            "Label assignments held by the registry",
            series as f64,
        ),
        (
            "series_created_total",
            "counter",
            "Series instances created",
            stats.series_created as f64,
        ),
        (
            "records_received_total",
            "counter",
            "Records offered to the registry",
            stats.records_received as f64,
        ),
        (
            "records_accepted_total",
            "counter",
            "Records stored in the registry",
            stats.records_accepted as f64,
        ),
        (
            "records_filtered_total",
            "counter",
            "Records dropped by metric filters",
            stats.records_filtered as f64,
        ),
        (
            "label_conflicts_total",
            "counter",
            "Records rejected for a conflicting label set",
            stats.label_conflicts as f64,
        ),
        (
            "records_dropped_max_series_total",
            "counter",
            "Records refused because max_series was reached",
            stats.records_dropped_max_series as f64,
        ),
    ];

    for (suffix, kind, help, value) in metrics {
        let name = exporter_metric(prefix, suffix);
        writeln!(output, "# HELP {} {}", name, help).ok();
        writeln!(output, "# TYPE {} {}", name, kind).ok();
        writeln!(output, "{} {}", name, format_value(value)).ok();
    }
}

/// Render per-topic worker health.
pub fn render_worker_status(output: &mut String, prefix: &str, workers: &[(String, WorkerStatus)]) {
    if workers.is_empty() {
        return;
    }

    let families: [(&str, &str, &str, fn(&WorkerStatus) -> Option<f64>); 5] = [
        (
            "topic_up",
            "gauge",
            "Whether the topic worker is consuming (1) or not (0)",
            |s| Some(if s.phase == WorkerPhase::Consuming { 1.0 } else { 0.0 }),
        ),
        (
            "topic_messages_total",
            "counter",
            "Messages received on the topic",
            |s| Some(s.messages as f64),
        ),
        (
            "topic_decode_failures_total",
            "counter",
            "Undecodable messages and malformed records on the topic",
            |s| Some(s.decode_failures as f64),
        ),
        (
            "topic_connect_failures_total",
            "counter",
            "Failed connects and broken sessions for the topic",
            |s| Some(s.connect_failures as f64),
        ),
        (
            "topic_last_error_timestamp_seconds",
            "gauge",
            "Unix time of the last error seen by the topic worker",
            |s| s.last_error.as_ref().map(|e| e.at),
        ),
    ];

    for (suffix, kind, help, extract) in families {
        let samples: Vec<(&str, f64)> = workers
            .iter()
            .filter_map(|(topic, status)| extract(status).map(|v| (topic.as_str(), v)))
            .collect();
        if samples.is_empty() {
            continue;
        }

        let name = exporter_metric(prefix, suffix);
        writeln!(output, "# HELP {} {}", name, help).ok();
        writeln!(output, "# TYPE {} {}", name, kind).ok();
        for (topic, value) in samples {
            writeln!(
                output,
                "{}{{topic=\"{}\"}} {}",
                name,
                escape_label_value(topic),
                format_value(value)
            )
            .ok();
        }
    }
}

/// Name of an exporter self-metric. With an empty suffix this is the name
/// space reserved for them.
pub(crate) fn exporter_metric(prefix: &str, suffix: &str) -> String {
    if prefix.is_empty() {
        format!("exporter_{}", suffix)
    } else {
        format!("{}_exporter_{}", prefix, suffix)
    }
}

/// Escape special characters in label values.
pub fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// HELP text escapes only backslash and newline.
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Format a floating point value for Prometheus.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

/// Format labels for Prometheus exposition format.
pub fn format_labels(labels: &LabelSet) -> String {
    if labels.is_empty() {
        return String::new();
    }

    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();

    format!("{{{}}}", parts.join(","))
}
