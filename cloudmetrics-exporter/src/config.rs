//! Configuration for the Kafka exporter.
//!
//! Settings come from an optional JSON5 file, then the environment (where the
//! deployment's bootstrap step injects broker address and credentials), and
//! are validated before anything starts.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use cloudmetrics_common::{KafkaConfig, LoggingConfig};

use crate::exposition::exporter_metric;
use crate::http::{HEALTH_PATH, READY_PATH};
use crate::mapping::{build_metric_name, sanitize_topic};

/// Comma-separated bootstrap servers.
pub const ENV_KAFKA_URL: &str = "KAFKA_URL";
/// SASL username.
pub const ENV_KAFKA_USER: &str = "KAFKA_USER";
/// SASL password.
pub const ENV_KAFKA_PASSWORD: &str = "KAFKA_PASSWORD";
/// Comma-separated topic list.
pub const ENV_KAFKA_TOPICS: &str = "KAFKA_TOPICS";
/// Path of the broker CA certificate.
pub const ENV_KAFKA_CA_CERT: &str = "KAFKA_CA_CERT";
/// Consumer group id.
pub const ENV_KAFKA_GROUP_ID: &str = "KAFKA_GROUP_ID";
/// Scrape endpoint listen address.
pub const ENV_EXPORTER_LISTEN: &str = "EXPORTER_LISTEN";

/// Broker address as written by the credential bootstrap step. Read when
/// [`ENV_KAFKA_URL`] is unset.
pub const ENV_BOOTSTRAP_KAFKA_URL: &str = "AMAZME_KAFKA_URL";
/// Bootstrap fallback for [`ENV_KAFKA_USER`].
pub const ENV_BOOTSTRAP_KAFKA_USER: &str = "AMAZME_KAFKA_USER";
/// Bootstrap fallback for [`ENV_KAFKA_PASSWORD`].
pub const ENV_BOOTSTRAP_KAFKA_PASSWORD: &str = "AMAZME_KAFKA_PASSWORD";

/// Characters the router would read as path parameters or wildcards.
const RESERVED_PATH_CHARS: [char; 4] = [':', '*', '{', '}'];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] cloudmetrics_common::Error),
    #[error("Missing required setting(s): {0}")]
    Missing(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Kafka connection settings.
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Topics to consume, one worker each.
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Series registry settings.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Metric filtering settings.
    #[serde(default)]
    pub filters: FilterConfig,

    /// Topic worker lifecycle settings.
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_topics() -> Vec<String> {
    [
        "metrics-from-cloud-dms",
        "metrics-from-cloud-rds",
        "metrics-from-cloud-dcs",
        "metrics-from-cloud-dds",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:8000").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Default labels to add to all metrics.
    #[serde(default)]
    pub default_labels: HashMap<String, String>,

    /// Metric name prefix (default: "cloud_kafka_exporter").
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_prefix() -> String {
    "cloud_kafka_exporter".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            default_labels: HashMap::new(),
            prefix: default_prefix(),
        }
    }
}

/// What to do when a metric name shows up with a second label shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Keep the first-registered shape and reject the others.
    #[default]
    Reject,
    /// Register other shapes under a name qualified by a label-set hash.
    Qualify,
}

/// Series registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum unique series (memory protection).
    #[serde(default = "default_max_series")]
    pub max_series: usize,

    /// Policy for same-name, different-label-shape records.
    #[serde(default)]
    pub label_conflict: ConflictPolicy,
}

fn default_max_series() -> usize {
    100_000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_series: default_max_series(),
            label_conflict: ConflictPolicy::default(),
        }
    }
}

/// Metric filtering configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Glob patterns for exposed metric names to include (empty = all).
    #[serde(default)]
    pub include_metrics: Vec<String>,

    /// Glob patterns for exposed metric names to exclude.
    #[serde(default)]
    pub exclude_metrics: Vec<String>,

    /// Only include these namespaces (empty = all).
    #[serde(default)]
    pub include_namespaces: Vec<String>,

    /// Exclude these namespaces.
    #[serde(default)]
    pub exclude_namespaces: Vec<String>,
}

/// Topic worker and supervisor timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// First delay after a connection failure (milliseconds).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Cap for the doubling connection backoff (milliseconds).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Delay before restarting a worker task that died (milliseconds).
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    /// How long shutdown waits for workers before aborting them (milliseconds).
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_restart_backoff_ms() -> u64 {
    1000
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            restart_backoff_ms: default_restart_backoff_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl ExporterConfig {
    /// Load the effective configuration: optional file, then `env`, then
    /// `overrides` (command line), then validation.
    pub fn load_with_env<F, O>(
        path: Option<&Path>,
        env: F,
        overrides: O,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
        O: FnOnce(&mut Self),
    {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env);
        overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON5 file without validating it.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Ok(cloudmetrics_common::load_config(path)?)
    }

    /// Parse a JSON5 string without validating it.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(cloudmetrics_common::parse_config(content)?)
    }

    /// Overlay values present in the environment. Blank values are ignored.
    ///
    /// Broker address and credentials fall back to the `AMAZME_*` names the
    /// bootstrap step writes.
    pub fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let get_or = |key: &str, fallback: &str| get(key).or_else(|| get(fallback));

        if let Some(url) = get_or(ENV_KAFKA_URL, ENV_BOOTSTRAP_KAFKA_URL) {
            self.kafka.brokers = KafkaConfig::parse_brokers(&url);
        }
        if let Some(user) = get_or(ENV_KAFKA_USER, ENV_BOOTSTRAP_KAFKA_USER) {
            self.kafka.username = user;
        }
        if let Some(password) = get_or(ENV_KAFKA_PASSWORD, ENV_BOOTSTRAP_KAFKA_PASSWORD) {
            self.kafka.password = password;
        }
        if let Some(topics) = get(ENV_KAFKA_TOPICS) {
            self.topics = topics
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(path) = get(ENV_KAFKA_CA_CERT) {
            self.kafka.ca_cert_path = path.into();
        }
        if let Some(group) = get(ENV_KAFKA_GROUP_ID) {
            self.kafka.group_id = group;
        }
        if let Some(listen) = get(ENV_EXPORTER_LISTEN) {
            self.prometheus.listen = listen;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing: Vec<String> = self
            .kafka
            .missing_required()
            .into_iter()
            .map(|field| {
                let (env, fallback) = match field {
                    "brokers" => (ENV_KAFKA_URL, ENV_BOOTSTRAP_KAFKA_URL),
                    "username" => (ENV_KAFKA_USER, ENV_BOOTSTRAP_KAFKA_USER),
                    _ => (ENV_KAFKA_PASSWORD, ENV_BOOTSTRAP_KAFKA_PASSWORD),
                };
                format!("kafka.{} ({} or {})", field, env, fallback)
            })
            .collect();
        if self.topics.is_empty() {
            missing.push(format!("topics ({})", ENV_KAFKA_TOPICS));
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing.join(", ")));
        }

        let reserved = exporter_metric(&self.prometheus.prefix, "");
        let mut seen_topics = HashSet::new();
        let mut seen_fragments: HashMap<String, &str> = HashMap::new();
        for topic in &self.topics {
            if topic.trim().is_empty() {
                return Err(ConfigError::Validation("Topic names must not be blank".into()));
            }
            if !seen_topics.insert(topic.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Topic '{}' is listed twice",
                    topic
                )));
            }
            let fragment = sanitize_topic(topic);
            if let Some(other) = seen_fragments.insert(fragment.clone(), topic.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Topics '{}' and '{}' both map to metric name fragment '{}'",
                    other, topic, fragment
                )));
            }
            // Exporter self-metrics live under `<prefix>_exporter_`
            if build_metric_name(&self.prometheus.prefix, topic, "x").starts_with(&reserved) {
                return Err(ConfigError::Validation(format!(
                    "Topic '{}' would produce series under the reserved '{}' name space",
                    topic, reserved
                )));
            }
        }

        if self.kafka.poll_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "kafka.poll_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.registry.max_series == 0 {
            return Err(ConfigError::Validation(
                "max_series must be > 0".to_string(),
            ));
        }

        if self.workers.initial_backoff_ms == 0 {
            return Err(ConfigError::Validation(
                "initial_backoff_ms must be > 0".to_string(),
            ));
        }

        if self.workers.max_backoff_ms < self.workers.initial_backoff_ms {
            return Err(ConfigError::Validation(
                "max_backoff_ms must be >= initial_backoff_ms".to_string(),
            ));
        }

        if self
            .prometheus
            .listen
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.prometheus.listen
            )));
        }

        let path = self.prometheus.path.as_str();
        if !path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }
        if path == HEALTH_PATH || path == READY_PATH {
            return Err(ConfigError::Validation(format!(
                "Metrics path {} is already served by the exporter",
                path
            )));
        }
        if path.contains(RESERVED_PATH_CHARS) {
            return Err(ConfigError::Validation(format!(
                "Metrics path {} must not contain any of {:?}",
                path, RESERVED_PATH_CHARS
            )));
        }

        Ok(())
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            kafka: KafkaConfig::default(),
            topics: default_topics(),
            prometheus: PrometheusConfig::default(),
            registry: RegistryConfig::default(),
            filters: FilterConfig::default(),
            workers: WorkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
