use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Kafka connection settings shared by every topic worker.
///
/// Broker addresses and credentials are normally injected through the
/// environment by the deployment's bootstrap step; the remaining fields carry
/// the consumer tuning the exporter has always used.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Bootstrap servers (`host:port`).
    #[serde(default)]
    pub brokers: Vec<String>,

    /// SASL/PLAIN username.
    #[serde(default)]
    pub username: String,

    /// SASL/PLAIN password.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// CA certificate used to verify the brokers. When the file exists the
    /// connection uses `SASL_SSL`, otherwise `SASL_PLAINTEXT`.
    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: PathBuf,

    /// Consumer group id.
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Where to start when the group has no committed offset.
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,

    /// Upper bound on a single poll for the next message (milliseconds).
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Upper bound on the broker reachability check while connecting (milliseconds).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: u64,

    #[serde(default = "default_max_partition_fetch_bytes")]
    pub max_partition_fetch_bytes: u64,

    #[serde(default = "default_fetch_min_bytes")]
    pub fetch_min_bytes: u64,

    #[serde(default = "default_fetch_wait_max_ms")]
    pub fetch_wait_max_ms: u64,
}

fn default_ca_cert_path() -> PathBuf {
    PathBuf::from("phy_ca.crt")
}

fn default_group_id() -> String {
    "metric-reader-group".to_string()
}

fn default_auto_offset_reset() -> String {
    "latest".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_fetch_max_bytes() -> u64 {
    104_857_600
}

fn default_max_partition_fetch_bytes() -> u64 {
    20_485_760
}

fn default_fetch_min_bytes() -> u64 {
    1
}

fn default_fetch_wait_max_ms() -> u64 {
    100
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            username: String::new(),
            password: String::new(),
            ca_cert_path: default_ca_cert_path(),
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            poll_timeout_ms: default_poll_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            fetch_max_bytes: default_fetch_max_bytes(),
            max_partition_fetch_bytes: default_max_partition_fetch_bytes(),
            fetch_min_bytes: default_fetch_min_bytes(),
            fetch_wait_max_ms: default_fetch_wait_max_ms(),
        }
    }
}

impl fmt::Debug for KafkaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaConfig")
            .field("brokers", &self.brokers)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ca_cert_path", &self.ca_cert_path)
            .field("group_id", &self.group_id)
            .field("auto_offset_reset", &self.auto_offset_reset)
            .field("poll_timeout_ms", &self.poll_timeout_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish_non_exhaustive()
    }
}

impl KafkaConfig {
    /// Split a comma-separated broker list, trimming whitespace and dropping
    /// empty entries.
    pub fn parse_brokers(list: &str) -> Vec<String> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Bootstrap servers in the comma-joined form the client library expects.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// Transport security to use, decided by whether the CA file is present.
    pub fn security_protocol(&self) -> SecurityProtocol {
        if self.ca_cert_path.exists() {
            SecurityProtocol::SaslSsl
        } else {
            SecurityProtocol::SaslPlaintext
        }
    }

    /// Read the CA certificate (PEM) if it exists.
    pub fn load_ca_cert(&self) -> Result<Option<String>> {
        if !self.ca_cert_path.exists() {
            return Ok(None);
        }
        std::fs::read_to_string(&self.ca_cert_path)
            .map(Some)
            .map_err(|source| Error::Certificate {
                path: self.ca_cert_path.clone(),
                source,
            })
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Names of required settings that are missing.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.brokers.is_empty() {
            missing.push("brokers");
        }
        if self.username.trim().is_empty() {
            missing.push("username");
        }
        if self.password.trim().is_empty() {
            missing.push("password");
        }
        missing
    }
}

/// Kafka transport security.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityProtocol {
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    /// Value of librdkafka's `security.protocol` property.
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::SaslPlaintext => "SASL_PLAINTEXT",
            SecurityProtocol::SaslSsl => "SASL_SSL",
        }
    }
}

impl fmt::Display for SecurityProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Load a configuration file in JSON5 format.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    json5::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}
