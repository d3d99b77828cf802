//! Cloud Metrics Common Library
//!
//! Shared types and utilities for the cloud metrics Kafka exporter:
//!
//! - [`envelope`] - Broker payload decoding (`MeasurementRecord`, `Envelope`)
//! - [`config`] - Kafka and logging configuration, JSON5 loading
//! - [`error`] - Error types

pub mod config;
pub mod envelope;
pub mod error;

// Re-export commonly used types at the crate root
pub use config::{
    KafkaConfig, LogFormat, LoggingConfig, SecurityProtocol, load_config, parse_config,
};
pub use envelope::{
    DEFAULT_UNIT, Envelope, EnvelopeError, MeasurementRecord, RecordError, RejectedRecord,
    decode_envelope,
};
pub use error::{Error, Result};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `config.level` when set. `LogFormat::Json` emits one
/// JSON object per event for log shippers.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let output = match config.format {
        LogFormat::Text => fmt::layer().with_target(false).boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()
        .map_err(|e| Error::Tracing(e.to_string()))
}
