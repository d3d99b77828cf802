//! Prometheus exporter for cloud service metrics published on Kafka.
//!
//! One worker per topic consumes measurement envelopes, resolves each record
//! into a series identity and stores the last value in a shared registry.
//! The HTTP server renders the registry on every scrape.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  Kafka topics   │────>│  Topic workers  │────>│    Registry     │
//! │ (one per topic) │     │ (decode/resolve)│     │ (last values)   │
//! └─────────────────┘     └─────────────────┘     └────────┬────────┘
//!                                                          │
//!                                                 ┌────────v────────┐
//!                                                 │   HTTP Server   │
//!                                                 │   (/metrics)    │
//!                                                 └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! KAFKA_URL=10.0.0.1:9092 KAFKA_USER=reader KAFKA_PASSWORD=... \
//!     cloudmetrics-exporter --config exporter.json5
//! ```
//!
//! The `AMAZME_KAFKA_*` variables written by the credential bootstrap step are
//! read when the plain names are unset.
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod broker;
pub mod config;
pub mod exposition;
pub mod http;
pub mod kafka;
pub mod mapping;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod registry;
pub mod supervisor;
pub mod worker;

pub use broker::{BrokerError, BrokerMessage, Connector, Subscription};
pub use config::{ConfigError, ExporterConfig};
pub use http::HttpServer;
pub use kafka::KafkaConnector;
pub use mapping::{SeriesIdentity, SeriesResolver};
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryBroker;
pub use registry::{MetricRegistry, SharedRegistry};
pub use supervisor::{Supervisor, SupervisorHandle, SupervisorStatus};
pub use worker::{TopicWorker, WorkerPhase, WorkerStatus};
