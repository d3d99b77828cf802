//! Kafka implementation of the broker traits, on top of rdkafka.

use std::sync::Arc;
use std::time::Duration;

use cloudmetrics_common::{KafkaConfig, SecurityProtocol};
use rdkafka::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use tracing::{debug, info, warn};

use crate::broker::{BrokerError, BrokerMessage, Connector, Subscription};

/// Pause after a transient consume error, capped by the poll bound.
const TRANSIENT_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Whether the consumer recovers from `error` on its own.
///
/// Consumption errors are reported per fetch and librdkafka keeps retrying
/// behind them. Fatal and authorization failures need a new session.
fn is_transient(error: &KafkaError) -> bool {
    match error {
        KafkaError::MessageConsumption(code) => !matches!(
            code,
            RDKafkaErrorCode::Fatal
                | RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
        ),
        KafkaError::PartitionEOF(_) => true,
        _ => false,
    }
}

/// Opens one consumer per topic with SASL/PLAIN credentials.
pub struct KafkaConnector {
    config: KafkaConfig,
}

impl KafkaConnector {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }

    /// Build the client configuration for a consumer.
    ///
    /// The transport is `SASL_SSL` when the CA file exists, trusting only
    /// that CA; otherwise `SASL_PLAINTEXT`.
    fn client_config(&self) -> Result<ClientConfig, BrokerError> {
        let kafka = &self.config;
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", kafka.bootstrap_servers())
            .set("group.id", &kafka.group_id)
            .set("auto.offset.reset", &kafka.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.partition.eof", "false")
            .set("fetch.max.bytes", kafka.fetch_max_bytes.to_string())
            .set(
                "max.partition.fetch.bytes",
                kafka.max_partition_fetch_bytes.to_string(),
            )
            .set("fetch.min.bytes", kafka.fetch_min_bytes.to_string())
            .set("fetch.wait.max.ms", kafka.fetch_wait_max_ms.to_string())
            .set("security.protocol", kafka.security_protocol().as_str())
            .set("sasl.mechanism", "PLAIN")
            .set("sasl.username", &kafka.username)
            .set("sasl.password", &kafka.password);

        if kafka.security_protocol() == SecurityProtocol::SaslSsl {
            let pem = kafka
                .load_ca_cert()
                .map_err(|e| BrokerError::Tls(e.to_string()))?
                .ok_or_else(|| {
                    BrokerError::Tls(format!(
                        "CA certificate {} disappeared",
                        kafka.ca_cert_path.display()
                    ))
                })?;
            // Chain is verified against the CA, hostnames are not checked
            config
                .set("ssl.ca.pem", pem)
                .set("ssl.endpoint.identification.algorithm", "none");
        }

        Ok(config)
    }
}

impl Connector for KafkaConnector {
    type Subscription = KafkaSubscription;

    async fn connect(&self, topic: &str) -> Result<KafkaSubscription, BrokerError> {
        let config = self.client_config()?;

        let consumer: StreamConsumer = config
            .create()
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        // librdkafka connects lazily; a metadata round trip surfaces
        // unreachable brokers and bad credentials here instead of in poll.
        let consumer = Arc::new(consumer);
        let metadata_consumer = consumer.clone();
        let metadata_topic = topic.to_string();
        let timeout = self.config.connect_timeout();
        let partitions = tokio::task::spawn_blocking(move || {
            metadata_consumer
                .fetch_metadata(Some(&metadata_topic), timeout)
                .map(|metadata| {
                    metadata
                        .topics()
                        .iter()
                        .map(|t| t.partitions().len())
                        .sum::<usize>()
                })
        })
        .await
        .map_err(|e| BrokerError::Connect(format!("metadata fetch aborted: {}", e)))?
        .map_err(|e| BrokerError::Connect(e.to_string()))?;

        info!(
            topic = %topic,
            brokers = %self.config.bootstrap_servers(),
            security = %self.config.security_protocol(),
            partitions,
            "Kafka consumer subscribed"
        );

        Ok(KafkaSubscription {
            topic: topic.to_string(),
            consumer,
        })
    }
}

/// A subscribed rdkafka stream consumer.
pub struct KafkaSubscription {
    topic: String,
    consumer: Arc<StreamConsumer>,
}

impl Subscription for KafkaSubscription {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) if is_transient(&e) => {
                warn!(topic = %self.topic, error = %e, "Transient consume error, keeping consumer");
                tokio::time::sleep(timeout.min(TRANSIENT_ERROR_PAUSE)).await;
                Ok(None)
            }
            Ok(Err(e)) => Err(BrokerError::Receive(e.to_string())),
            Ok(Ok(message)) => Ok(Some(BrokerMessage {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message
                    .key()
                    .and_then(|k| std::str::from_utf8(k).ok())
                    .map(str::to_string),
                payload: message.payload().map(<[u8]>::to_vec),
            })),
        }
    }

    async fn close(self) {
        self.consumer.unsubscribe();
        debug!(topic = %self.topic, "Kafka consumer closed");
    }
}
