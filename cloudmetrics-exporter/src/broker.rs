//! Broker abstraction used by topic workers.
//!
//! A [`Connector`] opens one [`Subscription`] per topic. The Kafka
//! implementation lives in [`crate::kafka`]; tests drive workers with
//! in-memory implementations.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Message key, if present and valid UTF-8.
    pub key: Option<String>,
    pub payload: Option<Vec<u8>>,
}

impl BrokerMessage {
    /// Message with a payload and no key, at partition 0.
    pub fn new(topic: impl Into<String>, offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset,
            key: None,
            payload: Some(payload.into()),
        }
    }
}

/// Broker-level failures. Each one ends the current session of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

/// Opens subscriptions to single topics.
pub trait Connector: Send + Sync + 'static {
    type Subscription: Subscription;

    /// Connect, authenticate and subscribe to `topic`.
    fn connect(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<Self::Subscription, BrokerError>> + Send;
}

/// A live subscription to one topic.
pub trait Subscription: Send + 'static {
    /// Wait up to `timeout` for the next message.
    ///
    /// `Ok(None)` means the timeout elapsed with nothing to deliver; the
    /// subscription is still healthy.
    fn poll(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<BrokerMessage>, BrokerError>> + Send;

    /// Release the subscription.
    fn close(self) -> impl Future<Output = ()> + Send;
}
