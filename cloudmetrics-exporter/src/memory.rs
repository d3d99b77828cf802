//! In-memory broker.
//!
//! Implements [`Connector`] over per-topic queues so workers can run without
//! a Kafka cluster. Connect failures and receive errors can be injected per
//! topic.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::broker::{BrokerError, BrokerMessage, Connector, Subscription};

#[derive(Default)]
struct TopicQueue {
    queue: VecDeque<Result<BrokerMessage, BrokerError>>,
    next_offset: i64,
    failing_connects: usize,
    connects: usize,
    closes: usize,
}

#[derive(Default)]
struct Shared {
    topics: Mutex<HashMap<String, TopicQueue>>,
    notify: Notify,
}

/// Cloneable handle to a set of in-memory topics.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a payload to `topic`, returning its offset.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> i64 {
        let offset = {
            let mut topics = self.shared.topics.lock();
            let entry = topics.entry(topic.to_string()).or_default();
            let offset = entry.next_offset;
            entry.next_offset += 1;
            entry
                .queue
                .push_back(Ok(BrokerMessage::new(topic, offset, payload)));
            offset
        };
        self.shared.notify.notify_waiters();
        offset
    }

    /// Append a prepared message to its topic.
    pub fn publish_message(&self, message: BrokerMessage) {
        self.shared
            .topics
            .lock()
            .entry(message.topic.clone())
            .or_default()
            .queue
            .push_back(Ok(message));
        self.shared.notify.notify_waiters();
    }

    /// Queue a receive error; the subscriber sees it in order with messages.
    pub fn inject_error(&self, topic: &str, error: BrokerError) {
        self.shared
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .queue
            .push_back(Err(error));
        self.shared.notify.notify_waiters();
    }

    /// Make the next `count` connects to `topic` fail.
    pub fn fail_connects(&self, topic: &str, count: usize) {
        self.shared
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .failing_connects = count;
    }

    /// Connect attempts made for `topic`, successful or not.
    pub fn connect_count(&self, topic: &str) -> usize {
        self.shared.topics.lock().get(topic).map_or(0, |t| t.connects)
    }

    /// Subscriptions to `topic` that were closed.
    pub fn close_count(&self, topic: &str) -> usize {
        self.shared.topics.lock().get(topic).map_or(0, |t| t.closes)
    }

    /// Items still queued on `topic`.
    pub fn pending(&self, topic: &str) -> usize {
        self.shared
            .topics
            .lock()
            .get(topic)
            .map_or(0, |t| t.queue.len())
    }

    fn try_connect(&self, topic: &str) -> Result<(), BrokerError> {
        let mut topics = self.shared.topics.lock();
        let entry = topics.entry(topic.to_string()).or_default();
        entry.connects += 1;
        if entry.failing_connects > 0 {
            entry.failing_connects -= 1;
            return Err(BrokerError::Connect(format!("{}: broker unreachable", topic)));
        }
        Ok(())
    }

    fn pop(&self, topic: &str) -> Option<Result<BrokerMessage, BrokerError>> {
        self.shared
            .topics
            .lock()
            .get_mut(topic)
            .and_then(|t| t.queue.pop_front())
    }

    fn closed(&self, topic: &str) {
        if let Some(entry) = self.shared.topics.lock().get_mut(topic) {
            entry.closes += 1;
        }
    }
}

impl Connector for MemoryBroker {
    type Subscription = MemorySubscription;

    async fn connect(&self, topic: &str) -> Result<MemorySubscription, BrokerError> {
        self.try_connect(topic)?;
        Ok(MemorySubscription {
            topic: topic.to_string(),
            broker: self.clone(),
        })
    }
}

/// Subscription to one in-memory topic.
pub struct MemorySubscription {
    topic: String,
    broker: MemoryBroker,
}

impl Subscription for MemorySubscription {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Registered before the queue check so a publish in between is not missed
            let notified = self.broker.shared.notify.notified();
            if let Some(item) = self.broker.pop(&self.topic) {
                return item.map(Some);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn close(self) {
        self.broker.closed(&self.topic);
    }
}
