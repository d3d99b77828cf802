//! Per-topic consumption loop.
//!
//! Each [`TopicWorker`] cycles through `Connecting -> Consuming -> Backoff`
//! until shutdown. Connection-level failures end the current session and
//! send the worker to backoff; message-level failures are logged and
//! skipped. Progress is published on a watch channel as [`WorkerStatus`].

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cloudmetrics_common::decode_envelope;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::broker::{BrokerError, BrokerMessage, Connector, Subscription};
use crate::config::ExporterConfig;
use crate::mapping::SeriesResolver;
use crate::registry::{RecordOutcome, SharedRegistry};

/// Bytes of an undecodable payload included in the warning.
const PAYLOAD_PREVIEW_BYTES: usize = 256;

/// Where a worker is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerPhase {
    #[default]
    Connecting,
    Consuming,
    Backoff,
    Stopped,
}

impl WorkerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerPhase::Connecting => "connecting",
            WorkerPhase::Consuming => "consuming",
            WorkerPhase::Backoff => "backoff",
            WorkerPhase::Stopped => "stopped",
        }
    }
}

/// Most recent failure seen by a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct LastError {
    /// Unix time in seconds.
    pub at: f64,
    pub message: String,
}

/// Observable state of one topic worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStatus {
    pub phase: WorkerPhase,
    /// Set once the worker has reached `Consuming` or `Backoff`.
    pub settled: bool,
    /// Messages received, including undecodable ones.
    pub messages: u64,
    /// Records written to the registry.
    pub records: u64,
    /// Undecodable messages plus rejected records.
    pub decode_failures: u64,
    /// Failed connect attempts and broken sessions.
    pub connect_failures: u64,
    pub last_error: Option<LastError>,
}

/// Timing knobs for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Bound on a single poll.
    pub poll_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &ExporterConfig) -> Self {
        Self {
            poll_timeout: config.kafka.poll_timeout(),
            initial_backoff: config.workers.initial_backoff(),
            max_backoff: config.workers.max_backoff(),
        }
    }
}

/// Exponential delay, doubling from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following call returns double, capped.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Resolves once shutdown is requested or the sender is gone.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

enum SessionEnd {
    Cancelled,
    Failed(BrokerError),
}

/// Consumes one topic into the shared registry.
pub struct TopicWorker<C: Connector> {
    topic: String,
    connector: Arc<C>,
    registry: SharedRegistry,
    resolver: Arc<SeriesResolver>,
    settings: WorkerSettings,
    status: Arc<watch::Sender<WorkerStatus>>,
}

impl<C: Connector> TopicWorker<C> {
    pub fn new(
        topic: impl Into<String>,
        connector: Arc<C>,
        registry: SharedRegistry,
        resolver: Arc<SeriesResolver>,
        settings: WorkerSettings,
        status: Arc<watch::Sender<WorkerStatus>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            connector,
            registry,
            resolver,
            settings,
            status,
        }
    }

    /// Run until `shutdown` turns true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.settings.initial_backoff, self.settings.max_backoff);
        info!(topic = %self.topic, "Topic worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.enter(WorkerPhase::Connecting);
            let connected = tokio::select! {
                _ = cancelled(&mut shutdown) => break,
                result = self.connector.connect(&self.topic) => result,
            };

            match connected {
                Ok(subscription) => {
                    backoff.reset();
                    self.enter(WorkerPhase::Consuming);
                    info!(topic = %self.topic, "Consuming");

                    match self.consume(subscription, &mut shutdown).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Failed(e) => {
                            warn!(topic = %self.topic, error = %e, "Consumer session failed");
                            self.failed(&e);
                        }
                    }
                }
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, "Failed to connect to broker");
                    self.failed(&e);
                }
            }

            let delay = backoff.next_delay();
            self.enter(WorkerPhase::Backoff);
            info!(
                topic = %self.topic,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after backoff"
            );
            tokio::select! {
                _ = cancelled(&mut shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.status.send_modify(|s| s.phase = WorkerPhase::Stopped);
        info!(topic = %self.topic, "Topic worker stopped");
    }

    async fn consume(
        &self,
        mut subscription: C::Subscription,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let end = loop {
            let polled = tokio::select! {
                _ = cancelled(shutdown) => break SessionEnd::Cancelled,
                polled = subscription.poll(self.settings.poll_timeout) => polled,
            };

            match polled {
                Ok(Some(message)) => self.process(&message),
                Ok(None) => {}
                Err(e) => break SessionEnd::Failed(e),
            }
        };

        subscription.close().await;
        end
    }

    /// Decode one message and write its records. Never fails the session.
    fn process(&self, message: &BrokerMessage) {
        self.status.send_modify(|s| s.messages += 1);

        let Some(payload) = message.payload.as_deref() else {
            warn!(
                topic = %self.topic,
                partition = message.partition,
                offset = message.offset,
                "Message has no payload, skipping"
            );
            return;
        };

        trace!(
            topic = %self.topic,
            partition = message.partition,
            offset = message.offset,
            key = ?message.key,
            bytes = payload.len(),
            "Message received"
        );

        let envelope = match decode_envelope(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                let preview = &payload[..payload.len().min(PAYLOAD_PREVIEW_BYTES)];
                warn!(
                    topic = %self.topic,
                    partition = message.partition,
                    offset = message.offset,
                    payload = %String::from_utf8_lossy(preview),
                    error = %e,
                    "Skipping undecodable message"
                );
                self.status.send_modify(|s| {
                    s.decode_failures += 1;
                    s.last_error = Some(LastError {
                        at: unix_now(),
                        message: e.to_string(),
                    });
                });
                return;
            }
        };

        for rejected in &envelope.rejected {
            debug!(
                topic = %self.topic,
                offset = message.offset,
                index = rejected.index,
                error = %rejected.error,
                "Skipping malformed record"
            );
        }

        let mut stored = 0u64;
        let mut unmappable = 0u64;
        for record in &envelope.records {
            let sample = match self.resolver.resolve(&self.topic, record) {
                Ok(sample) => sample,
                Err(e) => {
                    debug!(
                        topic = %self.topic,
                        offset = message.offset,
                        metric = %record.metric_name,
                        error = %e,
                        "Skipping unmappable record"
                    );
                    unmappable += 1;
                    continue;
                }
            };
            match self.registry.record(&sample) {
                Ok(RecordOutcome::Stored) => stored += 1,
                Ok(RecordOutcome::Filtered) => {}
                // Conflicts and capacity are reported by the registry
                Err(e) => trace!(topic = %self.topic, error = %e, "Record not stored"),
            }
        }

        let rejected = envelope.rejected.len() as u64 + unmappable;
        self.status.send_modify(|s| {
            s.records += stored;
            s.decode_failures += rejected;
        });
        debug!(
            topic = %self.topic,
            offset = message.offset,
            records = envelope.records.len(),
            rejected,
            "Message processed"
        );
    }

    fn enter(&self, phase: WorkerPhase) {
        trace!(topic = %self.topic, phase = phase.as_str(), "Worker phase changed");
        self.status.send_modify(|s| {
            s.phase = phase;
            if matches!(phase, WorkerPhase::Consuming | WorkerPhase::Backoff) {
                s.settled = true;
            }
        });
    }

    fn failed(&self, error: &BrokerError) {
        self.status.send_modify(|s| {
            s.connect_failures += 1;
            s.last_error = Some(LastError {
                at: unix_now(),
                message: error.to_string(),
            });
        });
    }
}
