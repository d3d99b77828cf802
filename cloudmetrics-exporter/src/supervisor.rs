//! Supervision of topic workers.
//!
//! [`Supervisor::start`] spawns one task per topic. Each task runs a
//! [`TopicWorker`] and starts a fresh one if the worker panics or returns
//! before shutdown. Workers heal connection failures themselves, so a
//! restart here only happens on a fault.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::broker::Connector;
use crate::config::ExporterConfig;
use crate::mapping::SeriesResolver;
use crate::registry::SharedRegistry;
use crate::worker::{
    LastError, TopicWorker, WorkerPhase, WorkerSettings, WorkerStatus, cancelled, unix_now,
};

const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Read-only view of every worker's status.
#[derive(Clone)]
pub struct SupervisorStatus {
    workers: Arc<Vec<(String, watch::Receiver<WorkerStatus>)>>,
}

impl SupervisorStatus {
    pub fn new(workers: Vec<(String, watch::Receiver<WorkerStatus>)>) -> Self {
        Self {
            workers: Arc::new(workers),
        }
    }

    /// True once every worker has reached `Consuming` or `Backoff` at least once.
    pub fn is_ready(&self) -> bool {
        self.workers.iter().all(|(_, rx)| rx.borrow().settled)
    }

    /// Current status per topic, in start order.
    pub fn snapshot(&self) -> Vec<(String, WorkerStatus)> {
        self.workers
            .iter()
            .map(|(topic, rx)| (topic.clone(), rx.borrow().clone()))
            .collect()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(|(topic, _)| topic.as_str())
    }
}

/// Starts and supervises one worker per topic.
pub struct Supervisor<C: Connector> {
    connector: Arc<C>,
    registry: SharedRegistry,
    resolver: Arc<SeriesResolver>,
    settings: WorkerSettings,
    restart_backoff: Duration,
    shutdown_timeout: Duration,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(
        connector: Arc<C>,
        registry: SharedRegistry,
        resolver: Arc<SeriesResolver>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            connector,
            registry,
            resolver,
            settings,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn from_config(
        connector: Arc<C>,
        registry: SharedRegistry,
        resolver: Arc<SeriesResolver>,
        config: &ExporterConfig,
    ) -> Self {
        Self::new(
            connector,
            registry,
            resolver,
            WorkerSettings::from_config(config),
        )
        .with_restart_backoff(config.workers.restart_backoff())
        .with_shutdown_timeout(config.workers.shutdown_timeout())
    }

    pub fn with_restart_backoff(mut self, delay: Duration) -> Self {
        self.restart_backoff = delay;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Spawn one supervised worker per topic.
    pub fn start(self, topics: &[String]) -> SupervisorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(topics.len());
        let mut receivers = Vec::with_capacity(topics.len());
        let mut senders = Vec::with_capacity(topics.len());

        for topic in topics {
            let (status_tx, status_rx) = watch::channel(WorkerStatus::default());
            let status_tx = Arc::new(status_tx);

            let task = tokio::spawn(supervise(
                topic.clone(),
                self.connector.clone(),
                self.registry.clone(),
                self.resolver.clone(),
                self.settings,
                self.restart_backoff,
                status_tx.clone(),
                shutdown_rx.clone(),
            ));

            tasks.push((topic.clone(), task));
            receivers.push((topic.clone(), status_rx));
            senders.push(status_tx);
        }

        info!(workers = topics.len(), "Topic workers started");

        SupervisorHandle {
            shutdown: shutdown_tx,
            tasks,
            senders,
            status: SupervisorStatus::new(receivers),
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise<C: Connector>(
    topic: String,
    connector: Arc<C>,
    registry: SharedRegistry,
    resolver: Arc<SeriesResolver>,
    settings: WorkerSettings,
    restart_backoff: Duration,
    status: Arc<watch::Sender<WorkerStatus>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut restarts = 0u64;

    loop {
        let worker = TopicWorker::new(
            topic.clone(),
            connector.clone(),
            registry.clone(),
            resolver.clone(),
            settings,
            status.clone(),
        );

        // Dropping the set aborts the worker if this task is aborted
        let mut running = JoinSet::new();
        running.spawn(worker.run(shutdown.clone()));
        let outcome = running.join_next().await;

        if *shutdown.borrow() {
            break;
        }

        let reason = match outcome {
            Some(Ok(())) => "worker returned before shutdown".to_string(),
            Some(Err(e)) if e.is_panic() => "worker panicked".to_string(),
            Some(Err(e)) => format!("worker task failed: {}", e),
            None => "worker task missing".to_string(),
        };
        restarts += 1;
        error!(
            topic = %topic,
            restarts,
            delay_ms = restart_backoff.as_millis() as u64,
            "{}, restarting",
            reason
        );
        status.send_modify(|s| {
            s.phase = WorkerPhase::Backoff;
            s.settled = true;
            s.last_error = Some(LastError {
                at: unix_now(),
                message: reason,
            });
        });

        tokio::select! {
            _ = cancelled(&mut shutdown) => break,
            _ = tokio::time::sleep(restart_backoff) => {}
        }
    }

    status.send_modify(|s| s.phase = WorkerPhase::Stopped);
}

/// Running workers: status, readiness and shutdown.
pub struct SupervisorHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
    senders: Vec<Arc<watch::Sender<WorkerStatus>>>,
    status: SupervisorStatus,
    shutdown_timeout: Duration,
}

impl SupervisorHandle {
    pub fn status(&self) -> SupervisorStatus {
        self.status.clone()
    }

    /// Wait until every worker has settled, up to `timeout`.
    ///
    /// Returns whether readiness was reached.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut receivers: Vec<_> = self
            .status
            .workers
            .iter()
            .map(|(_, rx)| rx.clone())
            .collect();

        let all_settled = async {
            for rx in receivers.iter_mut() {
                if rx.wait_for(|s| s.settled).await.is_err() {
                    return false;
                }
            }
            true
        };

        tokio::time::timeout(timeout, all_settled)
            .await
            .unwrap_or(false)
    }

    /// Cancel every worker and join them, aborting stragglers after the timeout.
    pub async fn shutdown(self) {
        info!(workers = self.tasks.len(), "Stopping topic workers");
        let _ = self.shutdown.send(true);

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let mut aborted = 0usize;

        for (topic, mut task) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(topic = %topic, error = %e, "Worker task ended abnormally"),
                Err(_) => {
                    warn!(topic = %topic, "Worker did not stop in time, aborting");
                    task.abort();
                    aborted += 1;
                }
            }
        }

        for sender in &self.senders {
            sender.send_modify(|s| s.phase = WorkerPhase::Stopped);
        }

        info!(aborted, "Topic workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::broker::BrokerError;
    use crate::config::{FilterConfig, RegistryConfig};
    use crate::memory::{MemoryBroker, MemorySubscription};
    use crate::registry::MetricRegistry;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            poll_timeout: Duration::from_millis(20),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    fn registry() -> SharedRegistry {
        Arc::new(MetricRegistry::new(
            RegistryConfig::default(),
            FilterConfig::default(),
        ))
    }

    fn resolver() -> Arc<SeriesResolver> {
        Arc::new(SeriesResolver::new("test", &HashMap::new()))
    }

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|t| t.to_string()).collect()
    }

    /// Panics on the first `panics` connects, then behaves like the inner broker.
    struct FaultyConnector {
        inner: MemoryBroker,
        panics: AtomicUsize,
    }

    impl Connector for FaultyConnector {
        type Subscription = MemorySubscription;

        async fn connect(&self, topic: &str) -> Result<MemorySubscription, BrokerError> {
            let left = self.panics.load(Ordering::SeqCst);
            if left > 0 {
                self.panics.store(left - 1, Ordering::SeqCst);
                panic!("injected worker fault");
            }
            self.inner.connect(topic).await
        }
    }

    #[tokio::test]
    async fn test_start_and_ready() {
        let broker = Arc::new(MemoryBroker::new());
        let handle = Supervisor::new(broker.clone(), registry(), resolver(), settings())
            .start(&topics(&["a", "b", "c"]));

        assert!(handle.wait_ready(Duration::from_secs(5)).await);
        let status = handle.status();
        assert!(status.is_ready());
        assert_eq!(status.topics().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert!(
            status
                .snapshot()
                .iter()
                .all(|(_, s)| s.phase == WorkerPhase::Consuming)
        );

        handle.shutdown().await;
        assert!(
            status
                .snapshot()
                .iter()
                .all(|(_, s)| s.phase == WorkerPhase::Stopped)
        );
        assert_eq!(broker.close_count("a"), 1);
    }

    #[tokio::test]
    async fn test_ready_with_failing_topic() {
        let broker = MemoryBroker::new();
        broker.fail_connects("down", usize::MAX);
        let handle = Supervisor::new(Arc::new(broker), registry(), resolver(), settings())
            .start(&topics(&["up", "down"]));

        // Backoff counts as settled
        assert!(handle.wait_ready(Duration::from_secs(5)).await);
        let snapshot = handle.status().snapshot();
        assert_eq!(snapshot[0].1.phase, WorkerPhase::Consuming);
        assert!(snapshot[1].1.connect_failures >= 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_not_ready_while_connecting() {
        let status_tx = watch::channel(WorkerStatus::default());
        let status = SupervisorStatus::new(vec![("a".to_string(), status_tx.1)]);
        assert!(!status.is_ready());

        status_tx.0.send_modify(|s| s.settled = true);
        assert!(status.is_ready());
    }

    #[tokio::test]
    async fn test_panicking_worker_restarted() {
        let broker = MemoryBroker::new();
        broker.publish("a", r#"{"metrics": []}"#);
        let connector = Arc::new(FaultyConnector {
            inner: broker.clone(),
            panics: AtomicUsize::new(1),
        });

        let handle = Supervisor::new(connector, registry(), resolver(), settings())
            .with_restart_backoff(Duration::from_millis(10))
            .start(&topics(&["a"]));

        let mut rx = handle.status.workers[0].1.clone();
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.messages == 1),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();

        assert_eq!(status.phase, WorkerPhase::Consuming);
        assert_eq!(
            status.last_error.map(|e| e.message),
            Some("worker panicked".to_string())
        );
        assert_eq!(broker.connect_count("a"), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded() {
        let broker = MemoryBroker::new();
        broker.fail_connects("a", usize::MAX);
        let handle = Supervisor::new(
            Arc::new(broker),
            registry(),
            resolver(),
            WorkerSettings {
                initial_backoff: Duration::from_secs(600),
                max_backoff: Duration::from_secs(600),
                ..settings()
            },
        )
        .with_shutdown_timeout(Duration::from_secs(2))
        .start(&topics(&["a"]));

        assert!(handle.wait_ready(Duration::from_secs(5)).await);
        let started = std::time::Instant::now();
        handle.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
