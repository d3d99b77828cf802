//! Prometheus exporter for cloud service metrics published on Kafka.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use cloudmetrics_exporter::{
    ExporterConfig, HttpServer, KafkaConnector, MetricRegistry, SeriesResolver, Supervisor,
};

/// How long the HTTP server gets to drain after the workers stopped.
const HTTP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Prometheus exporter for cloud service metrics published on Kafka.
#[derive(Parser, Debug)]
#[command(name = "cloudmetrics-exporter")]
#[command(about = "Export cloud service metrics from Kafka as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides config and environment).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // File, then environment, then CLI; validated before anything starts
    let Args {
        config: config_path,
        listen,
        log_level,
    } = args;
    let config = ExporterConfig::load_with_env(
        config_path.as_deref(),
        |key| std::env::var(key).ok(),
        |config| {
            if let Some(listen) = listen {
                config.prometheus.listen = listen;
            }
            if let Some(level) = log_level {
                config.logging.level = level;
            }
        },
    )?;

    cloudmetrics_common::init_tracing(&config.logging)?;

    info!(
        topics = ?config.topics,
        brokers = %config.kafka.bootstrap_servers(),
        security = %config.kafka.security_protocol(),
        "Starting cloud metrics exporter"
    );

    let registry = Arc::new(MetricRegistry::new(
        config.registry.clone(),
        config.filters.clone(),
    ));
    let resolver = Arc::new(SeriesResolver::new(
        config.prometheus.prefix.clone(),
        &config.prometheus.default_labels,
    ));

    let listen_addr: SocketAddr = config
        .prometheus
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    // Bind before any worker starts so a busy port fails fast
    let listener = HttpServer::bind(listen_addr).await?;

    let connector = Arc::new(KafkaConnector::new(config.kafka.clone()));
    let supervisor = Supervisor::from_config(connector, registry.clone(), resolver, &config)
        .start(&config.topics);

    let http_server = HttpServer::new(
        registry.clone(),
        supervisor.status(),
        config.prometheus.prefix.clone(),
        listen_addr,
        config.prometheus.path.clone(),
    );

    let (http_shutdown_tx, http_shutdown_rx) = watch::channel(false);
    let mut http_task = tokio::spawn(async move {
        if let Err(e) = http_server.serve(listener, http_shutdown_rx).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Runs until a signal arrives or the server dies
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = &mut http_task => {
            warn!("HTTP server exited, shutting down");
        }
    }

    supervisor.shutdown().await;

    let _ = http_shutdown_tx.send(true);
    if !http_task.is_finished()
        && tokio::time::timeout(HTTP_SHUTDOWN_TIMEOUT, &mut http_task)
            .await
            .is_err()
    {
        warn!("HTTP server did not stop in time");
        http_task.abort();
    }

    let stats = registry.stats();
    info!(
        records_received = stats.records_received,
        records_accepted = stats.records_accepted,
        records_filtered = stats.records_filtered,
        label_conflicts = stats.label_conflicts,
        records_dropped_max_series = stats.records_dropped_max_series,
        series_created = stats.series_created,
        series_count = registry.series_count(),
        "Final statistics"
    );

    info!("Exporter stopped");
    Ok(())
}
