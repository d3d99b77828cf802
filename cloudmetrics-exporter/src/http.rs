//! HTTP server for the Prometheus scrape endpoint.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::exposition;
use crate::registry::SharedRegistry;
use crate::supervisor::SupervisorStatus;

/// Liveness endpoint.
pub(crate) const HEALTH_PATH: &str = "/health";
/// Readiness endpoint.
pub(crate) const READY_PATH: &str = "/ready";

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    registry: SharedRegistry,
    workers: SupervisorStatus,
    prefix: String,
}

/// Create the HTTP router.
fn create_router(
    registry: SharedRegistry,
    workers: SupervisorStatus,
    prefix: String,
    metrics_path: &str,
) -> Router {
    let state = AppState {
        registry,
        workers,
        prefix,
    };

    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route(HEALTH_PATH, get(health_handler))
        .route(READY_PATH, get(ready_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Render the full scrape body.
fn render(state: &AppState) -> String {
    let series = state.registry.snapshot();
    let mut body = String::with_capacity(series.len() * 128 + 2048);

    exposition::render_series(&mut body, &series);
    exposition::render_registry_stats(
        &mut body,
        &state.prefix,
        &state.registry.stats(),
        state.registry.series_count(),
    );
    exposition::render_worker_status(&mut body, &state.prefix, &state.workers.snapshot());

    body
}

/// Handler for the metrics endpoint.
async fn metrics_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let body = render(&state);

    match peer {
        Some(ConnectInfo(addr)) => debug!(peer = %addr, bytes = body.len(), "Scrape served"),
        None => debug!(bytes = body.len(), "Scrape served"),
    }

    (
        StatusCode::OK,
        [(CONTENT_TYPE, exposition::CONTENT_TYPE)],
        body,
    )
        .into_response()
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Handler for the /ready endpoint.
async fn ready_handler(State(state): State<AppState>) -> Response {
    if state.workers.is_ready() {
        (StatusCode::OK, "ready\n").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready - topic workers still connecting\n",
        )
            .into_response()
    }
}

/// HTTP server configuration.
pub struct HttpServer {
    registry: SharedRegistry,
    workers: SupervisorStatus,
    prefix: String,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(
        registry: SharedRegistry,
        workers: SupervisorStatus,
        prefix: impl Into<String>,
        listen_addr: SocketAddr,
        metrics_path: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            workers,
            prefix: prefix.into(),
            listen_addr,
            metrics_path: metrics_path.into(),
        }
    }

    /// Bind a listener for [`HttpServer::serve`].
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<tokio::net::TcpListener> {
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))
    }

    /// Serve on an already bound listener until the shutdown signal is received.
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr().unwrap_or(self.listen_addr);
        let router = create_router(self.registry, self.workers, self.prefix, &self.metrics_path);

        info!(
            addr = %addr,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("HTTP server shutting down");
        })
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExporterConfig, FilterConfig, RegistryConfig};
    use crate::mapping::SeriesResolver;
    use crate::registry::MetricRegistry;
    use crate::worker::{WorkerPhase, WorkerStatus};
    use axum::body::Body;
    use axum::http::Request;
    use cloudmetrics_common::MeasurementRecord;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn make_registry() -> SharedRegistry {
        Arc::new(MetricRegistry::new(
            RegistryConfig::default(),
            FilterConfig::default(),
        ))
    }

    fn workers(settled: bool) -> (watch::Sender<WorkerStatus>, SupervisorStatus) {
        let (tx, rx) = watch::channel(WorkerStatus {
            phase: if settled {
                WorkerPhase::Consuming
            } else {
                WorkerPhase::Connecting
            },
            settled,
            ..Default::default()
        });
        (tx, SupervisorStatus::new(vec![("dms".to_string(), rx)]))
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let registry = make_registry();
        let resolver = SeriesResolver::new("cloud_kafka_exporter", &HashMap::new());
        let record = MeasurementRecord::new("SYS.DMS", "queue_depth", 42.0)
            .with_dimension("instance_id", "abc")
            .with_unit("count");
        registry
            .record(&resolver.resolve("metrics-from-cloud-dms", &record).unwrap())
            .unwrap();
        let (_tx, status) = workers(true);
        let router = create_router(registry, status, "cloud_kafka_exporter".into(), "/metrics");

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert_eq!(content_type, exposition::CONTENT_TYPE);

        let body = body_string(response).await;
        assert!(body.contains(
            "# HELP cloud_kafka_exporter_metrics_from_cloud_dms_queue_depth \
             cloud_kafka_exporter_metrics_from_cloud_dms_queue_depth (count)\n"
        ));
        assert!(body.contains(
            "cloud_kafka_exporter_metrics_from_cloud_dms_queue_depth\
             {instance_id=\"abc\",namespace=\"SYS.DMS\"} 42\n"
        ));
        assert!(body.contains("cloud_kafka_exporter_exporter_topic_up{topic=\"dms\"} 1\n"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_tx, status) = workers(false);
        let router = create_router(make_registry(), status, "p".into(), "/metrics");

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_endpoint_not_ready() {
        let (_tx, status) = workers(false);
        let router = create_router(make_registry(), status, "p".into(), "/metrics");

        let response = router
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_ready_endpoint_ready() {
        let (tx, status) = workers(false);
        tx.send_modify(|s| {
            s.phase = WorkerPhase::Backoff;
            s.settled = true;
        });
        let router = create_router(make_registry(), status, "p".into(), "/metrics");

        let response = router
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_custom_metrics_path() {
        let (_tx, status) = workers(true);
        let router = create_router(make_registry(), status, "p".into(), "/prometheus/metrics");

        // Custom path should work
        let response = router
            .clone()
            .oneshot(
                Request::get("/prometheus/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Default path should 404
        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_registry_still_renders() {
        let (_tx, status) = workers(false);
        let router = create_router(make_registry(), status, "p".into(), "/metrics");

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("p_exporter_series 0\n"));
    }

    #[tokio::test]
    async fn test_validated_metrics_paths_route() {
        for path in ["/metrics", "/prometheus/metrics", "/"] {
            let mut config = ExporterConfig::default();
            config.kafka.brokers = vec!["b:9092".to_string()];
            config.kafka.username = "u".to_string();
            config.kafka.password = "p".to_string();
            config.prometheus.path = path.to_string();
            config.validate().unwrap();

            let (_tx, status) = workers(true);
            let router =
                create_router(make_registry(), status, "p".into(), &config.prometheus.path);
            let response = router
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{}", path);
        }
    }
}
