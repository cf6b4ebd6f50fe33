use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::Request,
    middleware::Next,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::engine::EventPipeline;
use crate::health::HealthReport;

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
/// This function is intended to take a Router as returned by `setup_metrics_router`,
/// potentially with more routes added by the caller.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Build a Router exposing `/metrics`, `/_health` and `/_stats` for `pipeline`.
/// Installs the global Prometheus recorder, so it can only be called once per process.
pub fn setup_metrics_router(pipeline: Arc<EventPipeline>) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;
    Ok(pipeline_router(pipeline, Some(recorder_handle)))
}

/// Same routes as `setup_metrics_router`, without touching the global recorder.
/// `/metrics` is only routed when a handle is given.
pub fn pipeline_router(
    pipeline: Arc<EventPipeline>,
    recorder_handle: Option<PrometheusHandle>,
) -> Router {
    let mut router = Router::new()
        .route("/_health", get(health))
        .route("/_stats", get(stats));

    if let Some(recorder_handle) = recorder_handle {
        router = router.route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        );
    }

    router
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(pipeline)
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

async fn health(State(pipeline): State<Arc<EventPipeline>>) -> HealthReport {
    HealthReport::from(&pipeline.snapshot())
}

async fn stats(State(pipeline): State<Arc<EventPipeline>>) -> impl IntoResponse {
    Json(pipeline.snapshot())
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
