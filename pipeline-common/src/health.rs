use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::monitor::{HealthState, MetricsSnapshot};

/// Health reporting for the pipeline.
///
/// The state itself is derived by the `PerformanceMonitor`: this is only its HTTP face.
/// Degraded is advisory and still answers 200, so that a load balancer keeps sending work
/// while the alerts do their job. Unhealthy answers 500.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub running: bool,
    pub queued: usize,
    pub queue_capacity: usize,
    pub error_rate: f64,
    pub average_processing_ms: f64,
}

impl From<&MetricsSnapshot> for HealthReport {
    fn from(snapshot: &MetricsSnapshot) -> Self {
        Self {
            status: snapshot.health,
            running: snapshot.running,
            queued: snapshot.queued_total,
            queue_capacity: snapshot.queue_capacity,
            error_rate: snapshot.error_rate,
            average_processing_ms: snapshot.average_processing_ms,
        }
    }
}

impl IntoResponse for HealthReport {
    /// Computes the axum status code based on the health state, and returns the report as
    /// the JSON body.
    fn into_response(self) -> Response {
        let status = match self.status {
            HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
            HealthState::Unhealthy => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}
