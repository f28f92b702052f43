//! Built-in lifecycle routes.
//!
//! - `GET /_gem/status`: JSON snapshot of this process generation
//! - `GET /_gem/metrics`: Prometheus text, when a recorder is installed

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lifecycle::restart::RestartCoordinator;
use crate::lifecycle::startup::Generation;
use crate::net::InFlightTracker;

pub const STATUS_PATH: &str = "/_gem/status";
pub const METRICS_PATH: &str = "/_gem/metrics";

/// State shared with the built-in handlers.
#[derive(Clone)]
pub struct StatusState {
    pub generation: Arc<Generation>,
    pub tracker: InFlightTracker,
    pub coordinator: RestartCoordinator,
    pub metrics: Option<PrometheusHandle>,
}

/// Body of `/_gem/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    pub name: String,
    pub version: String,
    pub pid: u32,
    pub generation: Uuid,
    pub graceful_restart: bool,
    pub addrs: Vec<String>,
    pub in_flight: u64,
    pub restart_state: String,
}

pub fn status_router(state: StatusState) -> Router {
    Router::new()
        .route(STATUS_PATH, get(get_status))
        .route(METRICS_PATH, get(get_metrics))
        .with_state(state)
}

async fn get_status(State(state): State<StatusState>) -> Json<StatusReport> {
    let generation = &state.generation;
    Json(StatusReport {
        name: generation.name.clone(),
        version: crate::VERSION.to_string(),
        pid: generation.pid,
        generation: generation.id,
        graceful_restart: generation.graceful_restart,
        addrs: generation.addrs.clone(),
        in_flight: state.tracker.in_flight(),
        restart_state: state.coordinator.state().as_str().to_string(),
    })
}

async fn get_metrics(State(state): State<StatusState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "Metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::restart::RestartCommand;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> StatusState {
        StatusState {
            generation: Arc::new(Generation::new("gem", false, vec![":8080".to_string()])),
            tracker: InFlightTracker::new(),
            coordinator: RestartCoordinator::new(
                RestartCommand::new("gem", Vec::<String>::new()),
                Duration::from_secs(1),
            ),
            metrics: None,
        }
    }

    #[tokio::test]
    async fn status_reports_generation() {
        let state = state();
        let _guard = state.tracker.track();
        let response = status_router(state.clone())
            .oneshot(Request::get(STATUS_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let report: StatusReport = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(report.pid, std::process::id());
        assert_eq!(report.generation, state.generation.id);
        assert_eq!(report.addrs, vec![":8080"]);
        assert_eq!(report.in_flight, 1);
        assert_eq!(report.restart_state, "idle");
        assert!(!report.graceful_restart);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let response = status_router(state())
            .oneshot(Request::get(METRICS_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
