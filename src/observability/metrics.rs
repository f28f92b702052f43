//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gem_requests_in_flight` (gauge): requests currently being handled
//! - `gem_signals_total` (counter): delivered signals by resolved action
//! - `gem_restarts_total` (counter): restart attempts by outcome
//! - `gem_drain_duration_seconds` (histogram): drain time, labelled forced/natural
//!
//! # Design Decisions
//! - Recorded through the `metrics` facade; without a recorder they are no-ops
//! - The binary installs a Prometheus recorder and renders it on `/_gem/metrics`
//!   of the served app, so exposition follows the sockets across restarts

use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder.
pub fn install_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install metrics recorder");
            None
        }
    }
}

pub fn set_in_flight(count: u64) {
    metrics::gauge!("gem_requests_in_flight").set(count as f64);
}

pub fn record_signal(signal: &str, action: &'static str) {
    metrics::counter!("gem_signals_total", "signal" => signal.to_string(), "action" => action)
        .increment(1);
}

pub fn record_restart(outcome: &'static str) {
    metrics::counter!("gem_restarts_total", "outcome" => outcome).increment(1);
}

pub fn record_drain(elapsed: Duration, forced: bool) {
    let mode = if forced { "forced" } else { "natural" };
    metrics::histogram!("gem_drain_duration_seconds", "mode" => mode).record(elapsed.as_secs_f64());
}
