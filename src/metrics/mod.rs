use crate::error::{ApiError, Result};
use crate::rate_limit::BackendState;
use axum::{
    body::Body,
    http::{header, Response, StatusCode},
};
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing::{debug, info};

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the global Prometheus recorder. Fails if one is already installed.
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            ApiError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "ratelimit_checks_total",
            "Rate limit decisions by policy and outcome"
        );
        describe_counter!(
            "ratelimit_fail_open_total",
            "Requests admitted because the shared store failed"
        );
        describe_counter!(
            "ratelimit_backend_transitions_total",
            "Rate limiter backend state transitions by target state"
        );
        describe_counter!(
            "ratelimit_swept_records_total",
            "Expired in-memory rate limit records removed by the sweep"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Render as an HTTP response
    pub fn response(&self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.render()));
        *response.status_mut() = StatusCode::OK;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain; version=0.0.4"),
        );
        response
    }
}

/// Record one admission decision
pub fn record_decision(policy: &str, admitted: bool) {
    let outcome = if admitted { "admitted" } else { "rejected" };
    counter!(
        "ratelimit_checks_total",
        "policy" => policy.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a request admitted because the shared store failed
pub fn record_fail_open(policy: &str) {
    counter!("ratelimit_fail_open_total", "policy" => policy.to_string()).increment(1);
}

/// Record a backend state transition
pub fn record_transition(to: BackendState) {
    counter!("ratelimit_backend_transitions_total", "to" => to.as_str()).increment(1);
}

/// Record records removed by a sweep
pub fn record_swept(removed: usize) {
    if removed > 0 {
        counter!("ratelimit_swept_records_total").increment(removed as u64);
    }
}
