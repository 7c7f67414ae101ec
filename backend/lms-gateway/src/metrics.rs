use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

use crate::error::ApiError;

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Upstream LMS calls
    pub static ref UPSTREAM_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "lms_upstream_requests_total",
        "Total number of calls made to the LMS API",
        &["endpoint", "outcome"]
    )
    .unwrap();

    pub static ref UPSTREAM_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "lms_upstream_request_duration_seconds",
        "LMS API call duration in seconds",
        &["endpoint"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Derivation pipeline
    pub static ref QUIZ_STATES_RESOLVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiz_states_resolved_total",
        "Quiz status resolutions by resulting state",
        &["state"]
    )
    .unwrap();

    pub static ref STATUS_REFRESHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiz_status_refreshes_total",
        "Status cache refreshes by trigger",
        &["trigger"]
    )
    .unwrap();

    pub static ref ATTEMPTS_SUBMITTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "attempts_submitted_total",
        "Quiz attempt submissions by trigger and outcome",
        &["trigger", "outcome"]
    )
    .unwrap();

    pub static ref ATTEMPT_RUNNERS_ACTIVE: IntGauge = register_int_gauge!(
        "attempt_runners_active",
        "Number of attempt runners currently held"
    )
    .unwrap();

    pub static ref SSE_CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "sse_connections_active",
        "Number of active SSE connections"
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: track an LMS API call with metrics
pub async fn track_upstream_call<F, T>(endpoint: &str, future: F) -> Result<T, ApiError>
where
    F: std::future::Future<Output = Result<T, ApiError>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let outcome = match &result {
        Ok(_) => "success",
        Err(ApiError::Network(_)) => "network_error",
        Err(ApiError::AuthExpiry) => "auth_expired",
        Err(ApiError::Decode(_)) => "decode_error",
        Err(_) => "rejected",
    };

    UPSTREAM_REQUESTS_TOTAL
        .with_label_values(&[endpoint, outcome])
        .inc();

    UPSTREAM_REQUEST_DURATION_SECONDS
        .with_label_values(&[endpoint])
        .observe(duration);

    result
}
