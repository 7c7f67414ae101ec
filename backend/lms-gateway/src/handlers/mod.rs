use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose, Engine as _};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::metrics;
use crate::models::Envelope;
use crate::services::AppState;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let lms = match tokio::time::timeout(HEALTH_TIMEOUT, state.lms.ping()).await {
        Ok(Ok(())) => json!({ "status": "healthy" }),
        Ok(Err(e)) => json!({ "status": "unhealthy", "error": e.to_string() }),
        Err(_) => json!({
            "status": "unhealthy",
            "error": format!("LMS timeout after {}s", HEALTH_TIMEOUT.as_secs())
        }),
    };
    let healthy = lms["status"] == "healthy";

    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "service": "lms-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "dependencies": { "lms": lms }
    });

    if healthy {
        (StatusCode::OK, Json(Envelope::ok(body)))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Envelope {
                success: false,
                data: Some(body),
                message: Some("LMS is unreachable".to_string()),
            }),
        )
    }
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to render metrics: {}", e),
        ),
    }
}

/// HTTP Basic protection for `/metrics`. Expected credentials come from
/// `metrics.auth` (`username:password`).
pub async fn metrics_auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let encoded = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let decoded = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    let credentials = String::from_utf8(decoded).map_err(|_| StatusCode::UNAUTHORIZED)?;

    if credentials != state.config.metrics_auth {
        tracing::warn!("Rejected /metrics request with invalid credentials");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}

/// Counts an open SSE stream for as long as the stream state lives.
pub(crate) struct SseConnection;

impl SseConnection {
    pub(crate) fn open() -> Self {
        metrics::SSE_CONNECTIONS_ACTIVE.inc();
        SseConnection
    }
}

impl Drop for SseConnection {
    fn drop(&mut self) {
        metrics::SSE_CONNECTIONS_ACTIVE.dec();
    }
}

pub mod admin;
pub mod attempts;
pub mod modules;
pub mod notifications;
pub mod quizzes;
