//! Prometheus metrics for fydf.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants for HTTP traffic and the upload lifecycle,
//! and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "fydf_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "fydf_http_request_duration_seconds";

/// Upload sessions created (counter). Rejoined sessions are not counted.
pub const SESSIONS_CREATED_TOTAL: &str = "fydf_upload_sessions_created_total";

/// Upload sessions evicted by the expiry sweeper (counter).
pub const SESSIONS_EXPIRED_TOTAL: &str = "fydf_upload_sessions_expired_total";

/// Sessions currently held by the registry (gauge).
pub const ACTIVE_SESSIONS: &str = "fydf_upload_sessions_active";

/// Chunks written to staging and recorded (counter).
pub const CHUNKS_ACCEPTED_TOTAL: &str = "fydf_upload_chunks_accepted_total";

/// Bytes written to staging files (counter).
pub const BYTES_STAGED_TOTAL: &str = "fydf_upload_bytes_staged_total";

/// Promotion attempts (counter). Labels: result.
pub const FINALIZATIONS_TOTAL: &str = "fydf_upload_finalizations_total";

/// Time spent promoting a staging file (histogram).
pub const FINALIZE_DURATION_SECONDS: &str = "fydf_upload_finalize_duration_seconds";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(SESSIONS_CREATED_TOTAL, "Upload sessions created");
    describe_counter!(SESSIONS_EXPIRED_TOTAL, "Upload sessions evicted while idle");
    describe_gauge!(ACTIVE_SESSIONS, "Upload sessions currently open");
    describe_counter!(CHUNKS_ACCEPTED_TOTAL, "Chunks written to staging");
    describe_counter!(BYTES_STAGED_TOTAL, "Bytes written to staging files");
    describe_counter!(FINALIZATIONS_TOTAL, "Staging file promotions by result");
    describe_histogram!(
        FINALIZE_DURATION_SECONDS,
        "Staging file promotion duration in seconds"
    );
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path, "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Map a request path onto a fixed label set.
///
/// Query strings carry session ids and filenames, so only the path is
/// looked at; anything unrouted collapses into `other`.
fn normalize_path(path: &str) -> &'static str {
    match path {
        "/health" => "/health",
        "/metrics" => "/metrics",
        "/openapi.json" => "/openapi.json",
        "/api/upload-init" => "/api/upload-init",
        "/api/upload-status" => "/api/upload-status",
        "/api/upload-resumable" => "/api/upload-resumable",
        "/api/upload-complete" => "/api/upload-complete",
        "/api/upload" => "/api/upload",
        "/api/download" => "/api/download",
        "/api/ping" => "/api/ping",
        _ => "other",
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let body = PROMETHEUS_HANDLE
        .get()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}
