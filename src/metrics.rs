//! Prometheus metrics for mediacms.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics on the ops server, and exposes the `/metrics` handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests on the ops server (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "mediacms_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "mediacms_http_request_duration_seconds";

/// Lifecycle operations (counter). Labels: resource, operation, outcome.
pub const LIFECYCLE_OPERATIONS_TOTAL: &str = "mediacms_lifecycle_operations_total";

/// Lifecycle operation duration in seconds (histogram). Labels: resource, operation.
pub const LIFECYCLE_DURATION_SECONDS: &str = "mediacms_lifecycle_duration_seconds";

/// Compensating actions (counter). Labels: action, status.
pub const COMPENSATIONS_TOTAL: &str = "mediacms_compensations_total";

/// Blobs left behind after a failed cleanup (counter).
pub const ORPHANED_BLOBS_TOTAL: &str = "mediacms_orphaned_blobs_total";

/// Signed URLs that degraded to the placeholder (counter).
pub const SIGNING_FAILURES_TOTAL: &str = "mediacms_signing_failures_total";

/// Files handled by best-effort bulk uploads (counter). Labels: outcome.
pub const BULK_UPLOAD_FILES_TOTAL: &str = "mediacms_bulk_upload_files_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
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
    describe_counter!(
        LIFECYCLE_OPERATIONS_TOTAL,
        "Lifecycle operations by resource, operation and outcome"
    );
    describe_histogram!(
        LIFECYCLE_DURATION_SECONDS,
        "Lifecycle operation duration in seconds"
    );
    describe_counter!(COMPENSATIONS_TOTAL, "Compensating actions by action and status");
    describe_counter!(ORPHANED_BLOBS_TOTAL, "Blobs left behind by failed cleanups");
    describe_counter!(
        SIGNING_FAILURES_TOTAL,
        "Signed URLs replaced by the placeholder"
    );
    describe_counter!(BULK_UPLOAD_FILES_TOTAL, "Bulk upload files by outcome");
}

/// Record one finished lifecycle operation.
pub fn record_operation(resource: &'static str, operation: &'static str, outcome: &'static str, started: Instant) {
    counter!(
        LIFECYCLE_OPERATIONS_TOTAL,
        "resource" => resource,
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
    histogram!(
        LIFECYCLE_DURATION_SECONDS,
        "resource" => resource,
        "operation" => operation
    )
    .record(started.elapsed().as_secs_f64());
}

/// Record one compensating action.
pub fn record_compensation(action: &'static str, ok: bool) {
    let status = if ok { "ok" } else { "failed" };
    counter!(COMPENSATIONS_TOTAL, "action" => action, "status" => status).increment(1);
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Collapse request paths to a fixed label set.
///
/// The ops server only routes a handful of paths; anything else (scanners,
/// typos) is folded into `/other` so labels stay low-cardinality.
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/healthz" | "/readyz" | "/metrics" => path.to_string(),
        _ => "/other".to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let handle = PROMETHEUS_HANDLE
        .get()
        .expect("Prometheus recorder not initialized");
    let body = handle.render();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

// -- Tests --------------------------------------------------------------------
