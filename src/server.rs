//! Ops HTTP server: liveness, readiness, Prometheus metrics and signed
//! downloads for the local blob store.
//!
//! The resource services are transport-agnostic; this router only exposes
//! what an orchestrator needs to health-check and scrape the process, plus the
//! read side of the links the local store hands out.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::media::MediaFormat;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppContext;

/// Bound on the readiness ping.
const READINESS_TIMEOUT: Duration = Duration::from_secs(2);

/// Build the ops router.  Routes switched off in `observability` are not
/// mounted.
pub fn app(ctx: Arc<AppContext>) -> Router {
    let observability = ctx.config.observability.clone();
    let mut router = Router::new().route("/", get(root));

    if observability.health_check {
        router = router
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz));
    }
    if observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }
    if ctx.media_signer.is_some() {
        let mount = ctx.config.storage.local.mount_path();
        router = router.route(&format!("{mount}/*key"), get(download));
    }

    let router = router.with_state(ctx).layer(TraceLayer::new_for_http());
    if observability.metrics {
        router.layer(middleware::from_fn(metrics_middleware))
    } else {
        router
    }
}

// -- Handlers -----------------------------------------------------------------

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "mediacms",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /healthz` -- the process is up.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /readyz` -- the metadata store answers.
async fn readyz(State(ctx): State<Arc<AppContext>>) -> Response {
    let ping = tokio::time::timeout(READINESS_TIMEOUT, ctx.lifecycle.metadata().ping()).await;
    let failure = match ping {
        Ok(Ok(())) => {
            return (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": "ready",
                    "pendingCleanups": ctx.lifecycle.pending_cleanups(),
                })),
            )
                .into_response()
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("metadata ping timed out after {READINESS_TIMEOUT:?}"),
    };
    warn!("Readiness check failed: {}", failure);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "status": "unavailable", "error": failure })),
    )
        .into_response()
}

/// Query half of a signed download link.
#[derive(Debug, Deserialize)]
struct DownloadQuery {
    expires: u64,
    signature: String,
}

/// `GET {mount}/{key}?expires=..&signature=..` -- stream a blob from the
/// local store once its link checks out.
async fn download(
    State(ctx): State<Arc<AppContext>>,
    Path(key): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let Some(signer) = ctx.media_signer.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(u64::MAX);
    if !signer.verify(&key, query.expires, &query.signature, now) {
        debug!("Rejected download link for {}", key);
        return StatusCode::FORBIDDEN.into_response();
    }

    let storage = ctx.lifecycle.storage();
    match storage.exists(&key).await {
        Ok(true) => {}
        Ok(false) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!("Download lookup failed for {}: {}", key, e);
            return StatusCode::NOT_FOUND.into_response();
        }
    }
    let object = match storage.get(&key).await {
        Ok(object) => object,
        Err(e) => {
            warn!("Download read failed for {}: {}", key, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let content_type = object.content_type.unwrap_or_else(|| {
        key.rsplit_once('.')
            .and_then(|(_, ext)| MediaFormat::from_extension(ext))
            .map_or("application/octet-stream", MediaFormat::content_type)
            .to_string()
    });
    let max_age = query.expires.saturating_sub(now);
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, format!("private, max-age={max_age}")),
        ],
        object.data,
    )
        .into_response()
}

// -- Tests --------------------------------------------------------------------
