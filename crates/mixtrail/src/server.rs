use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, CorsLayer};

use mixtrail_core::cache::CacheStatus;
use mixtrail_core::engine::{Engine, TxInvestigation};
use mixtrail_core::monitor::{MempoolMonitor, MonitorStatus};
use mixtrail_core::{CoreError, Investigation};

// ==============================================================================
// Application State
// ==============================================================================

pub struct AppState {
    pub engine: Arc<Engine>,
    pub monitor: Arc<MempoolMonitor>,
}

type SharedState = Arc<AppState>;

// ==============================================================================
// Router
// ==============================================================================

pub fn build_router(state: AppState, origin: &str) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::exact(
            origin.parse().expect("valid origin header value"),
        ))
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/statistics", get(statistics))
        .route("/api/v1/monitoring/start", post(monitoring_start))
        .route("/api/v1/monitoring/stop", post(monitoring_stop))
        .route("/api/v1/monitoring/status", get(monitoring_status))
        .route("/api/v1/investigate", post(investigate))
        .route("/api/v1/search/address", post(search_address))
        .route("/api/v1/cache/status", get(cache_status))
        .route("/api/v1/cache/clear", post(cache_clear))
        .route("/api/v1/cache/cleanup", post(cache_cleanup))
        .layer(cors)
        .with_state(Arc::new(state))
}

// ==============================================================================
// Handlers
// ==============================================================================

async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let store = state.engine.store().health().await;
    let monitor = state.monitor.status();
    let status = if store.connected { "ok" } else { "degraded" };

    Json(serde_json::json!({
        "status": status,
        "store": store,
        "monitor": {
            "running": monitor.running,
            "last_tick_unix_ms": monitor.last_tick_unix_ms,
        },
    }))
}

async fn statistics(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let store = state.engine.store().health().await;
    let cache = state.engine.cache().status().await;
    let monitor = state.monitor.status();

    Json(serde_json::json!({
        "monitor": monitor,
        "store": store,
        "cache": cache,
        "ml_available": state.engine.ml_available(),
    }))
}

// -- Monitoring ---------------------------------------------------------------

async fn monitoring_start(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let started = state.monitor.start();
    Json(serde_json::json!({
        "status": if started { "started" } else { "already_running" }
    }))
}

async fn monitoring_stop(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let stopped = state.monitor.stop();
    Json(serde_json::json!({
        "status": if stopped { "stopped" } else { "not_running" }
    }))
}

async fn monitoring_status(State(state): State<SharedState>) -> Json<MonitorStatus> {
    Json(state.monitor.status())
}

// -- Investigations -----------------------------------------------------------

#[derive(Deserialize)]
struct InvestigateRequest {
    txid: String,
    max_depth: Option<usize>,
}

async fn investigate(
    State(state): State<SharedState>,
    request: Result<Json<InvestigateRequest>, JsonRejection>,
) -> Result<Json<TxInvestigation>, AppError> {
    let Json(request) = request.map_err(|e| AppError::BadRequest(e.to_string()))?;
    let txid: bitcoin::Txid = request
        .txid
        .parse()
        .map_err(|e| AppError::BadRequest(format!("invalid txid: {e}")))?;

    let result = state
        .engine
        .investigate_tx(txid, request.max_depth)
        .await
        .map_err(map_core_error)?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct AddressRequest {
    address: String,
    max_depth: Option<usize>,
}

async fn search_address(
    State(state): State<SharedState>,
    request: Result<Json<AddressRequest>, JsonRejection>,
) -> Result<Json<Investigation>, AppError> {
    let Json(request) = request.map_err(|e| AppError::BadRequest(e.to_string()))?;
    if request.address.trim().is_empty() {
        return Err(AppError::BadRequest("address must not be empty".into()));
    }

    let investigation = state
        .engine
        .investigate_address(request.address.trim(), request.max_depth)
        .await
        .map_err(map_core_error)?;
    Ok(Json(investigation))
}

// -- Cache --------------------------------------------------------------------

async fn cache_status(State(state): State<SharedState>) -> Json<CacheStatus> {
    Json(state.engine.cache().status().await)
}

async fn cache_clear(State(state): State<SharedState>) -> Json<serde_json::Value> {
    state.engine.cache().clear().await;
    Json(serde_json::json!({ "status": "cleared" }))
}

async fn cache_cleanup(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let removed = state.engine.cache().cleanup().await;
    Json(serde_json::json!({ "status": "ok", "removed": removed }))
}

// ==============================================================================
// Error Type
// ==============================================================================

pub(crate) enum AppError {
    BadRequest(String),
    NotFound(String),
    Busy,
    UpstreamUnavailable(String),
    ServiceDegraded(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Busy => (
                StatusCode::TOO_MANY_REQUESTS,
                "engine is at its concurrent investigation cap".to_owned(),
            ),
            Self::UpstreamUnavailable(msg) => (StatusCode::BAD_GATEWAY, msg),
            Self::ServiceDegraded(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub(crate) fn map_core_error(err: CoreError) -> AppError {
    match err {
        CoreError::TxNotFound(txid) => AppError::NotFound(format!("transaction not found: {txid}")),
        CoreError::Busy => AppError::Busy,
        CoreError::UpstreamUnavailable(source) => AppError::UpstreamUnavailable(source.to_string()),
        CoreError::StoreUnavailable(source) => AppError::ServiceDegraded(source.to_string()),
        CoreError::DeadlineExceeded => {
            AppError::ServiceDegraded("investigation deadline exceeded".to_owned())
        }
        other => AppError::Internal(other.to_string()),
    }
}

// ==============================================================================
// Tests
// ==============================================================================
