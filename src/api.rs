//! Admin HTTP API
//!
//! Thin axum layer over [`Admin`]: every route maps to one admin operation
//! and returns the usual `{success, data | error}` envelope. `/metrics`
//! serves the Prometheus text format.
//!
//! | Method | Path | Operation |
//! |--------|------|-----------|
//! | GET | `/api/health` | liveness and persistence health |
//! | GET | `/api/status` | `get_status` |
//! | PUT | `/api/interval` | `set_interval` |
//! | POST | `/api/force` | `force_next_cycle` |
//! | PUT | `/api/maintenance` | `set_maintenance` |
//! | GET | `/api/sources?filter=` | `list_sources` |
//! | POST | `/api/sources/{id}/activate` | `activate_source` |
//! | POST | `/api/sources/{id}/deactivate` | `deactivate_source` |
//! | DELETE | `/api/sources/{id}` | `remove_source` |
//! | GET | `/api/breakers` | all breaker stats |
//! | GET | `/api/breakers/{name}` | `get_breaker_stats` |
//! | POST | `/api/breakers/{name}/reset` | `reset_breaker` |
//! | GET | `/api/rate-limits/{name}` | `get_rate_limiter_stats` |
//! | DELETE | `/api/blacklist` | `clear_blacklist` |

use axum::{
    extract::{MatchedPath, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::metrics;
use crate::scheduler::{Admin, SchedulerError, SourceFilter};

// ============================================================================
// Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Error response with its status code
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        let status = match &err {
            SchedulerError::UnknownSource { .. } => StatusCode::NOT_FOUND,
            SchedulerError::InvalidSourceId { .. } | SchedulerError::InvalidConfig { .. } => {
                StatusCode::BAD_REQUEST
            }
            // Applied in memory; the write is retried on the next tick
            SchedulerError::Persistence { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub persistence_healthy: bool,
}

#[derive(Debug, Serialize)]
pub struct SourceChange {
    pub id: String,
    pub added: bool,
}

#[derive(Debug, Serialize)]
pub struct BlacklistCleared {
    pub removed: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IntervalRequest {
    pub seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MaintenanceRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct SourcesQuery {
    #[serde(default)]
    pub filter: Option<String>,
}

// ============================================================================
// Router
// ============================================================================

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub admin: Admin,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(admin: Admin) -> Self {
        Self {
            admin,
            start_time: Instant::now(),
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/interval", put(set_interval))
        .route("/api/force", post(force_next_cycle))
        .route("/api/maintenance", put(set_maintenance))
        .route("/api/sources", get(list_sources))
        .route("/api/sources/{id}", delete(remove_source))
        .route("/api/sources/{id}/activate", post(activate_source))
        .route("/api/sources/{id}/deactivate", post(deactivate_source))
        .route("/api/breakers", get(list_breakers))
        .route("/api/breakers/{name}", get(get_breaker))
        .route("/api/breakers/{name}/reset", post(reset_breaker))
        .route("/api/rate-limits/{name}", get(get_rate_limit))
        .route("/api/blacklist", delete(clear_blacklist))
        .route("/metrics", get(prometheus_metrics))
        .layer(middleware::from_fn(track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Admin API listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("Admin API stopped");
    Ok(())
}

async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let started = Instant::now();
    let response = next.run(request).await;
    metrics::record_api_request(
        &route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

// ============================================================================
// Status Handlers
// ============================================================================

async fn health_check(State(state): State<AppState>) -> ApiResult<HealthResponse> {
    let persistence_healthy = state.admin.context().persistence_healthy().await;
    ok(HealthResponse {
        status: if persistence_healthy { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        persistence_healthy,
    })
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.admin.get_status().await))
}

async fn prometheus_metrics() -> Response {
    match metrics::encode_metrics() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// Schedule Handlers
// ============================================================================

async fn set_interval(
    State(state): State<AppState>,
    Json(req): Json<IntervalRequest>,
) -> ApiResult<IntervalRequest> {
    state.admin.set_interval(req.seconds).await?;
    ok(req)
}

async fn force_next_cycle(State(state): State<AppState>) -> ApiResult<bool> {
    state.admin.force_next_cycle().await?;
    ok(true)
}

async fn set_maintenance(
    State(state): State<AppState>,
    Json(req): Json<MaintenanceRequest>,
) -> ApiResult<MaintenanceRequest> {
    state.admin.set_maintenance(req.enabled).await?;
    ok(req)
}

// ============================================================================
// Source Handlers
// ============================================================================

async fn list_sources(
    State(state): State<AppState>,
    Query(query): Query<SourcesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = match query.filter.as_deref() {
        None => SourceFilter::All,
        Some(raw) => raw.parse::<SourceFilter>().map_err(ApiError::bad_request)?,
    };
    Ok(Json(ApiResponse::success(state.admin.list_sources(filter).await)))
}

async fn activate_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SourceChange> {
    let added = state.admin.activate_source(&id).await?;
    ok(SourceChange { id, added })
}

async fn deactivate_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SourceChange> {
    state.admin.deactivate_source(&id).await?;
    ok(SourceChange { id, added: false })
}

async fn remove_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state.admin.remove_source(&id).await?;
    Ok(Json(ApiResponse::success(removed)))
}

// ============================================================================
// Resilience Handlers
// ============================================================================

async fn list_breakers(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.admin.all_breaker_stats()))
}

async fn get_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .admin
        .get_breaker_stats(&name)
        .map(|stats| Json(ApiResponse::success(stats)))
        .ok_or_else(|| ApiError::not_found(format!("No circuit breaker named '{name}'")))
}

async fn reset_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<bool> {
    if state.admin.reset_breaker(&name) {
        ok(true)
    } else {
        Err(ApiError::not_found(format!("No circuit breaker named '{name}'")))
    }
}

async fn get_rate_limit(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    Json(ApiResponse::success(state.admin.get_rate_limiter_stats(&name)))
}

async fn clear_blacklist(State(state): State<AppState>) -> ApiResult<BlacklistCleared> {
    let removed = state.admin.clear_blacklist().await?;
    ok(BlacklistCleared { removed })
}
