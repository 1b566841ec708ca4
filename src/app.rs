use crate::config::AppConfig;
use crate::guard::InFlightGuard;
use crate::handlers::{admin, ai_fetch, fetch_out};
use crate::models::ApiError;
use crate::pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use crate::rate_limit::{RateLimiter, enforce_rate_limit};
use crate::security::{AdminAuth, require_admin};
use crate::store::StoreError;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub guard: InFlightGuard,
    pub config: Arc<AppConfig>,
    pub openapi: Arc<Value>,
    pub prometheus: Option<PrometheusHandle>,
}

/// Assembles the public, rate-limited and admin route groups.
pub fn build_router(state: AppState, limiter: RateLimiter, admin_auth: AdminAuth) -> Router {
    let body_limit = state.config.body_limit;

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let fetch_out_routes = Router::new()
        .route("/fetch-out-boards", post(fetch_out::fetch_out_boards))
        .route("/fetch-out-subjects", post(fetch_out::fetch_out_subjects))
        .route("/fetch-out-chapters", post(fetch_out::fetch_out_chapters))
        .route_layer(middleware::from_fn_with_state(limiter, enforce_rate_limit));

    let admin_routes = Router::new()
        .nest(
            "/ai-fetch",
            Router::new()
                .route("/boards", post(ai_fetch::boards))
                .route("/universities", post(ai_fetch::universities))
                .route("/papers", post(ai_fetch::papers))
                .route("/subjects", post(ai_fetch::subjects))
                .route("/chapters", post(ai_fetch::chapters))
                .route("/mcqs", post(ai_fetch::mcqs)),
        )
        .nest(
            "/admin",
            Router::new()
                .route(
                    "/ai-providers",
                    get(admin::list_providers).post(admin::save_provider),
                )
                .route("/fetch-logs", get(admin::list_fetch_logs))
                .route(
                    "/{resource}",
                    get(admin::list_records).post(admin::create_record),
                )
                .route(
                    "/{resource}/{id}",
                    get(admin::get_record)
                        .put(admin::update_record)
                        .delete(admin::delete_record),
                ),
        )
        .route_layer(middleware::from_fn_with_state(admin_auth, require_admin));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .merge(fetch_out_routes)
        .merge(admin_routes)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "syllabus-admin-api",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    if let Some(key) = &state.config.openapi_key
        && presented(&headers, "X-Docs-Key") != Some(key.as_str())
    {
        return Err(PipelineError::unauthorized("docs", "Provide a valid X-Docs-Key").into());
    }
    Ok(Json((*state.openapi).clone()))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.config.metrics_key
        && presented(&headers, "X-Metrics-Key") != Some(secret.as_str())
    {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    let body = state
        .prometheus
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

fn presented<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[derive(Debug)]
pub enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Pipeline(value.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Throttled => StatusCode::TOO_MANY_REQUESTS,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let detail = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!(target = "syllabus.api", stage = err.stage(), error = %err, "request failed");
                    "Internal server error".to_string()
                } else {
                    err.detail().to_string()
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(detail),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}
