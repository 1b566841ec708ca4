//! Admin CRUD over the taxonomy and commerce tables, AI provider settings
//! and fetch logs.

use super::json_body;
use crate::app::{AppError, AppState};
use crate::llm::ProviderConfig;
use crate::pipeline::PipelineError;
use crate::security::AdminContext;
use crate::store::{FetchLogEntry, ProviderSummary, Resource, StoreError, resource};
use axum::{
    Json,
    extract::{Extension, Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::info;

const DEFAULT_LOG_LIMIT: i64 = 50;
const MAX_LOG_LIMIT: i64 = 500;

fn lookup(path: &str) -> Result<&'static Resource, AppError> {
    resource(path).ok_or_else(|| StoreError::UnknownResource(path.to_string()).into())
}

fn not_found(resource: &Resource, id: i64) -> AppError {
    PipelineError::not_found("admin", format!("{} {id} not found", resource.path)).into()
}

pub async fn list_records(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Value>>, AppError> {
    crate::metrics::inc_requests("/admin/{resource}");
    let resource = lookup(&path)?;
    let filters = resource.parse_filters(&query)?;
    let rows = state
        .pipeline
        .store()
        .list_records(resource, &filters)
        .await?;
    Ok(Json(rows))
}

pub async fn get_record(
    State(state): State<AppState>,
    Path((path, id)): Path<(String, i64)>,
) -> Result<Json<Value>, AppError> {
    let resource = lookup(&path)?;
    state
        .pipeline
        .store()
        .get_record(resource, id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(resource, id))
}

/// Create one record, or several in one transaction when the body is an array.
pub async fn create_record(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    Path(path): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    crate::metrics::inc_requests("/admin/{resource}");
    let resource = lookup(&path)?;
    if !resource.creatable {
        return Err(PipelineError::invalid_input(
            "admin",
            format!("{} cannot be created through the admin API", resource.path),
        )
        .into());
    }
    let body = json_body(payload, "admin")?;
    let store = state.pipeline.store();

    let created = match &body {
        Value::Array(items) => {
            let payloads = items
                .iter()
                .map(|item| resource.sanitize(item))
                .collect::<Result<Vec<Map<String, Value>>, _>>()?;
            Value::Array(store.create_records(resource, &payloads).await?)
        }
        single => store.create_record(resource, &resource.sanitize(single)?).await?,
    };
    info!(
        target = "syllabus.api",
        admin_id = %admin.admin_id,
        resource = resource.path,
        "record created"
    );
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_record(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    Path((path, id)): Path<(String, i64)>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let resource = lookup(&path)?;
    let changes = resource.sanitize(&json_body(payload, "admin")?)?;
    let updated = state
        .pipeline
        .store()
        .update_record(resource, id, &changes)
        .await?
        .ok_or_else(|| not_found(resource, id))?;
    info!(
        target = "syllabus.api",
        admin_id = %admin.admin_id,
        resource = resource.path,
        id,
        "record updated"
    );
    Ok(Json(updated))
}

/// Taxonomy rows are deactivated; other resources are removed.
pub async fn delete_record(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    Path((path, id)): Path<(String, i64)>,
) -> Result<Json<Value>, AppError> {
    let resource = lookup(&path)?;
    if !resource.deletable {
        return Err(PipelineError::invalid_input(
            "admin",
            format!("{} cannot be deleted", resource.path),
        )
        .into());
    }
    let deleted = state
        .pipeline
        .store()
        .delete_record(resource, id)
        .await?
        .ok_or_else(|| not_found(resource, id))?;
    info!(
        target = "syllabus.api",
        admin_id = %admin.admin_id,
        resource = resource.path,
        id,
        soft = resource.soft_delete,
        "record deleted"
    );
    Ok(Json(deleted))
}

#[derive(Debug, Deserialize)]
pub struct ProviderInput {
    #[serde(flatten)]
    pub config: ProviderConfig,
    #[serde(default = "default_activate")]
    pub activate: bool,
}

fn default_activate() -> bool {
    true
}

pub async fn list_providers(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProviderSummary>>, AppError> {
    Ok(Json(state.pipeline.store().list_providers().await?))
}

/// Store provider credentials. The key is never echoed back.
pub async fn save_provider(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    payload: Result<Json<ProviderInput>, JsonRejection>,
) -> Result<(StatusCode, Json<ProviderSummary>), AppError> {
    let input = json_body(payload, "ai_providers")?;
    if !input.config.is_usable() {
        return Err(PipelineError::invalid_input(
            "ai_providers",
            "api_key, model and base_url must be non-empty",
        )
        .into());
    }
    let summary = state
        .pipeline
        .store()
        .save_provider(&input.config, input.activate)
        .await?;
    info!(
        target = "syllabus.api",
        admin_id = %admin.admin_id,
        provider = %summary.provider_name,
        model = %summary.model,
        active = summary.is_active,
        "ai provider saved"
    );
    Ok((StatusCode::CREATED, Json(summary)))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn list_fetch_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<FetchLogEntry>>, AppError> {
    let limit = query
        .limit
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .min(MAX_LOG_LIMIT);
    Ok(Json(state.pipeline.store().list_fetch_logs(limit).await?))
}
