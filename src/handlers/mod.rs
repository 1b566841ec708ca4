//! Request handlers. Each validates its body, then hands off to the
//! pipeline or the store.

pub mod admin;
pub mod ai_fetch;
pub mod fetch_out;

use crate::pipeline::PipelineError;
use axum::{Json, extract::rejection::JsonRejection};

/// Unwraps a JSON body, turning extractor rejections into a 400.
pub(crate) fn json_body<T>(
    payload: Result<Json<T>, JsonRejection>,
    stage: &'static str,
) -> Result<T, PipelineError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| PipelineError::invalid_input(stage, rejection.body_text()))
}

pub(crate) fn required_id(
    value: Option<i64>,
    field: &'static str,
    stage: &'static str,
) -> Result<i64, PipelineError> {
    value.ok_or_else(|| PipelineError::invalid_input(stage, format!("{field} is required")))
}

pub(crate) fn required_text<'a>(
    value: Option<&'a str>,
    field: &'static str,
    stage: &'static str,
) -> Result<&'a str, PipelineError> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| PipelineError::invalid_input(stage, format!("{field} is required")))
}
