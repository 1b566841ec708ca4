//! Public `/fetch-out-*` endpoints: generated rows go live immediately.

use super::{json_body, required_id, required_text};
use crate::app::{AppError, AppState};
use crate::models::{
    BoardsFetchRequest, ChaptersFetchRequest, FetchOutResponse, SubjectsFetchRequest,
};
use crate::pipeline::{FetchJob, IngestPlan, PipelineError};
use axum::{Json, extract::State, extract::rejection::JsonRejection};
use tracing::info;

/// Generate and activate school boards for a state.
///
/// - Method: `POST`
/// - Path: `/fetch-out-boards`
/// - Body: `{state_id, state_name}`
/// - Response: `{success, count, data}`; `429` when the same state is already
///   being fetched.
pub async fn fetch_out_boards(
    State(state): State<AppState>,
    payload: Result<Json<BoardsFetchRequest>, JsonRejection>,
) -> Result<Json<FetchOutResponse>, AppError> {
    crate::metrics::inc_requests("/fetch-out-boards");
    let request = json_body(payload, "fetch_out_boards")?;
    let state_id = required_id(request.state_id, "state_id", "fetch_out_boards")?;
    let state_name = required_text(
        request.state_name.as_deref(),
        "state_name",
        "fetch_out_boards",
    )?;
    run_guarded(&state, FetchJob::boards(state_id, state_name)).await
}

/// Generate and activate subjects for a board and class, optionally a stream.
pub async fn fetch_out_subjects(
    State(state): State<AppState>,
    payload: Result<Json<SubjectsFetchRequest>, JsonRejection>,
) -> Result<Json<FetchOutResponse>, AppError> {
    crate::metrics::inc_requests("/fetch-out-subjects");
    const STAGE: &str = "fetch_out_subjects";
    let request = json_body(payload, STAGE)?;
    let board_id = required_id(request.board_id, "board_id", STAGE)?;
    let board_name = required_text(request.board_name.as_deref(), "board_name", STAGE)?;
    let class_id = required_id(request.class_id, "class_id", STAGE)?;
    let class_name = required_text(request.class_name.as_deref(), "class_name", STAGE)?;
    let job = FetchJob::subjects(
        board_id,
        board_name,
        class_id,
        class_name,
        request.stream_id,
        request.stream_name.as_deref(),
    );
    run_guarded(&state, job).await
}

pub async fn fetch_out_chapters(
    State(state): State<AppState>,
    payload: Result<Json<ChaptersFetchRequest>, JsonRejection>,
) -> Result<Json<FetchOutResponse>, AppError> {
    crate::metrics::inc_requests("/fetch-out-chapters");
    const STAGE: &str = "fetch_out_chapters";
    let request = json_body(payload, STAGE)?;
    let subject_id = required_id(request.subject_id, "subject_id", STAGE)?;
    let subject_name = required_text(request.subject_name.as_deref(), "subject_name", STAGE)?;
    let board_name = required_text(request.board_name.as_deref(), "board_name", STAGE)?;
    let class_name = required_text(request.class_name.as_deref(), "class_name", STAGE)?;
    let job = FetchJob::chapters(subject_id, subject_name, Some(board_name), Some(class_name));
    run_guarded(&state, job).await
}

/// Holds the target's in-flight key for the whole run; the permit drops on
/// every exit path.
async fn run_guarded(state: &AppState, job: FetchJob) -> Result<Json<FetchOutResponse>, AppError> {
    let Some(permit) = state.guard.try_acquire(&job.target_key).await else {
        info!(target = "syllabus.guard", key = %job.target_key, "duplicate fetch rejected");
        return Err(PipelineError::throttled(
            "guard",
            "A fetch for this target is already in progress",
        )
        .into());
    };

    let plan = IngestPlan::fetch_out(state.config.fetch_out_commit);
    let report = state.pipeline.run(job, plan, "public").await?;
    info!(
        target = "syllabus.api",
        key = permit.key(),
        run_id = %report.run_id,
        count = report.rows.len(),
        "fetch-out completed"
    );
    Ok(Json(FetchOutResponse {
        success: true,
        count: report.rows.len(),
        data: report.rows,
    }))
}
