//! Admin `/ai-fetch/*` endpoints. Rows land pending approval, one
//! transaction per request.

use super::{json_body, required_id, required_text};
use crate::app::{AppError, AppState};
use crate::models::{
    AdminFetchResponse, BoardsFetchRequest, ChaptersFetchRequest, McqsFetchRequest,
    PapersFetchRequest, SubjectsFetchRequest, TaxonomyRow, UniversitiesFetchRequest,
};
use crate::pipeline::{FetchJob, FetchReport, IngestPlan, admin_conflict_mode};
use crate::security::AdminContext;
use axum::{
    Json,
    extract::{Extension, State, rejection::JsonRejection},
};
use serde_json::Value;
use tracing::info;

type FetchResult = Result<Json<AdminFetchResponse<TaxonomyRow>>, AppError>;

pub async fn boards(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    payload: Result<Json<BoardsFetchRequest>, JsonRejection>,
) -> FetchResult {
    crate::metrics::inc_requests("/ai-fetch/boards");
    const STAGE: &str = "ai_fetch_boards";
    let request = json_body(payload, STAGE)?;
    let state_id = required_id(request.state_id, "state_id", STAGE)?;
    let state_name = required_text(request.state_name.as_deref(), "state_name", STAGE)?;
    run(&state, &admin, FetchJob::boards(state_id, state_name), "boards").await
}

pub async fn universities(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    payload: Result<Json<UniversitiesFetchRequest>, JsonRejection>,
) -> FetchResult {
    crate::metrics::inc_requests("/ai-fetch/universities");
    const STAGE: &str = "ai_fetch_universities";
    let request = json_body(payload, STAGE)?;
    let state_id = required_id(request.state_id, "state_id", STAGE)?;
    let state_name = required_text(request.state_name.as_deref(), "state_name", STAGE)?;
    let job = FetchJob::universities(state_id, state_name);
    run(&state, &admin, job, "universities").await
}

pub async fn papers(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    payload: Result<Json<PapersFetchRequest>, JsonRejection>,
) -> FetchResult {
    crate::metrics::inc_requests("/ai-fetch/papers");
    const STAGE: &str = "ai_fetch_papers";
    let request = json_body(payload, STAGE)?;
    let university_id = required_id(request.university_id, "university_id", STAGE)?;
    let university_name =
        required_text(request.university_name.as_deref(), "university_name", STAGE)?;
    let job = FetchJob::papers(university_id, university_name);
    run(&state, &admin, job, "papers").await
}

pub async fn subjects(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    payload: Result<Json<SubjectsFetchRequest>, JsonRejection>,
) -> FetchResult {
    crate::metrics::inc_requests("/ai-fetch/subjects");
    const STAGE: &str = "ai_fetch_subjects";
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
    run(&state, &admin, job, "subjects").await
}

pub async fn chapters(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    payload: Result<Json<ChaptersFetchRequest>, JsonRejection>,
) -> FetchResult {
    crate::metrics::inc_requests("/ai-fetch/chapters");
    const STAGE: &str = "ai_fetch_chapters";
    let request = json_body(payload, STAGE)?;
    let subject_id = required_id(request.subject_id, "subject_id", STAGE)?;
    let subject_name = required_text(request.subject_name.as_deref(), "subject_name", STAGE)?;
    let job = FetchJob::chapters(
        subject_id,
        subject_name,
        request.board_name.as_deref(),
        request.class_name.as_deref(),
    );
    run(&state, &admin, job, "chapters").await
}

/// Generate five MCQs for a chapter; stored pending approval.
///
/// - Method: `POST`
/// - Path: `/ai-fetch/mcqs`
/// - Body: `{chapter_id, chapter_name, subject_name?}`
pub async fn mcqs(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    payload: Result<Json<McqsFetchRequest>, JsonRejection>,
) -> Result<Json<AdminFetchResponse<Value>>, AppError> {
    crate::metrics::inc_requests("/ai-fetch/mcqs");
    const STAGE: &str = "ai_fetch_mcqs";
    let request = json_body(payload, STAGE)?;
    let chapter_id = required_id(request.chapter_id, "chapter_id", STAGE)?;
    let chapter_name = required_text(request.chapter_name.as_deref(), "chapter_name", STAGE)?;

    let data = state
        .pipeline
        .run_mcqs(
            chapter_id,
            chapter_name,
            request.subject_name.as_deref(),
            &admin.admin_id,
        )
        .await?;
    info!(
        target = "syllabus.api",
        admin_id = %admin.admin_id,
        chapter_id,
        stored = data.len(),
        "mcqs fetched"
    );
    Ok(Json(AdminFetchResponse {
        message: format!("Fetched {} MCQs pending approval", data.len()),
        data,
    }))
}

async fn run(state: &AppState, admin: &AdminContext, job: FetchJob, label: &str) -> FetchResult {
    let plan = IngestPlan::admin(admin_conflict_mode(job.scope.kind()));
    let FetchReport {
        run_id,
        rows,
        candidate_count,
        source,
    } = state.pipeline.run(job, plan, &admin.admin_id).await?;

    info!(
        target = "syllabus.api",
        %run_id,
        admin_id = %admin.admin_id,
        key_id = %admin.key_id,
        candidates = candidate_count,
        stored = rows.len(),
        "admin fetch completed"
    );
    let message = if source.is_fallback() {
        format!("AI provider unavailable; {} {label} stored", rows.len())
    } else {
        format!("Fetched {} {label} pending approval", rows.len())
    };
    Ok(Json(AdminFetchResponse {
        message,
        data: rows,
    }))
}
