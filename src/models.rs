use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

#[skip_serializing_none]
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub detail: Option<String>,
}

/// One taxonomy row (board, university, paper, subject, chapter) as the
/// ingestion endpoints return it.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaxonomyRow {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
    pub is_approved: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BoardsFetchRequest {
    #[serde(default)]
    pub state_id: Option<i64>,
    #[serde(default)]
    pub state_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UniversitiesFetchRequest {
    #[serde(default)]
    pub state_id: Option<i64>,
    #[serde(default)]
    pub state_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PapersFetchRequest {
    #[serde(default)]
    pub university_id: Option<i64>,
    #[serde(default)]
    pub university_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubjectsFetchRequest {
    #[serde(default)]
    pub board_id: Option<i64>,
    #[serde(default)]
    pub board_name: Option<String>,
    #[serde(default)]
    pub class_id: Option<i64>,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub stream_id: Option<i64>,
    #[serde(default)]
    pub stream_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChaptersFetchRequest {
    #[serde(default)]
    pub subject_id: Option<i64>,
    #[serde(default)]
    pub subject_name: Option<String>,
    #[serde(default)]
    pub board_name: Option<String>,
    #[serde(default)]
    pub class_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct McqsFetchRequest {
    #[serde(default)]
    pub chapter_id: Option<i64>,
    #[serde(default)]
    pub chapter_name: Option<String>,
    #[serde(default)]
    pub subject_name: Option<String>,
}

/// Body of the public `/fetch-out-*` endpoints.
#[derive(Debug, Serialize)]
pub struct FetchOutResponse {
    pub success: bool,
    pub count: usize,
    pub data: Vec<TaxonomyRow>,
}

/// Body of the admin `/ai-fetch/*` endpoints.
#[derive(Debug, Serialize)]
pub struct AdminFetchResponse<T> {
    pub message: String,
    pub data: Vec<T>,
}
