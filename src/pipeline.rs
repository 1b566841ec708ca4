//! Generate → filter → ingest for taxonomy levels, plus MCQ generation.

use crate::config::CommitPolicy;
use crate::filter::CandidateFilter;
use crate::llm::{GenerationClient, GenerationSource, MOCK_MARKER};
use crate::metrics::{self, StageTimer};
use crate::models::TaxonomyRow;
use crate::store::{
    self, Approval, FetchLogEntry, NodeKind, NodeWriter, Scope, StoreError, TaxonomyStore,
};
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Throttled,
    NotFound,
    Unauthorized,
    Internal,
}

impl PipelineError {
    fn new(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::InvalidInput)
    }

    pub fn throttled(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::Throttled)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::NotFound)
    }

    pub fn unauthorized(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::Unauthorized)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::Internal)
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownResource(path) => {
                Self::not_found("store", format!("unknown resource `{path}`"))
            }
            StoreError::InvalidPayload(message) => Self::invalid_input("store", message),
            StoreError::Conflict(name) => {
                Self::invalid_input("store", format!("`{name}` already exists"))
            }
            other => Self::internal("store", other.to_string()),
        }
    }
}

/// What ingestion does with a candidate whose name already exists in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictMode {
    /// Look the row up and set `is_active = true`; it is part of the result.
    Reactivate,
    /// `INSERT .. ON CONFLICT DO NOTHING`; existing rows are left out of the result.
    SkipExisting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestPlan {
    pub mode: ConflictMode,
    pub approval: Approval,
    pub commit: CommitPolicy,
}

impl IngestPlan {
    /// Public fetch-out: rows go live immediately.
    pub fn fetch_out(commit: CommitPolicy) -> Self {
        Self {
            mode: ConflictMode::Reactivate,
            approval: Approval::Approved,
            commit,
        }
    }

    /// Admin fetch: one transaction, rows wait for moderation.
    pub fn admin(mode: ConflictMode) -> Self {
        Self {
            mode,
            approval: Approval::Pending,
            commit: CommitPolicy::Batch,
        }
    }
}

/// Persists `names` under `scope` in order. Returns created or reactivated
/// rows without repeats.
pub async fn ingest(
    store: &dyn TaxonomyStore,
    scope: &Scope,
    names: &[String],
    plan: IngestPlan,
) -> Result<Vec<TaxonomyRow>, PipelineError> {
    let table = scope.kind().table();
    match plan.commit {
        CommitPolicy::Batch => {
            let mut tx = store.begin().await?;
            let mut rows = Vec::new();
            match write_all(tx.as_mut(), scope, names, plan, &mut rows).await {
                Ok(()) => {
                    tx.commit().await?;
                    Ok(rows)
                }
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        error!(target = "syllabus.ingest", table, error = %rollback_err, "rollback_failed");
                    }
                    warn!(target = "syllabus.ingest", table, error = %err, "batch rolled back");
                    Err(err.into())
                }
            }
        }
        CommitPolicy::PerRow => {
            let mut writer = store.autocommit().await?;
            let mut rows = Vec::new();
            match write_all(writer.as_mut(), scope, names, plan, &mut rows).await {
                Ok(()) => Ok(rows),
                Err(err) => {
                    warn!(
                        target = "syllabus.ingest",
                        table,
                        committed = rows.len(),
                        error = %err,
                        "per-row ingestion stopped; earlier rows stay committed"
                    );
                    Err(PipelineError::internal(
                        "ingest",
                        format!("failed after {} committed rows: {err}", rows.len()),
                    ))
                }
            }
        }
    }
}

async fn write_all<W: NodeWriter + ?Sized>(
    writer: &mut W,
    scope: &Scope,
    names: &[String],
    plan: IngestPlan,
    rows: &mut Vec<TaxonomyRow>,
) -> Result<(), StoreError> {
    let kind = scope.kind();
    let mut seen = HashSet::new();
    for name in names {
        let row = match plan.mode {
            ConflictMode::Reactivate => match writer.find_existing(scope, name).await? {
                Some(existing) => Some(writer.reactivate(kind, existing.id).await?),
                None => Some(writer.insert(scope, name, plan.approval).await?),
            },
            ConflictMode::SkipExisting => {
                writer.insert_skip_conflict(scope, name, plan.approval).await?
            }
        };
        match row {
            Some(row) if seen.insert(row.id) => rows.push(row),
            Some(_) => {}
            None => debug!(target = "syllabus.ingest", table = kind.table(), name = %name, "existing row skipped"),
        }
    }
    Ok(())
}

/// One generate → filter → ingest run.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub scope: Scope,
    /// Human label used in the prompt ("school education boards").
    pub prompt_kind: &'static str,
    pub context: String,
    pub filter: CandidateFilter,
    pub target_key: String,
}

impl FetchJob {
    pub fn boards(state_id: i64, state_name: &str) -> Self {
        Self {
            scope: Scope::boards(state_id),
            prompt_kind: "school education boards (K-12 only)",
            context: format!("the Indian state of {state_name}"),
            filter: CandidateFilter::school_boards(),
            target_key: crate::guard::boards_key(state_id),
        }
    }

    pub fn universities(state_id: i64, state_name: &str) -> Self {
        Self {
            scope: Scope::universities(state_id),
            prompt_kind: "universities",
            context: format!("the Indian state of {state_name}"),
            filter: CandidateFilter::universities(),
            target_key: format!("universities_{state_id}"),
        }
    }

    pub fn papers(university_id: i64, university_name: &str) -> Self {
        Self {
            scope: Scope::papers(university_id),
            prompt_kind: "exam papers or course stages",
            context: format!("the university {university_name}"),
            filter: CandidateFilter::papers(),
            target_key: format!("papers_{university_id}"),
        }
    }

    pub fn subjects(
        board_id: i64,
        board_name: &str,
        class_id: i64,
        class_name: &str,
        stream_id: Option<i64>,
        stream_name: Option<&str>,
    ) -> Self {
        let context = match stream_name.filter(|name| !name.trim().is_empty()) {
            Some(stream_name) => {
                format!("{class_name} ({stream_name} stream) under the {board_name} board")
            }
            None => format!("{class_name} under the {board_name} board"),
        };
        Self {
            scope: Scope::subjects(board_id, class_id, stream_id),
            prompt_kind: "school subjects",
            context,
            filter: CandidateFilter::subjects(),
            target_key: crate::guard::subjects_key(board_id, class_id, stream_id),
        }
    }

    pub fn chapters(
        subject_id: i64,
        subject_name: &str,
        board_name: Option<&str>,
        class_name: Option<&str>,
    ) -> Self {
        let mut context = format!("the subject {subject_name}");
        if let Some(class_name) = class_name {
            context.push_str(&format!(" for {class_name}"));
        }
        if let Some(board_name) = board_name {
            context.push_str(&format!(" following the {board_name} syllabus"));
        }
        Self {
            scope: Scope::chapters(subject_id),
            prompt_kind: "syllabus chapters",
            context,
            filter: CandidateFilter::chapters(),
            target_key: crate::guard::chapters_key(subject_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchReport {
    pub run_id: Uuid,
    pub rows: Vec<TaxonomyRow>,
    pub candidate_count: usize,
    pub source: GenerationSource,
}

#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn TaxonomyStore>,
    generator: Arc<GenerationClient>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn TaxonomyStore>, generator: GenerationClient) -> Self {
        Self {
            store,
            generator: Arc::new(generator),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaxonomyStore> {
        &self.store
    }

    pub async fn run(
        &self,
        job: FetchJob,
        plan: IngestPlan,
        requested_by: &str,
    ) -> Result<FetchReport, PipelineError> {
        let run_id = Uuid::new_v4();
        let table = job.scope.kind().table();

        let generation = {
            let _timer = StageTimer::start("generate");
            self.generator.generate(job.prompt_kind, &job.context).await
        };

        let names = job
            .filter
            .apply(generation.items.iter().map(|candidate| candidate.name.as_str()));
        info!(
            target = "syllabus.ingest",
            %run_id,
            table,
            target_key = %job.target_key,
            generated = generation.items.len(),
            accepted = names.len(),
            source = %generation.source.label(),
            "candidates filtered"
        );

        let outcome = {
            let _timer = StageTimer::start("ingest");
            ingest(self.store.as_ref(), &job.scope, &names, plan).await
        };

        let persisted = outcome.as_ref().map(Vec::len).unwrap_or(0);
        metrics::fetch_outcome(job.scope.kind().label(), generation.source.is_fallback(), persisted);
        self.log_fetch(FetchLogEntry {
            run_id,
            kind: job.scope.kind().label().to_string(),
            target_key: job.target_key.clone(),
            requested_by: requested_by.to_string(),
            source: generation.source.label(),
            candidate_count: count_i32(names.len()),
            persisted_count: count_i32(persisted),
            created_at: Utc::now(),
        })
        .await;

        let rows = outcome?;
        Ok(FetchReport {
            run_id,
            rows,
            candidate_count: names.len(),
            source: generation.source,
        })
    }

    /// Generates MCQs for a chapter and stores them pending approval in one
    /// transaction. Mock questions are never stored.
    pub async fn run_mcqs(
        &self,
        chapter_id: i64,
        chapter_name: &str,
        subject_name: Option<&str>,
        requested_by: &str,
    ) -> Result<Vec<Value>, PipelineError> {
        let run_id = Uuid::new_v4();
        let context = match subject_name {
            Some(subject) => format!("{subject}: {chapter_name}"),
            None => chapter_name.to_string(),
        };

        let generation = {
            let _timer = StageTimer::start("generate_mcqs");
            self.generator.generate_mcqs(&context).await
        };
        let payloads: Vec<Map<String, Value>> = generation
            .items
            .iter()
            .filter(|mcq| !mcq.question.contains(MOCK_MARKER))
            .map(|mcq| {
                let mut payload = Map::new();
                payload.insert("chapter_id".into(), json!(chapter_id));
                payload.insert("question".into(), json!(mcq.question.trim()));
                payload.insert("options".into(), json!(mcq.options));
                payload.insert("correct_answer".into(), json!(mcq.correct_answer));
                payload.insert("explanation".into(), json!(mcq.explanation));
                payload.insert("is_active".into(), json!(true));
                payload.insert("is_approved".into(), json!(false));
                payload
            })
            .collect();

        let stored = if payloads.is_empty() {
            Ok(Vec::new())
        } else {
            self.store
                .create_records(store::resources::mcqs(), &payloads)
                .await
                .map_err(PipelineError::from)
        };

        metrics::fetch_outcome(
            "mcq",
            generation.source.is_fallback(),
            stored.as_ref().map(Vec::len).unwrap_or(0),
        );
        self.log_fetch(FetchLogEntry {
            run_id,
            kind: "mcq".into(),
            target_key: format!("mcqs_{chapter_id}"),
            requested_by: requested_by.to_string(),
            source: generation.source.label(),
            candidate_count: count_i32(payloads.len()),
            persisted_count: count_i32(stored.as_ref().map(Vec::len).unwrap_or(0)),
            created_at: Utc::now(),
        })
        .await;

        stored
    }

    async fn log_fetch(&self, entry: FetchLogEntry) {
        if let Err(err) = self.store.record_fetch_log(&entry).await {
            warn!(target = "syllabus.store", run_id = %entry.run_id, error = %err, "fetch_log_write_failed");
        }
    }
}

/// Kinds whose admin fetch skips existing rows instead of reactivating them.
pub fn admin_conflict_mode(kind: NodeKind) -> ConflictMode {
    match kind {
        NodeKind::Board | NodeKind::Chapter => ConflictMode::SkipExisting,
        NodeKind::University | NodeKind::Paper | NodeKind::Subject => ConflictMode::Reactivate,
    }
}

fn count_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::http::build_client;
    use crate::llm::{LlmClient, ProviderConfig};
    use crate::store::MemoryStore;
    use crate::test_support::{gemini_reply, spawn_provider};

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn pipeline_for(store: &MemoryStore) -> Pipeline {
        let generator = GenerationClient::new(
            LlmClient::new(build_client(&Default::default())),
            Arc::new(store.clone()),
            RetryPolicy::default(),
        );
        Pipeline::new(Arc::new(store.clone()), generator)
    }

    #[tokio::test]
    async fn reactivation_never_duplicates_rows() {
        let store = MemoryStore::new();
        let scope = Scope::boards(7);
        let seeded = store.seed_node(&scope, "WBBSE", false).await;
        let plan = IngestPlan::fetch_out(CommitPolicy::PerRow);

        let first = ingest(&store, &scope, &names(&["wbbse", "WBCHSE"]), plan)
            .await
            .expect("first ingest");
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, seeded.id);
        assert!(first[0].is_active);

        let second = ingest(&store, &scope, &names(&["WBCHSE"]), plan)
            .await
            .expect("second ingest");
        assert_eq!(second[0].id, first[1].id);
        assert_eq!(store.nodes_in(&scope).await.len(), 2);
    }

    #[tokio::test]
    async fn skip_mode_leaves_existing_rows_out_of_the_result() {
        let store = MemoryStore::new();
        let scope = Scope::chapters(4);
        store.seed_node(&scope, "Motion", true).await;

        let rows = ingest(
            &store,
            &scope,
            &names(&["Motion", "Gravitation"]),
            IngestPlan::admin(ConflictMode::SkipExisting),
        )
        .await
        .expect("ingest");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Gravitation");
        assert_eq!(store.nodes_in(&scope).await.len(), 2);
    }

    #[tokio::test]
    async fn batch_failure_rolls_back_everything() {
        let store = MemoryStore::new();
        let scope = Scope::universities(2);
        store.fail_inserts_for("Broken University").await;

        let err = ingest(
            &store,
            &scope,
            &names(&["Jadavpur University", "Broken University", "Presidency University"]),
            IngestPlan::admin(ConflictMode::Reactivate),
        )
        .await
        .expect_err("must fail");
        assert_eq!(err.kind(), PipelineErrorKind::Internal);
        assert!(store.nodes_in(&scope).await.is_empty());
    }

    #[tokio::test]
    async fn per_row_failure_keeps_committed_prefix() {
        let store = MemoryStore::new();
        let scope = Scope::subjects(1, 10, None);
        store.fail_inserts_for("Chemistry").await;

        let err = ingest(
            &store,
            &scope,
            &names(&["Physics", "Chemistry", "Biology"]),
            IngestPlan::fetch_out(CommitPolicy::PerRow),
        )
        .await
        .expect_err("must fail");
        assert!(err.detail().contains("1 committed"));

        let rows = store.nodes_in(&scope).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Physics");
    }

    #[tokio::test]
    async fn null_stream_scope_matches_only_null_stream_rows() {
        let store = MemoryStore::new();
        let general = Scope::subjects(3, 11, None);
        let science = Scope::subjects(3, 11, Some(5));
        let existing = store.seed_node(&general, "Physics", false).await;
        let streamed = store.seed_node(&science, "Physics", true).await;

        let rows = ingest(
            &store,
            &general,
            &names(&["Physics"]),
            IngestPlan::fetch_out(CommitPolicy::Batch),
        )
        .await
        .expect("ingest");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, existing.id);
        assert_ne!(rows[0].id, streamed.id);
        assert_eq!(store.nodes_in(&general).await.len(), 1);
    }

    #[tokio::test]
    async fn fetch_out_rows_are_approved_and_admin_rows_pending() {
        let store = MemoryStore::new();
        let public = ingest(
            &store,
            &Scope::boards(1),
            &names(&["CBSE"]),
            IngestPlan::fetch_out(CommitPolicy::PerRow),
        )
        .await
        .expect("ingest");
        assert_eq!(public[0].is_approved, Some(true));

        let admin = ingest(
            &store,
            &Scope::boards(2),
            &names(&["ICSE"]),
            IngestPlan::admin(ConflictMode::SkipExisting),
        )
        .await
        .expect("ingest");
        assert_eq!(admin[0].is_approved, Some(false));
    }

    #[tokio::test]
    async fn run_filters_candidates_and_logs_the_fetch() {
        let provider = spawn_provider(gemini_reply(
            r#"[{"name":"WBCHSE"},{"name":"Some University Board"},{"name":"WBBSE"}]"#,
        ))
        .await;
        let store = MemoryStore::new();
        store
            .save_provider(
                &ProviderConfig {
                    provider_name: "gemini".into(),
                    api_key: "k".into(),
                    model: "gemini-test".into(),
                    base_url: provider.base_url.clone(),
                },
                true,
            )
            .await
            .expect("provider");

        let report = pipeline_for(&store)
            .run(
                FetchJob::boards(7, "West Bengal"),
                IngestPlan::fetch_out(CommitPolicy::PerRow),
                "public",
            )
            .await
            .expect("run");
        let names: Vec<_> = report.rows.iter().map(|row| row.name.as_str()).collect();
        assert_eq!(names, vec!["WBCHSE", "WBBSE"]);

        let logs = store.fetch_logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].target_key, "boards_7");
        assert_eq!(logs[0].persisted_count, 2);
        assert_eq!(logs[0].source, "provider:gemini-test");
    }

    #[tokio::test]
    async fn mock_generation_persists_nothing() {
        let store = MemoryStore::new();
        let pipeline = pipeline_for(&store);

        let report = pipeline
            .run(
                FetchJob::chapters(9, "Physics", None, None),
                IngestPlan::admin(ConflictMode::SkipExisting),
                "ops",
            )
            .await
            .expect("run");
        assert!(report.rows.is_empty());
        assert!(report.source.is_fallback());

        let mcqs = pipeline
            .run_mcqs(9, "Motion", Some("Physics"), "ops")
            .await
            .expect("mcqs");
        assert!(mcqs.is_empty());
        assert_eq!(store.fetch_logs().await.len(), 2);
    }

    #[test]
    fn store_errors_map_to_request_kinds() {
        let err: PipelineError = StoreError::UnknownResource("users".into()).into();
        assert_eq!(err.kind(), PipelineErrorKind::NotFound);
        let err: PipelineError = StoreError::InvalidPayload("bad".into()).into();
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        let err: PipelineError = StoreError::Unavailable("down".into()).into();
        assert_eq!(err.kind(), PipelineErrorKind::Internal);
    }

    #[test]
    fn admin_modes_follow_kind() {
        assert_eq!(admin_conflict_mode(NodeKind::Board), ConflictMode::SkipExisting);
        assert_eq!(admin_conflict_mode(NodeKind::Chapter), ConflictMode::SkipExisting);
        assert_eq!(admin_conflict_mode(NodeKind::Subject), ConflictMode::Reactivate);
    }
}
