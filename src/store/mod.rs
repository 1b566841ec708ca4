//! Repository seam over the relational store.
//!
//! Handlers and the ingestion pipeline only talk to [`TaxonomyStore`]; the
//! Postgres backend is used in deployments and the in-memory backend in
//! demos and tests.

mod memory;
mod postgres;
pub mod resources;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use resources::{Resource, resource};

use crate::llm::ProviderConfig;
use crate::models::TaxonomyRow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unknown resource `{0}`")]
    UnknownResource(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("unique constraint violated for `{0}`")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Taxonomy levels the AI fetchers can populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Board,
    University,
    Paper,
    Subject,
    Chapter,
}

impl NodeKind {
    const ALL: [NodeKind; 5] = [
        NodeKind::Board,
        NodeKind::University,
        NodeKind::Paper,
        NodeKind::Subject,
        NodeKind::Chapter,
    ];

    /// The taxonomy level stored in `table`, if any.
    pub fn for_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.table() == table)
    }

    pub fn table(&self) -> &'static str {
        match self {
            NodeKind::Board => "boards",
            NodeKind::University => "universities",
            NodeKind::Paper => "papers",
            NodeKind::Subject => "subjects",
            NodeKind::Chapter => "chapters",
        }
    }

    pub fn scope_columns(&self) -> &'static [&'static str] {
        match self {
            NodeKind::Board | NodeKind::University => &["state_id"],
            NodeKind::Paper => &["university_id"],
            NodeKind::Subject => &["board_id", "class_id", "stream_id"],
            NodeKind::Chapter => &["subject_id"],
        }
    }

    /// Chapters carry no approval flag; every other level is moderated.
    pub fn tracks_approval(&self) -> bool {
        !matches!(self, NodeKind::Chapter)
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Board => "board",
            NodeKind::University => "university",
            NodeKind::Paper => "paper",
            NodeKind::Subject => "subject",
            NodeKind::Chapter => "chapter",
        }
    }
}

/// Parent keys a taxonomy row lives under. Values line up with
/// [`NodeKind::scope_columns`]; `None` is a SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    kind: NodeKind,
    values: Vec<Option<i64>>,
}

impl Scope {
    pub fn boards(state_id: i64) -> Self {
        Self::new(NodeKind::Board, vec![Some(state_id)])
    }

    pub fn universities(state_id: i64) -> Self {
        Self::new(NodeKind::University, vec![Some(state_id)])
    }

    pub fn papers(university_id: i64) -> Self {
        Self::new(NodeKind::Paper, vec![Some(university_id)])
    }

    pub fn subjects(board_id: i64, class_id: i64, stream_id: Option<i64>) -> Self {
        Self::new(
            NodeKind::Subject,
            vec![Some(board_id), Some(class_id), stream_id],
        )
    }

    pub fn chapters(subject_id: i64) -> Self {
        Self::new(NodeKind::Chapter, vec![Some(subject_id)])
    }

    fn new(kind: NodeKind, values: Vec<Option<i64>>) -> Self {
        debug_assert_eq!(values.len(), kind.scope_columns().len());
        Self { kind, values }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn values(&self) -> &[Option<i64>] {
        &self.values
    }

    pub fn columns(&self) -> impl Iterator<Item = (&'static str, Option<i64>)> + '_ {
        self.kind
            .scope_columns()
            .iter()
            .copied()
            .zip(self.values.iter().copied())
    }

    /// Null-aware equality: `stored = param OR (stored IS NULL AND param IS NULL)`.
    pub fn matches(&self, stored: &[Option<i64>]) -> bool {
        stored.len() == self.values.len()
            && stored.iter().zip(&self.values).all(|(a, b)| a == b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    /// Admin-triggered fetches wait for moderation.
    Pending,
    /// Public fetch-out rows feed browsing immediately.
    Approved,
}

impl Approval {
    pub fn is_approved(self) -> bool {
        matches!(self, Approval::Approved)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProviderSummary {
    pub id: i64,
    pub provider_name: String,
    pub model: String,
    pub base_url: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FetchLogEntry {
    pub run_id: Uuid,
    pub kind: String,
    pub target_key: String,
    pub requested_by: String,
    pub source: String,
    pub candidate_count: i32,
    pub persisted_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Row-level writes used by ingestion. Implementations either run every call
/// in its own implicit transaction or inside an open [`NodeTransaction`].
#[async_trait]
pub trait NodeWriter: Send {
    /// Case-insensitive name lookup within the scope, matching NULL keys to NULL.
    async fn find_existing(
        &mut self,
        scope: &Scope,
        name: &str,
    ) -> Result<Option<TaxonomyRow>, StoreError>;

    async fn reactivate(&mut self, kind: NodeKind, id: i64) -> Result<TaxonomyRow, StoreError>;

    async fn insert(
        &mut self,
        scope: &Scope,
        name: &str,
        approval: Approval,
    ) -> Result<TaxonomyRow, StoreError>;

    /// `INSERT .. ON CONFLICT DO NOTHING`; `None` when the row already existed.
    async fn insert_skip_conflict(
        &mut self,
        scope: &Scope,
        name: &str,
        approval: Approval,
    ) -> Result<Option<TaxonomyRow>, StoreError>;
}

/// An open transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait NodeTransaction: NodeWriter {
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TaxonomyStore: Send + Sync {
    async fn autocommit(&self) -> Result<Box<dyn NodeWriter>, StoreError>;
    async fn begin(&self) -> Result<Box<dyn NodeTransaction>, StoreError>;

    async fn active_provider(&self) -> Result<Option<ProviderConfig>, StoreError>;
    async fn list_providers(&self) -> Result<Vec<ProviderSummary>, StoreError>;
    /// Stores a provider; with `activate` every other provider is deactivated.
    async fn save_provider(
        &self,
        provider: &ProviderConfig,
        activate: bool,
    ) -> Result<ProviderSummary, StoreError>;

    async fn record_fetch_log(&self, entry: &FetchLogEntry) -> Result<(), StoreError>;
    async fn list_fetch_logs(&self, limit: i64) -> Result<Vec<FetchLogEntry>, StoreError>;

    async fn list_records(
        &self,
        resource: &Resource,
        filters: &[(&'static str, i64)],
    ) -> Result<Vec<Value>, StoreError>;
    async fn get_record(&self, resource: &Resource, id: i64) -> Result<Option<Value>, StoreError>;
    async fn create_record(
        &self,
        resource: &Resource,
        payload: &Map<String, Value>,
    ) -> Result<Value, StoreError>;
    /// Inserts all payloads in one transaction.
    async fn create_records(
        &self,
        resource: &Resource,
        payloads: &[Map<String, Value>],
    ) -> Result<Vec<Value>, StoreError>;
    async fn update_record(
        &self,
        resource: &Resource,
        id: i64,
        payload: &Map<String, Value>,
    ) -> Result<Option<Value>, StoreError>;
    /// Soft-deletes (`is_active = false`) where the resource allows it.
    async fn delete_record(&self, resource: &Resource, id: i64)
    -> Result<Option<Value>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_stream_matches_only_null_stream() {
        let scope = Scope::subjects(3, 11, None);
        assert!(scope.matches(&[Some(3), Some(11), None]));
        assert!(!scope.matches(&[Some(3), Some(11), Some(5)]));

        let streamed = Scope::subjects(3, 11, Some(5));
        assert!(streamed.matches(&[Some(3), Some(11), Some(5)]));
        assert!(!streamed.matches(&[Some(3), Some(11), None]));
    }

    #[test]
    fn scope_columns_follow_kind() {
        let scope = Scope::subjects(1, 2, None);
        let cols: Vec<_> = scope.columns().collect();
        assert_eq!(
            cols,
            vec![("board_id", Some(1)), ("class_id", Some(2)), ("stream_id", None)]
        );
        assert_eq!(Scope::chapters(9).kind().table(), "chapters");
        assert!(!NodeKind::Chapter.tracks_approval());
        assert_eq!(NodeKind::for_table("subjects"), Some(NodeKind::Subject));
        assert_eq!(NodeKind::for_table("mcqs"), None);
    }
}
