use super::{
    Approval, FetchLogEntry, NodeKind, NodeTransaction, NodeWriter, ProviderSummary, Resource,
    Scope, StoreError, TaxonomyStore,
};
use crate::llm::ProviderConfig;
use crate::models::TaxonomyRow;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-process store used when no `DATABASE_URL` is configured and by tests.
///
/// Every table is a list of JSON rows, so ingestion and the admin CRUD routes
/// see the same taxonomy rows. Taxonomy tables carry a unique index on
/// `(scope.., lower(name))` where, as in Postgres, rows with a NULL scope key
/// never conflict. Transactions record their writes and replay them onto the
/// live tables at commit; ids come from the shared sequence as they are
/// handed out.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<MemoryTables>>,
    failing_names: Arc<Mutex<HashSet<String>>>,
}

#[derive(Clone, Default)]
struct MemoryTables {
    next_id: i64,
    rows: BTreeMap<&'static str, Vec<Value>>,
    providers: Vec<StoredProvider>,
    fetch_logs: Vec<FetchLogEntry>,
}

#[derive(Clone)]
struct StoredProvider {
    config: ProviderConfig,
    summary: ProviderSummary,
}

fn record_id(record: &Value) -> Option<i64> {
    record.get("id").and_then(Value::as_i64)
}

fn node_scope(kind: NodeKind, record: &Value) -> Vec<Option<i64>> {
    kind.scope_columns()
        .iter()
        .map(|column| record.get(*column).and_then(Value::as_i64))
        .collect()
}

fn node_row(kind: NodeKind, record: &Value) -> Option<TaxonomyRow> {
    Some(TaxonomyRow {
        id: record_id(record)?,
        name: record.get("name").and_then(Value::as_str)?.to_string(),
        is_active: record
            .get("is_active")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        is_approved: kind.tracks_approval().then(|| {
            record
                .get("is_approved")
                .and_then(Value::as_bool)
                .unwrap_or(false)
        }),
    })
}

fn same_name(record: &Value, wanted: &str) -> bool {
    record
        .get("name")
        .and_then(Value::as_str)
        .is_some_and(|name| name.to_lowercase() == wanted)
}

impl MemoryTables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn table(&mut self, table: &'static str) -> &mut Vec<Value> {
        self.rows.entry(table).or_default()
    }

    fn find(&self, scope: &Scope, name: &str) -> Option<TaxonomyRow> {
        let kind = scope.kind();
        let wanted = name.to_lowercase();
        self.rows.get(kind.table()).and_then(|rows| {
            rows.iter()
                .find(|record| {
                    scope.matches(&node_scope(kind, record)) && same_name(record, &wanted)
                })
                .and_then(|record| node_row(kind, record))
        })
    }

    /// Whether `(scope, name)` collides with another row under the unique index.
    fn violates_unique(&self, scope: &Scope, name: &str, except: Option<i64>) -> bool {
        if scope.values().iter().any(Option::is_none) {
            return false;
        }
        let kind = scope.kind();
        let wanted = name.to_lowercase();
        self.rows.get(kind.table()).is_some_and(|rows| {
            rows.iter().any(|record| {
                record_id(record) != except
                    && scope.matches(&node_scope(kind, record))
                    && same_name(record, &wanted)
            })
        })
    }

    fn insert_node(&mut self, id: i64, scope: &Scope, name: &str, approval: Approval) -> TaxonomyRow {
        let kind = scope.kind();
        let row = TaxonomyRow {
            id,
            name: name.to_string(),
            is_active: true,
            is_approved: kind.tracks_approval().then(|| approval.is_approved()),
        };
        let mut record = Map::new();
        record.insert("id".into(), json!(row.id));
        record.insert("name".into(), json!(row.name));
        for (column, value) in scope.columns() {
            record.insert(column.into(), json!(value));
        }
        record.insert("is_active".into(), json!(row.is_active));
        if let Some(approved) = row.is_approved {
            record.insert("is_approved".into(), json!(approved));
        }
        self.table(kind.table()).push(Value::Object(record));
        row
    }

    fn reactivate(&mut self, kind: NodeKind, id: i64) -> Option<TaxonomyRow> {
        let record = self
            .rows
            .get_mut(kind.table())?
            .iter_mut()
            .find(|record| record_id(record) == Some(id))?;
        record
            .as_object_mut()?
            .insert("is_active".into(), json!(true));
        node_row(kind, record)
    }

    /// Unique check for admin writes to taxonomy tables, using the row as it
    /// would look after the write.
    fn check_node_unique(
        &self,
        resource: &Resource,
        record: &Value,
        except: Option<i64>,
    ) -> Result<(), StoreError> {
        let Some(kind) = NodeKind::for_table(resource.table) else {
            return Ok(());
        };
        let Some(name) = record.get("name").and_then(Value::as_str) else {
            return Ok(());
        };
        let scope = Scope::new(kind, node_scope(kind, record));
        if self.violates_unique(&scope, name, except) {
            return Err(StoreError::Conflict(name.to_string()));
        }
        Ok(())
    }

    fn create_record(
        &mut self,
        resource: &Resource,
        payload: &Map<String, Value>,
    ) -> Result<Value, StoreError> {
        let mut record = payload.clone();
        if resource.soft_delete && !record.contains_key("is_active") {
            record.insert("is_active".into(), json!(true));
        }
        if NodeKind::for_table(resource.table).is_some_and(|kind| kind.tracks_approval())
            && !record.contains_key("is_approved")
        {
            record.insert("is_approved".into(), json!(false));
        }
        let mut record = Value::Object(record);
        self.check_node_unique(resource, &record, None)?;
        let id = self.allocate_id();
        if let Some(object) = record.as_object_mut() {
            object.insert("id".into(), json!(id));
        }
        self.table(resource.table).push(record.clone());
        Ok(record)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later insert of `name` (case-insensitive) fail.
    #[cfg(test)]
    pub async fn fail_inserts_for(&self, name: &str) {
        self.failing_names.lock().await.insert(name.to_lowercase());
    }

    #[cfg(test)]
    pub async fn seed_node(&self, scope: &Scope, name: &str, is_active: bool) -> TaxonomyRow {
        let mut tables = self.tables.lock().await;
        let id = tables.allocate_id();
        let mut row = tables.insert_node(id, scope, name, Approval::Approved);
        if !is_active
            && let Some(record) = tables
                .table(scope.kind().table())
                .iter_mut()
                .find(|record| record_id(record) == Some(id))
                .and_then(Value::as_object_mut)
        {
            record.insert("is_active".into(), json!(false));
            row.is_active = false;
        }
        row
    }

    /// Rows of `kind` whose scope matches, in insertion order.
    #[cfg(test)]
    pub async fn nodes_in(&self, scope: &Scope) -> Vec<TaxonomyRow> {
        let kind = scope.kind();
        let tables = self.tables.lock().await;
        tables
            .rows
            .get(kind.table())
            .map(|rows| {
                rows.iter()
                    .filter(|record| scope.matches(&node_scope(kind, record)))
                    .filter_map(|record| node_row(kind, record))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub async fn fetch_logs(&self) -> Vec<FetchLogEntry> {
        self.tables.lock().await.fetch_logs.clone()
    }
}

async fn check_fault(failing: &Mutex<HashSet<String>>, name: &str) -> Result<(), StoreError> {
    if failing.lock().await.contains(&name.to_lowercase()) {
        return Err(StoreError::Unavailable(format!(
            "injected insert failure for `{name}`"
        )));
    }
    Ok(())
}

/// Writes straight to the live tables, one implicit transaction per call.
struct MemoryWriter {
    shared: Arc<Mutex<MemoryTables>>,
    failing_names: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl NodeWriter for MemoryWriter {
    async fn find_existing(
        &mut self,
        scope: &Scope,
        name: &str,
    ) -> Result<Option<TaxonomyRow>, StoreError> {
        Ok(self.shared.lock().await.find(scope, name))
    }

    async fn reactivate(&mut self, kind: NodeKind, id: i64) -> Result<TaxonomyRow, StoreError> {
        self.shared
            .lock()
            .await
            .reactivate(kind, id)
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))
    }

    async fn insert(
        &mut self,
        scope: &Scope,
        name: &str,
        approval: Approval,
    ) -> Result<TaxonomyRow, StoreError> {
        check_fault(&self.failing_names, name).await?;
        let mut tables = self.shared.lock().await;
        if tables.violates_unique(scope, name, None) {
            return Err(StoreError::Conflict(name.to_string()));
        }
        let id = tables.allocate_id();
        Ok(tables.insert_node(id, scope, name, approval))
    }

    async fn insert_skip_conflict(
        &mut self,
        scope: &Scope,
        name: &str,
        approval: Approval,
    ) -> Result<Option<TaxonomyRow>, StoreError> {
        check_fault(&self.failing_names, name).await?;
        let mut tables = self.shared.lock().await;
        if tables.violates_unique(scope, name, None) {
            return Ok(None);
        }
        let id = tables.allocate_id();
        Ok(Some(tables.insert_node(id, scope, name, approval)))
    }
}

enum PendingWrite {
    Insert {
        id: i64,
        scope: Scope,
        name: String,
        approval: Approval,
    },
    Reactivate {
        kind: NodeKind,
        id: i64,
    },
}

impl PendingWrite {
    /// Applies the write, re-checking the unique index against `tables`.
    fn apply(&self, tables: &mut MemoryTables) -> Result<(), StoreError> {
        match self {
            PendingWrite::Insert {
                id,
                scope,
                name,
                approval,
            } => {
                if tables.violates_unique(scope, name, None) {
                    return Err(StoreError::Conflict(name.clone()));
                }
                tables.insert_node(*id, scope, name, *approval);
            }
            PendingWrite::Reactivate { kind, id } => {
                tables
                    .reactivate(*kind, *id)
                    .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;
            }
        }
        Ok(())
    }
}

/// Buffers node writes until commit. Reads see the live tables with this
/// transaction's own writes laid over them.
struct MemoryTransaction {
    shared: Arc<Mutex<MemoryTables>>,
    failing_names: Arc<Mutex<HashSet<String>>>,
    pending: Vec<PendingWrite>,
}

impl MemoryTransaction {
    async fn view(&self) -> MemoryTables {
        let mut view = self.shared.lock().await.clone();
        for write in &self.pending {
            // conflicts with rows committed since staging surface at commit
            let _ = write.apply(&mut view);
        }
        view
    }

    async fn stage_insert(
        &mut self,
        scope: &Scope,
        name: &str,
        approval: Approval,
    ) -> Result<Option<TaxonomyRow>, StoreError> {
        check_fault(&self.failing_names, name).await?;
        let mut view = self.view().await;
        if view.violates_unique(scope, name, None) {
            return Ok(None);
        }
        let id = self.shared.lock().await.allocate_id();
        let row = view.insert_node(id, scope, name, approval);
        self.pending.push(PendingWrite::Insert {
            id,
            scope: scope.clone(),
            name: name.to_string(),
            approval,
        });
        Ok(Some(row))
    }
}

#[async_trait]
impl NodeWriter for MemoryTransaction {
    async fn find_existing(
        &mut self,
        scope: &Scope,
        name: &str,
    ) -> Result<Option<TaxonomyRow>, StoreError> {
        Ok(self.view().await.find(scope, name))
    }

    async fn reactivate(&mut self, kind: NodeKind, id: i64) -> Result<TaxonomyRow, StoreError> {
        let row = self
            .view()
            .await
            .reactivate(kind, id)
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;
        self.pending.push(PendingWrite::Reactivate { kind, id });
        Ok(row)
    }

    async fn insert(
        &mut self,
        scope: &Scope,
        name: &str,
        approval: Approval,
    ) -> Result<TaxonomyRow, StoreError> {
        self.stage_insert(scope, name, approval)
            .await?
            .ok_or_else(|| StoreError::Conflict(name.to_string()))
    }

    async fn insert_skip_conflict(
        &mut self,
        scope: &Scope,
        name: &str,
        approval: Approval,
    ) -> Result<Option<TaxonomyRow>, StoreError> {
        self.stage_insert(scope, name, approval).await
    }
}

#[async_trait]
impl NodeTransaction for MemoryTransaction {
    /// Replays the buffered writes onto the live tables; all or nothing.
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut live = self.shared.lock().await;
        let mut next = live.clone();
        for write in &self.pending {
            write.apply(&mut next)?;
        }
        *live = next;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl TaxonomyStore for MemoryStore {
    async fn autocommit(&self) -> Result<Box<dyn NodeWriter>, StoreError> {
        Ok(Box::new(MemoryWriter {
            shared: self.tables.clone(),
            failing_names: self.failing_names.clone(),
        }))
    }

    async fn begin(&self) -> Result<Box<dyn NodeTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            shared: self.tables.clone(),
            failing_names: self.failing_names.clone(),
            pending: Vec::new(),
        }))
    }

    async fn active_provider(&self) -> Result<Option<ProviderConfig>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .providers
            .iter()
            .rev()
            .find(|p| p.summary.is_active)
            .map(|p| p.config.clone()))
    }

    async fn list_providers(&self) -> Result<Vec<ProviderSummary>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .providers
            .iter()
            .rev()
            .map(|p| p.summary.clone())
            .collect())
    }

    async fn save_provider(
        &self,
        provider: &ProviderConfig,
        activate: bool,
    ) -> Result<ProviderSummary, StoreError> {
        let mut tables = self.tables.lock().await;
        if activate {
            for existing in tables.providers.iter_mut() {
                existing.summary.is_active = false;
            }
        }
        let summary = ProviderSummary {
            id: tables.allocate_id(),
            provider_name: provider.provider_name.clone(),
            model: provider.model.clone(),
            base_url: provider.base_url.clone(),
            is_active: activate,
            created_at: Utc::now(),
        };
        tables.providers.push(StoredProvider {
            config: provider.clone(),
            summary: summary.clone(),
        });
        Ok(summary)
    }

    async fn record_fetch_log(&self, entry: &FetchLogEntry) -> Result<(), StoreError> {
        self.tables.lock().await.fetch_logs.push(entry.clone());
        Ok(())
    }

    async fn list_fetch_logs(&self, limit: i64) -> Result<Vec<FetchLogEntry>, StoreError> {
        let tables = self.tables.lock().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(tables.fetch_logs.iter().rev().take(limit).cloned().collect())
    }

    async fn list_records(
        &self,
        resource: &Resource,
        filters: &[(&'static str, i64)],
    ) -> Result<Vec<Value>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .rows
            .get(resource.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| {
                        filters
                            .iter()
                            .all(|(column, value)| row.get(*column).and_then(Value::as_i64) == Some(*value))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_record(&self, resource: &Resource, id: i64) -> Result<Option<Value>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .rows
            .get(resource.table)
            .and_then(|rows| rows.iter().find(|row| record_id(row) == Some(id)).cloned()))
    }

    async fn create_record(
        &self,
        resource: &Resource,
        payload: &Map<String, Value>,
    ) -> Result<Value, StoreError> {
        self.tables.lock().await.create_record(resource, payload)
    }

    async fn create_records(
        &self,
        resource: &Resource,
        payloads: &[Map<String, Value>],
    ) -> Result<Vec<Value>, StoreError> {
        let mut live = self.tables.lock().await;
        let mut next = live.clone();
        let created = payloads
            .iter()
            .map(|payload| next.create_record(resource, payload))
            .collect::<Result<Vec<_>, _>>()?;
        *live = next;
        Ok(created)
    }

    async fn update_record(
        &self,
        resource: &Resource,
        id: i64,
        payload: &Map<String, Value>,
    ) -> Result<Option<Value>, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(current) = tables
            .table(resource.table)
            .iter()
            .find(|row| record_id(row) == Some(id))
            .cloned()
        else {
            return Ok(None);
        };
        let mut updated = current;
        if let Some(object) = updated.as_object_mut() {
            for (key, value) in payload {
                object.insert(key.clone(), value.clone());
            }
        }
        tables.check_node_unique(resource, &updated, Some(id))?;
        if let Some(slot) = tables
            .table(resource.table)
            .iter_mut()
            .find(|row| record_id(row) == Some(id))
        {
            *slot = updated.clone();
        }
        Ok(Some(updated))
    }

    async fn delete_record(
        &self,
        resource: &Resource,
        id: i64,
    ) -> Result<Option<Value>, StoreError> {
        let mut tables = self.tables.lock().await;
        let rows = tables.table(resource.table);
        let Some(position) = rows.iter().position(|row| record_id(row) == Some(id)) else {
            return Ok(None);
        };
        if resource.soft_delete {
            if let Some(object) = rows[position].as_object_mut() {
                object.insert("is_active".into(), json!(false));
            }
            Ok(Some(rows[position].clone()))
        } else {
            Ok(Some(rows.remove(position)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transaction_writes_are_invisible_until_commit() {
        let store = MemoryStore::new();
        let scope = Scope::boards(7);

        let mut tx = store.begin().await.expect("begin");
        tx.insert(&scope, "WBBSE", Approval::Pending)
            .await
            .expect("insert");
        assert!(store.nodes_in(&scope).await.is_empty());

        tx.commit().await.expect("commit");
        let rows = store.nodes_in(&scope).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].is_approved, Some(false));
    }

    #[tokio::test]
    async fn rollback_discards_staged_rows() {
        let store = MemoryStore::new();
        let scope = Scope::chapters(3);

        let mut tx = store.begin().await.expect("begin");
        tx.insert(&scope, "Motion", Approval::Pending)
            .await
            .expect("insert");
        tx.rollback().await.expect("rollback");

        assert!(store.nodes_in(&scope).await.is_empty());
    }

    #[tokio::test]
    async fn commit_keeps_writes_made_while_the_transaction_was_open() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.expect("begin");

        let mut writer = store.autocommit().await.expect("writer");
        let outside = writer
            .insert(&Scope::boards(1), "CBSE", Approval::Approved)
            .await
            .expect("autocommit insert");
        store
            .save_provider(
                &ProviderConfig {
                    provider_name: "gemini".into(),
                    api_key: "k".into(),
                    model: "m".into(),
                    base_url: "http://localhost".into(),
                },
                true,
            )
            .await
            .expect("provider");

        let inside = tx
            .insert(&Scope::boards(2), "ICSE", Approval::Pending)
            .await
            .expect("tx insert");
        assert_ne!(outside.id, inside.id);
        tx.commit().await.expect("commit");

        assert_eq!(store.nodes_in(&Scope::boards(1)).await, vec![outside]);
        assert_eq!(store.nodes_in(&Scope::boards(2)).await, vec![inside]);
        assert!(store.active_provider().await.expect("lookup").is_some());
    }

    #[tokio::test]
    async fn commit_fails_whole_when_a_staged_row_now_conflicts() {
        let store = MemoryStore::new();
        let scope = Scope::chapters(4);
        let mut tx = store.begin().await.expect("begin");
        tx.insert(&scope, "Optics", Approval::Pending)
            .await
            .expect("staged");
        tx.insert(&scope, "Waves", Approval::Pending)
            .await
            .expect("staged");

        let mut writer = store.autocommit().await.expect("writer");
        writer
            .insert(&scope, "optics", Approval::Approved)
            .await
            .expect("concurrent insert");

        let err = tx.commit().await.expect_err("conflict");
        assert!(matches!(err, StoreError::Conflict(_)));
        let names: Vec<_> = store
            .nodes_in(&scope)
            .await
            .into_iter()
            .map(|row| row.name)
            .collect();
        assert_eq!(names, vec!["optics"]);
    }

    #[tokio::test]
    async fn transaction_reads_its_own_writes() {
        let store = MemoryStore::new();
        let scope = Scope::boards(5);
        let existing = store.seed_node(&scope, "JKBOSE", false).await;

        let mut tx = store.begin().await.expect("begin");
        tx.insert(&scope, "NIOS", Approval::Pending)
            .await
            .expect("insert");
        assert!(tx.find_existing(&scope, "nios").await.expect("find").is_some());
        let reactivated = tx
            .reactivate(NodeKind::Board, existing.id)
            .await
            .expect("reactivate");
        assert!(reactivated.is_active);
        assert!(!store.nodes_in(&scope).await[0].is_active);

        tx.commit().await.expect("commit");
        assert!(store.nodes_in(&scope).await.iter().all(|row| row.is_active));
    }

    #[tokio::test]
    async fn admin_records_and_ingested_nodes_share_a_table() {
        let store = MemoryStore::new();
        let boards = super::super::resource("boards").expect("boards");
        let scope = Scope::boards(7);
        let ingested = store.seed_node(&scope, "WBBSE", true).await;

        let listed = store
            .list_records(boards, &[("state_id", 7)])
            .await
            .expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["name"], json!("WBBSE"));

        store
            .delete_record(boards, ingested.id)
            .await
            .expect("delete")
            .expect("row");
        assert!(!store.nodes_in(&scope).await[0].is_active);

        let mut payload = Map::new();
        payload.insert("name".into(), json!("wbbse"));
        payload.insert("state_id".into(), json!(7));
        let err = store
            .create_record(boards, &payload)
            .await
            .expect_err("duplicate");
        assert!(matches!(err, StoreError::Conflict(_)));

        payload.insert("name".into(), json!("WBCHSE"));
        let created = store.create_record(boards, &payload).await.expect("create");
        assert_eq!(created["is_approved"], json!(false));
        let mut writer = store.autocommit().await.expect("writer");
        let found = writer
            .find_existing(&scope, "wbchse")
            .await
            .expect("find")
            .expect("admin row visible to ingestion");
        assert_eq!(Some(found.id), record_id(&created));
    }

    #[tokio::test]
    async fn skip_conflict_ignores_case_insensitive_duplicates() {
        let store = MemoryStore::new();
        let scope = Scope::boards(1);
        store.seed_node(&scope, "CBSE", true).await;

        let mut writer = store.autocommit().await.expect("writer");
        let skipped = writer
            .insert_skip_conflict(&scope, "cbse", Approval::Pending)
            .await
            .expect("insert");
        assert!(skipped.is_none());
        assert_eq!(store.nodes_in(&scope).await.len(), 1);
    }

    #[tokio::test]
    async fn soft_delete_keeps_the_record() {
        let store = MemoryStore::new();
        let states = super::super::resource("states").expect("states");
        let mut payload = Map::new();
        payload.insert("name".into(), json!("Kerala"));
        let created = store.create_record(states, &payload).await.expect("create");
        let id = record_id(&created).expect("id");

        let deleted = store
            .delete_record(states, id)
            .await
            .expect("delete")
            .expect("row");
        assert_eq!(deleted["is_active"], json!(false));
        assert!(store.get_record(states, id).await.expect("get").is_some());
    }
}
