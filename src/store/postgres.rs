use super::{
    Approval, FetchLogEntry, NodeKind, NodeTransaction, NodeWriter, ProviderSummary, Resource,
    Scope, StoreError, TaxonomyStore,
};
use crate::llm::ProviderConfig;
use crate::models::TaxonomyRow;
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{
    Executor, PgPool, Postgres, Transaction,
    postgres::PgPoolOptions,
    types::Json,
};
use tracing::info;

/// Postgres-backed store. Table and column names come only from the static
/// [`NodeKind`] and [`Resource`] descriptors; every value is a bound parameter.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(target = "syllabus.store", max_connections, "connected to postgres");
        Ok(Self { pool })
    }
}

struct PgAutocommit {
    pool: PgPool,
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl NodeWriter for PgAutocommit {
    async fn find_existing(
        &mut self,
        scope: &Scope,
        name: &str,
    ) -> Result<Option<TaxonomyRow>, StoreError> {
        find_existing_in(&self.pool, scope, name).await
    }

    async fn reactivate(&mut self, kind: NodeKind, id: i64) -> Result<TaxonomyRow, StoreError> {
        reactivate_in(&self.pool, kind, id).await
    }

    async fn insert(
        &mut self,
        scope: &Scope,
        name: &str,
        approval: Approval,
    ) -> Result<TaxonomyRow, StoreError> {
        let row = insert_in(&self.pool, scope, name, approval, false).await?;
        row.ok_or_else(|| StoreError::Conflict(name.to_string()))
    }

    async fn insert_skip_conflict(
        &mut self,
        scope: &Scope,
        name: &str,
        approval: Approval,
    ) -> Result<Option<TaxonomyRow>, StoreError> {
        insert_in(&self.pool, scope, name, approval, true).await
    }
}

#[async_trait]
impl NodeWriter for PgTransaction {
    async fn find_existing(
        &mut self,
        scope: &Scope,
        name: &str,
    ) -> Result<Option<TaxonomyRow>, StoreError> {
        find_existing_in(&mut *self.tx, scope, name).await
    }

    async fn reactivate(&mut self, kind: NodeKind, id: i64) -> Result<TaxonomyRow, StoreError> {
        reactivate_in(&mut *self.tx, kind, id).await
    }

    async fn insert(
        &mut self,
        scope: &Scope,
        name: &str,
        approval: Approval,
    ) -> Result<TaxonomyRow, StoreError> {
        let row = insert_in(&mut *self.tx, scope, name, approval, false).await?;
        row.ok_or_else(|| StoreError::Conflict(name.to_string()))
    }

    async fn insert_skip_conflict(
        &mut self,
        scope: &Scope,
        name: &str,
        approval: Approval,
    ) -> Result<Option<TaxonomyRow>, StoreError> {
        insert_in(&mut *self.tx, scope, name, approval, true).await
    }
}

#[async_trait]
impl NodeTransaction for PgTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.rollback().await?;
        Ok(())
    }
}

fn row_columns(kind: NodeKind) -> &'static str {
    if kind.tracks_approval() {
        "id, name, is_active, is_approved"
    } else {
        "id, name, is_active, NULL::BOOLEAN AS is_approved"
    }
}

/// `(col = $n OR (col IS NULL AND $n IS NULL))` for every scope column.
fn scope_predicate(scope: &Scope, first_param: usize) -> String {
    scope
        .columns()
        .enumerate()
        .map(|(idx, (column, _))| {
            let param = first_param + idx;
            format!("({column} = ${param} OR ({column} IS NULL AND ${param}::BIGINT IS NULL))")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

async fn find_existing_in<'e, E>(
    executor: E,
    scope: &Scope,
    name: &str,
) -> Result<Option<TaxonomyRow>, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let kind = scope.kind();
    let name_param = scope.values().len() + 1;
    let sql = format!(
        "SELECT {cols} FROM {table} WHERE {predicate} AND LOWER(name) = LOWER(${name_param}) ORDER BY id LIMIT 1",
        cols = row_columns(kind),
        table = kind.table(),
        predicate = scope_predicate(scope, 1),
    );
    let mut query = sqlx::query_as::<_, TaxonomyRow>(&sql);
    for value in scope.values() {
        query = query.bind(*value);
    }
    Ok(query.bind(name).fetch_optional(executor).await?)
}

async fn reactivate_in<'e, E>(executor: E, kind: NodeKind, id: i64) -> Result<TaxonomyRow, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "UPDATE {table} SET is_active = TRUE WHERE id = $1 RETURNING {cols}",
        table = kind.table(),
        cols = row_columns(kind),
    );
    Ok(sqlx::query_as::<_, TaxonomyRow>(&sql)
        .bind(id)
        .fetch_one(executor)
        .await?)
}

async fn insert_in<'e, E>(
    executor: E,
    scope: &Scope,
    name: &str,
    approval: Approval,
    skip_conflict: bool,
) -> Result<Option<TaxonomyRow>, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let kind = scope.kind();
    let mut columns: Vec<&str> = kind.scope_columns().to_vec();
    columns.push("name");
    columns.push("is_active");
    if kind.tracks_approval() {
        columns.push("is_approved");
    }

    let scope_len = scope.values().len();
    let mut params: Vec<String> = (1..=scope_len + 1).map(|i| format!("${i}")).collect();
    params.push("TRUE".to_string());
    if kind.tracks_approval() {
        params.push(format!("${}", scope_len + 2));
    }

    let sql = format!(
        "INSERT INTO {table} ({columns}) VALUES ({params}){conflict} RETURNING {cols}",
        table = kind.table(),
        columns = columns.join(", "),
        params = params.join(", "),
        conflict = if skip_conflict { " ON CONFLICT DO NOTHING" } else { "" },
        cols = row_columns(kind),
    );
    let mut query = sqlx::query_as::<_, TaxonomyRow>(&sql);
    for value in scope.values() {
        query = query.bind(*value);
    }
    query = query.bind(name);
    if kind.tracks_approval() {
        query = query.bind(approval.is_approved());
    }
    Ok(query.fetch_optional(executor).await?)
}

async fn insert_record_in<'e, E>(
    executor: E,
    resource: &Resource,
    payload: &Map<String, Value>,
) -> Result<Value, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let columns = payload_columns(resource, payload)?;
    let sql = format!(
        "INSERT INTO {table} AS t ({columns}) SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1) RETURNING to_jsonb(t)",
        table = resource.table,
    );
    let Json(record) = sqlx::query_scalar::<_, Json<Value>>(&sql)
        .bind(Json(payload))
        .fetch_one(executor)
        .await
        .map_err(|err| unique_violation(err, resource))?;
    Ok(record)
}

/// Unique index hits from admin writes are client errors.
fn unique_violation(err: sqlx::Error, resource: &Resource) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(resource.path.to_string())
        }
        _ => StoreError::Database(err),
    }
}

fn payload_columns(resource: &Resource, payload: &Map<String, Value>) -> Result<String, StoreError> {
    let columns: Vec<&str> = resource
        .writable
        .iter()
        .copied()
        .filter(|column| payload.contains_key(*column))
        .collect();
    if columns.is_empty() {
        return Err(StoreError::InvalidPayload(format!(
            "no writable columns for {}",
            resource.path
        )));
    }
    Ok(columns.join(", "))
}

#[async_trait]
impl TaxonomyStore for PgStore {
    async fn autocommit(&self) -> Result<Box<dyn NodeWriter>, StoreError> {
        Ok(Box::new(PgAutocommit {
            pool: self.pool.clone(),
        }))
    }

    async fn begin(&self) -> Result<Box<dyn NodeTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn active_provider(&self) -> Result<Option<ProviderConfig>, StoreError> {
        Ok(sqlx::query_as::<_, ProviderConfig>(
            r#"
            SELECT provider_name, api_key, model, base_url
            FROM ai_providers
            WHERE is_active = TRUE
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_providers(&self) -> Result<Vec<ProviderSummary>, StoreError> {
        Ok(sqlx::query_as::<_, ProviderSummary>(
            r#"
            SELECT id, provider_name, model, base_url, is_active, created_at
            FROM ai_providers
            ORDER BY id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn save_provider(
        &self,
        provider: &ProviderConfig,
        activate: bool,
    ) -> Result<ProviderSummary, StoreError> {
        let mut tx = self.pool.begin().await?;
        if activate {
            sqlx::query("UPDATE ai_providers SET is_active = FALSE WHERE is_active = TRUE")
                .execute(&mut *tx)
                .await?;
        }
        let summary = sqlx::query_as::<_, ProviderSummary>(
            r#"
            INSERT INTO ai_providers (provider_name, api_key, model, base_url, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING id, provider_name, model, base_url, is_active, created_at
            "#,
        )
        .bind(&provider.provider_name)
        .bind(&provider.api_key)
        .bind(&provider.model)
        .bind(&provider.base_url)
        .bind(activate)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(summary)
    }

    async fn record_fetch_log(&self, entry: &FetchLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ai_fetch_logs
            (run_id, kind, target_key, requested_by, source, candidate_count, persisted_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.run_id)
        .bind(&entry.kind)
        .bind(&entry.target_key)
        .bind(&entry.requested_by)
        .bind(&entry.source)
        .bind(entry.candidate_count)
        .bind(entry.persisted_count)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_fetch_logs(&self, limit: i64) -> Result<Vec<FetchLogEntry>, StoreError> {
        Ok(sqlx::query_as::<_, FetchLogEntry>(
            r#"
            SELECT run_id, kind, target_key, requested_by, source, candidate_count, persisted_count, created_at
            FROM ai_fetch_logs
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_records(
        &self,
        resource: &Resource,
        filters: &[(&'static str, i64)],
    ) -> Result<Vec<Value>, StoreError> {
        let predicate = if filters.is_empty() {
            String::new()
        } else {
            let clauses: Vec<String> = filters
                .iter()
                .enumerate()
                .map(|(idx, (column, _))| format!("t.{column} = ${}", idx + 1))
                .collect();
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT to_jsonb(t) FROM {table} t{predicate} ORDER BY t.id LIMIT 500",
            table = resource.table,
        );
        let mut query = sqlx::query_scalar::<_, Json<Value>>(&sql);
        for (_, value) in filters {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|Json(value)| value).collect())
    }

    async fn get_record(&self, resource: &Resource, id: i64) -> Result<Option<Value>, StoreError> {
        let sql = format!(
            "SELECT to_jsonb(t) FROM {table} t WHERE t.id = $1",
            table = resource.table
        );
        let row = sqlx::query_scalar::<_, Json<Value>>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|Json(value)| value))
    }

    async fn create_record(
        &self,
        resource: &Resource,
        payload: &Map<String, Value>,
    ) -> Result<Value, StoreError> {
        insert_record_in(&self.pool, resource, payload).await
    }

    async fn create_records(
        &self,
        resource: &Resource,
        payloads: &[Map<String, Value>],
    ) -> Result<Vec<Value>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(payloads.len());
        for payload in payloads {
            created.push(insert_record_in(&mut *tx, resource, payload).await?);
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn update_record(
        &self,
        resource: &Resource,
        id: i64,
        payload: &Map<String, Value>,
    ) -> Result<Option<Value>, StoreError> {
        let columns = payload_columns(resource, payload)?;
        let sql = format!(
            "UPDATE {table} AS t SET ({columns}) = (SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1)) WHERE t.id = $2 RETURNING to_jsonb(t)",
            table = resource.table,
        );
        let row = sqlx::query_scalar::<_, Json<Value>>(&sql)
            .bind(Json(payload))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| unique_violation(err, resource))?;
        Ok(row.map(|Json(value)| value))
    }

    async fn delete_record(
        &self,
        resource: &Resource,
        id: i64,
    ) -> Result<Option<Value>, StoreError> {
        let sql = if resource.soft_delete {
            format!(
                "UPDATE {table} AS t SET is_active = FALSE WHERE t.id = $1 RETURNING to_jsonb(t)",
                table = resource.table
            )
        } else {
            format!(
                "DELETE FROM {table} AS t WHERE t.id = $1 RETURNING to_jsonb(t)",
                table = resource.table
            )
        };
        let row = sqlx::query_scalar::<_, Json<Value>>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|Json(value)| value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_predicate_is_null_aware() {
        let predicate = scope_predicate(&Scope::subjects(1, 2, None), 1);
        assert_eq!(
            predicate,
            "(board_id = $1 OR (board_id IS NULL AND $1::BIGINT IS NULL)) AND \
             (class_id = $2 OR (class_id IS NULL AND $2::BIGINT IS NULL)) AND \
             (stream_id = $3 OR (stream_id IS NULL AND $3::BIGINT IS NULL))"
        );
    }

    #[test]
    fn chapters_select_a_null_approval_column() {
        assert!(row_columns(NodeKind::Chapter).contains("NULL::BOOLEAN AS is_approved"));
        assert_eq!(row_columns(NodeKind::Board), "id, name, is_active, is_approved");
    }
}
