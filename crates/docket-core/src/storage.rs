use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Sqlite, SqliteConnection,
};
use uuid::Uuid;

use crate::{
    analysis::{AnalysisResult, ClauseSnapshot, ReferenceClause, Template, TemplateSet},
    audit::{AuditLogEntry, NewAuditEntry},
    batch::{BatchStatus, ClaimOutcome, NotificationBatch},
    document::{Document, NewDocument, ProcessingStatus},
    recommendation::{ServicePlan, ServicePlanClause},
    service_info::ServiceInfoSnapshot,
    Error, Result,
};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL UNIQUE,
    file_name TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    content TEXT,
    processing_status TEXT NOT NULL,
    processing_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(processing_status, updated_at);

CREATE TABLE IF NOT EXISTS analysis_results (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL UNIQUE REFERENCES documents(id) ON DELETE CASCADE,
    results_by_template TEXT NOT NULL,
    selected_template_ids TEXT NOT NULL,
    reference_clauses TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS service_info_snapshots (
    document_id TEXT PRIMARY KEY REFERENCES documents(id) ON DELETE CASCADE,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    document_id TEXT,
    action TEXT NOT NULL,
    source TEXT NOT NULL,
    status TEXT NOT NULL,
    description TEXT,
    duration_ms INTEGER,
    metadata TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_document ON audit_log(document_id, created_at);

CREATE TABLE IF NOT EXISTS templates (
    id TEXT PRIMARY KEY,
    slug TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reference_clauses (
    id TEXT PRIMARY KEY,
    template_id TEXT NOT NULL REFERENCES templates(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    category TEXT NOT NULL,
    clause_item TEXT NOT NULL,
    standard_text TEXT NOT NULL,
    risk_level TEXT
);

CREATE INDEX IF NOT EXISTS idx_clauses_template ON reference_clauses(template_id, position);

CREATE TABLE IF NOT EXISTS service_plans (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS service_plan_clauses (
    id TEXT PRIMARY KEY,
    plan_id TEXT NOT NULL REFERENCES service_plans(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    category TEXT,
    clause_item TEXT NOT NULL,
    requirement TEXT NOT NULL,
    notes TEXT
);

CREATE TABLE IF NOT EXISTS notification_batches (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS batch_members (
    batch_id TEXT NOT NULL REFERENCES notification_batches(id) ON DELETE CASCADE,
    document_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (batch_id, document_id)
);

CREATE INDEX IF NOT EXISTS idx_batch_members_document ON batch_members(document_id);
"#;

const DOCUMENT_COLUMNS: &str = "id, content_hash, file_name, mime_type, file_size, content, \
     processing_status, processing_error, created_at, updated_at";

type DocumentRow = (
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    String,
    Option<String>,
    String,
    String,
);

type AuditRow = (
    String,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
    Option<i64>,
    Option<String>,
    String,
);

type BatchRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
);

/// SQLite-backed persistence for every pipeline record.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory database. The connection is never recycled,
    /// since dropping it would drop the database.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;
        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    // Document operations

    /// Insert a document, or refresh the existing record with the same content
    /// hash. Returns the stored document and whether it already existed.
    pub async fn upsert_document(&self, new: &NewDocument) -> Result<(Document, bool)> {
        let id = Uuid::now_v7();
        let now = timestamp(Utc::now());

        let (stored_id,): (String,) = sqlx::query_as(
            r#"
            INSERT INTO documents (id, content_hash, file_name, mime_type, file_size, content,
                                   processing_status, processing_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
            ON CONFLICT(content_hash) DO UPDATE SET
                file_name = excluded.file_name,
                mime_type = excluded.mime_type,
                file_size = excluded.file_size,
                content = excluded.content,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(id.to_string())
        .bind(&new.content_hash)
        .bind(&new.file_name)
        .bind(&new.mime_type)
        .bind(new.file_size)
        .bind(&new.content)
        .bind(ProcessingStatus::Pending.as_str())
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        let stored_id = parse_uuid(&stored_id)?;
        let document = self.get_document(stored_id).await?;
        Ok((document, stored_id != id))
    }

    pub async fn get_document(&self, id: Uuid) -> Result<Document> {
        let row: Option<DocumentRow> = sqlx::query_as(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(parse_document_row)
            .transpose()?
            .ok_or(Error::DocumentNotFound(id))
    }

    pub async fn find_document_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let row: Option<DocumentRow> = sqlx::query_as(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE content_hash = ?"
        ))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(parse_document_row).transpose()
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_document_row).collect()
    }

    /// Documents in a non-terminal status, oldest update first.
    pub async fn list_active_documents(&self) -> Result<Vec<Document>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents \
             WHERE processing_status IN (?, ?, ?) ORDER BY updated_at ASC, id ASC"
        ))
        .bind(ProcessingStatus::ACTIVE[0].as_str())
        .bind(ProcessingStatus::ACTIVE[1].as_str())
        .bind(ProcessingStatus::ACTIVE[2].as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_document_row).collect()
    }

    /// Non-terminal documents not touched since `before`, oldest first.
    pub async fn list_stale_documents(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Document>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents \
             WHERE processing_status IN (?, ?, ?) AND updated_at < ? \
             ORDER BY updated_at ASC, id ASC LIMIT ?"
        ))
        .bind(ProcessingStatus::ACTIVE[0].as_str())
        .bind(ProcessingStatus::ACTIVE[1].as_str())
        .bind(ProcessingStatus::ACTIVE[2].as_str())
        .bind(timestamp(before))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_document_row).collect()
    }

    /// Compare-and-set the processing status. Returns `false` when the
    /// document is no longer in `from`, so concurrent callers cannot both win.
    pub async fn transition_status(
        &self,
        id: Uuid,
        from: ProcessingStatus,
        to: ProcessingStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE documents SET processing_status = ?, processing_error = ?, updated_at = ?
            WHERE id = ? AND processing_status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(error)
        .bind(timestamp(Utc::now()))
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.get_document(id).await?;
            return Ok(false);
        }

        Ok(true)
    }

    /// Unconditionally put a document back to PENDING, clearing its error.
    /// Used by recovery for documents whose run was lost.
    pub async fn reset_to_pending(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE documents SET processing_status = ?, processing_error = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(ProcessingStatus::Pending.as_str())
        .bind(timestamp(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::DocumentNotFound(id));
        }

        Ok(())
    }

    // Analysis operations

    /// Replace the stored analysis for the document in one statement.
    pub async fn upsert_analysis(&self, result: &AnalysisResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analysis_results (id, document_id, results_by_template,
                                          selected_template_ids, reference_clauses,
                                          created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                results_by_template = excluded.results_by_template,
                selected_template_ids = excluded.selected_template_ids,
                reference_clauses = excluded.reference_clauses,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(result.id.to_string())
        .bind(result.document_id.to_string())
        .bind(serde_json::to_string(&result.results_by_template)?)
        .bind(result.selected_template_ids.to_json()?)
        .bind(serde_json::to_string(&result.reference_clauses)?)
        .bind(timestamp(result.created_at))
        .bind(timestamp(result.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stored analysis for a document. Malformed stored JSON degrades to empty
    /// values, which never match a requested selection.
    pub async fn get_analysis(&self, document_id: Uuid) -> Result<Option<AnalysisResult>> {
        let row: Option<(String, String, String, String, String, String, String)> =
            sqlx::query_as(
                r#"
                SELECT id, document_id, results_by_template, selected_template_ids,
                       reference_clauses, created_at, updated_at
                FROM analysis_results WHERE document_id = ?
                "#,
            )
            .bind(document_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some((id, doc_id, results, selected, clauses, created_at, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(AnalysisResult {
            id: parse_uuid(&id)?,
            document_id: parse_uuid(&doc_id)?,
            results_by_template: parse_or_default(&results, "analysis results"),
            selected_template_ids: TemplateSet::from_json(&selected).unwrap_or_default(),
            reference_clauses: parse_or_default::<ClauseSnapshot>(&clauses, "clause snapshot"),
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        }))
    }

    // Service info operations

    pub async fn upsert_service_info(
        &self,
        document_id: Uuid,
        snapshot: &ServiceInfoSnapshot,
    ) -> Result<()> {
        let now = timestamp(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO service_info_snapshots (document_id, payload, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(document_id.to_string())
        .bind(serde_json::to_string(snapshot)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_service_info(&self, document_id: Uuid) -> Result<Option<ServiceInfoSnapshot>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM service_info_snapshots WHERE document_id = ?")
                .bind(document_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(payload,)| ServiceInfoSnapshot::from_stored(Some(&payload))))
    }

    // Audit operations

    pub async fn insert_audit_entry(&self, entry: &NewAuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, document_id, action, source, status, description,
                                   duration_ms, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(entry.document_id.map(|id| id.to_string()))
        .bind(entry.action.as_str())
        .bind(entry.source.as_str())
        .bind(entry.status.as_str())
        .bind(&entry.description)
        .bind(entry.duration_ms())
        .bind(entry.metadata_string())
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Newest entries first, optionally for one document.
    pub async fn list_audit_entries(
        &self,
        document_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            r#"
            SELECT id, document_id, action, source, status, description, duration_ms,
                   metadata, created_at
            FROM audit_log
            WHERE ?1 IS NULL OR document_id = ?1
            ORDER BY created_at DESC, id DESC
            LIMIT ?2
            "#,
        )
        .bind(document_id.map(|id| id.to_string()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_audit_row).collect()
    }

    // Template operations

    pub async fn insert_template(&self, template: &Template) -> Result<()> {
        sqlx::query("INSERT INTO templates (id, slug, name, created_at) VALUES (?, ?, ?, ?)")
            .bind(&template.id)
            .bind(&template.slug)
            .bind(&template.name)
            .bind(timestamp(template.created_at))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Create the template with `slug` unless it exists, returning the stored row.
    pub async fn ensure_template(&self, slug: &str, name: &str) -> Result<Template> {
        sqlx::query(
            "INSERT INTO templates (id, slug, name, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(slug) DO NOTHING",
        )
        .bind(Uuid::now_v7().to_string())
        .bind(slug)
        .bind(name)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        self.find_template(slug)
            .await?
            .ok_or_else(|| Error::TemplateNotFound(slug.to_string()))
    }

    /// Look a template up by id or slug.
    pub async fn find_template(&self, key: &str) -> Result<Option<Template>> {
        let row: Option<(String, String, String, String)> = sqlx::query_as(
            "SELECT id, slug, name, created_at FROM templates WHERE id = ?1 OR slug = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(parse_template_row).transpose()
    }

    pub async fn list_templates(&self) -> Result<Vec<Template>> {
        let rows: Vec<(String, String, String, String)> =
            sqlx::query_as("SELECT id, slug, name, created_at FROM templates ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(parse_template_row).collect()
    }

    pub async fn reference_clauses(&self, template_id: &str) -> Result<Vec<ReferenceClause>> {
        let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT category, clause_item, standard_text, risk_level
            FROM reference_clauses WHERE template_id = ? ORDER BY position
            "#,
        )
        .bind(template_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(category, clause_item, standard_text, risk_level)| ReferenceClause {
                category,
                clause_item,
                standard_text,
                risk_level,
            })
            .collect())
    }

    /// Append clauses to a template in one transaction.
    pub async fn insert_reference_clauses(
        &self,
        template_id: &str,
        clauses: &[ReferenceClause],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let (offset,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM reference_clauses WHERE template_id = ?",
        )
        .bind(template_id)
        .fetch_one(&mut *tx)
        .await?;

        insert_clause_rows(&mut tx, template_id, offset, clauses).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Insert `clauses` only when the template has none yet. Returns whether
    /// this call seeded them; concurrent seeders serialize on the write lock.
    pub async fn seed_reference_clauses(
        &self,
        template_id: &str,
        clauses: &[ReferenceClause],
    ) -> Result<bool> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let seeded = seed_clauses_locked(&mut tx, template_id, clauses).await?;
        tx.commit().await?;
        Ok(seeded)
    }

    // Service plan operations

    pub async fn insert_service_plan(&self, plan: &ServicePlan) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO service_plans (id, name, description, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(plan.id.to_string())
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(timestamp(plan.created_at))
        .execute(&mut *tx)
        .await?;

        for (position, clause) in (0_i64..).zip(&plan.clauses) {
            sqlx::query(
                r#"
                INSERT INTO service_plan_clauses (id, plan_id, position, category, clause_item,
                                                  requirement, notes)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::now_v7().to_string())
            .bind(plan.id.to_string())
            .bind(position)
            .bind(&clause.category)
            .bind(&clause.clause_item)
            .bind(&clause.requirement)
            .bind(&clause.notes)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Every plan with its clauses, oldest plan first.
    pub async fn list_service_plans(&self) -> Result<Vec<ServicePlan>> {
        let plans: Vec<(String, String, Option<String>, String)> = sqlx::query_as(
            "SELECT id, name, description, created_at FROM service_plans ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        let clause_rows: Vec<(String, Option<String>, String, String, Option<String>)> =
            sqlx::query_as(
                r#"
                SELECT plan_id, category, clause_item, requirement, notes
                FROM service_plan_clauses ORDER BY plan_id, position
                "#,
            )
            .fetch_all(&self.pool)
            .await?;

        let mut clauses: BTreeMap<String, Vec<ServicePlanClause>> = BTreeMap::new();
        for (plan_id, category, clause_item, requirement, notes) in clause_rows {
            clauses.entry(plan_id).or_default().push(ServicePlanClause {
                category,
                clause_item,
                requirement,
                notes,
            });
        }

        plans
            .into_iter()
            .map(|(id, name, description, created_at)| {
                Ok(ServicePlan {
                    clauses: clauses.remove(&id).unwrap_or_default(),
                    id: parse_uuid(&id)?,
                    name,
                    description,
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }

    // Notification batch operations

    pub async fn insert_batch(&self, batch: &NotificationBatch) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO notification_batches (id, email, status, error, created_at, updated_at,
                                              completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(batch.id.to_string())
        .bind(&batch.email)
        .bind(batch.status.as_str())
        .bind(&batch.error)
        .bind(timestamp(batch.created_at))
        .bind(timestamp(batch.updated_at))
        .bind(batch.completed_at.map(timestamp))
        .execute(&mut *tx)
        .await?;

        for (position, document_id) in (0_i64..).zip(&batch.document_ids) {
            sqlx::query(
                "INSERT INTO batch_members (batch_id, document_id, position) VALUES (?, ?, ?)",
            )
            .bind(batch.id.to_string())
            .bind(document_id.to_string())
            .bind(position)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_batch(&self, id: Uuid) -> Result<NotificationBatch> {
        let mut conn = self.pool.acquire().await?;
        fetch_batch(&mut conn, id)
            .await?
            .ok_or(Error::BatchNotFound(id))
    }

    /// PENDING batches that list `document_id` as a member.
    pub async fn pending_batches_for_document(&self, document_id: Uuid) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT b.id FROM notification_batches b
            JOIN batch_members m ON m.batch_id = b.id
            WHERE m.document_id = ? AND b.status = ?
            ORDER BY b.created_at
            "#,
        )
        .bind(document_id.to_string())
        .bind(BatchStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|(id,)| parse_uuid(id)).collect()
    }

    /// Check-and-claim a batch for delivery inside one write transaction.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock before the reads, so concurrent
    /// claimers serialize and exactly one of them can observe PENDING. The
    /// transaction rolls back on drop when any step, commit included, fails.
    pub async fn claim_batch(&self, batch_id: Uuid) -> Result<ClaimOutcome> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let outcome = claim_batch_locked(&mut tx, batch_id).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn complete_batch(&self, id: Uuid) -> Result<()> {
        self.finish_batch(id, BatchStatus::Completed, None).await
    }

    pub async fn fail_batch(&self, id: Uuid, error: &str) -> Result<()> {
        self.finish_batch(id, BatchStatus::Failed, Some(error)).await
    }

    async fn finish_batch(&self, id: Uuid, status: BatchStatus, error: Option<&str>) -> Result<()> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE notification_batches
            SET status = ?, error = ?, updated_at = ?, completed_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .bind(BatchStatus::InProgress.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::BatchNotFound(id));
        }

        Ok(())
    }
}

async fn insert_clause_rows(
    conn: &mut SqliteConnection,
    template_id: &str,
    offset: i64,
    clauses: &[ReferenceClause],
) -> Result<()> {
    for (position, clause) in (offset..).zip(clauses) {
        sqlx::query(
            r#"
            INSERT INTO reference_clauses (id, template_id, position, category, clause_item,
                                           standard_text, risk_level)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(template_id)
        .bind(position)
        .bind(&clause.category)
        .bind(&clause.clause_item)
        .bind(&clause.standard_text)
        .bind(&clause.risk_level)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn seed_clauses_locked(
    conn: &mut SqliteConnection,
    template_id: &str,
    clauses: &[ReferenceClause],
) -> Result<bool> {
    let (existing,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM reference_clauses WHERE template_id = ?")
            .bind(template_id)
            .fetch_one(&mut *conn)
            .await?;
    if existing > 0 {
        return Ok(false);
    }
    insert_clause_rows(conn, template_id, 0, clauses).await?;
    Ok(true)
}

async fn claim_batch_locked(conn: &mut SqliteConnection, batch_id: Uuid) -> Result<ClaimOutcome> {
    let Some(batch) = fetch_batch(conn, batch_id).await? else {
        return Err(Error::BatchNotFound(batch_id));
    };

    if batch.status != BatchStatus::Pending {
        return Ok(ClaimOutcome::AlreadyClaimed);
    }

    let mut members = Vec::with_capacity(batch.document_ids.len());
    let mut missing = Vec::new();
    for document_id in &batch.document_ids {
        let row: Option<DocumentRow> = sqlx::query_as(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?"
        ))
        .bind(document_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => members.push(parse_document_row(row)?),
            None => missing.push(*document_id),
        }
    }

    let now = timestamp(Utc::now());

    if !missing.is_empty() {
        let message = format!(
            "member documents no longer exist: {}",
            missing
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        sqlx::query(
            "UPDATE notification_batches SET status = ?, error = ?, updated_at = ?, \
             completed_at = ? WHERE id = ?",
        )
        .bind(BatchStatus::Failed.as_str())
        .bind(message)
        .bind(&now)
        .bind(&now)
        .bind(batch_id.to_string())
        .execute(&mut *conn)
        .await?;
        return Ok(ClaimOutcome::MissingMembers(missing));
    }

    if members.iter().any(|d| !d.processing_status.is_terminal()) {
        return Ok(ClaimOutcome::NotReady);
    }

    sqlx::query("UPDATE notification_batches SET status = ?, updated_at = ? WHERE id = ?")
        .bind(BatchStatus::InProgress.as_str())
        .bind(&now)
        .bind(batch_id.to_string())
        .execute(&mut *conn)
        .await?;

    let batch = NotificationBatch {
        status: BatchStatus::InProgress,
        ..batch
    };
    Ok(ClaimOutcome::Claimed { batch, members })
}

async fn fetch_batch(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<NotificationBatch>> {
    let row: Option<BatchRow> = sqlx::query_as(
        r#"
        SELECT id, email, status, error, created_at, updated_at, completed_at
        FROM notification_batches WHERE id = ?
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let members: Vec<(String,)> = sqlx::query_as(
        "SELECT document_id FROM batch_members WHERE batch_id = ? ORDER BY position",
    )
    .bind(id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    let document_ids = members
        .iter()
        .map(|(id,)| parse_uuid(id))
        .collect::<Result<Vec<_>>>()?;

    parse_batch_row(row, document_ids).map(Some)
}

/// Fixed-width UTC timestamps so stored values sort lexically.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| Error::InvalidInput(format!("corrupt timestamp: {value}")))
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    value
        .parse()
        .map_err(|_| Error::InvalidInput(format!("corrupt id: {value}")))
}

fn parse_or_default<T: serde::de::DeserializeOwned + Default>(raw: &str, what: &str) -> T {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Malformed stored {what}");
        T::default()
    })
}

fn parse_document_row(row: DocumentRow) -> Result<Document> {
    let (
        id,
        content_hash,
        file_name,
        mime_type,
        file_size,
        content,
        status,
        processing_error,
        created_at,
        updated_at,
    ) = row;

    Ok(Document {
        id: parse_uuid(&id)?,
        content_hash,
        file_name,
        mime_type,
        file_size,
        content,
        processing_status: status.parse()?,
        processing_error,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn parse_audit_row(row: AuditRow) -> Result<AuditLogEntry> {
    let (id, document_id, action, source, status, description, duration_ms, metadata, created_at) =
        row;

    Ok(AuditLogEntry {
        id: parse_uuid(&id)?,
        document_id: document_id.and_then(|s| s.parse().ok()),
        action,
        source,
        status,
        description,
        duration_ms,
        metadata,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn parse_template_row(row: (String, String, String, String)) -> Result<Template> {
    let (id, slug, name, created_at) = row;
    Ok(Template {
        id,
        slug,
        name,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn parse_batch_row(row: BatchRow, document_ids: Vec<Uuid>) -> Result<NotificationBatch> {
    let (id, email, status, error, created_at, updated_at, completed_at) = row;

    Ok(NotificationBatch {
        id: parse_uuid(&id)?,
        email,
        document_ids,
        status: status.parse()?,
        error,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(text: &str) -> NewDocument {
        NewDocument::from_bytes(text.as_bytes(), "contract.pdf", "application/pdf", text.into())
    }

    #[tokio::test]
    async fn test_document_upsert_is_idempotent() {
        let storage = Storage::open_memory().await.unwrap();

        let (first, reused) = storage.upsert_document(&upload("hello")).await.unwrap();
        assert!(!reused);
        assert_eq!(first.processing_status, ProcessingStatus::Pending);

        let mut again = upload("hello");
        again.file_name = "renamed.pdf".into();
        let (second, reused) = storage.upsert_document(&again).await.unwrap();
        assert!(reused);
        assert_eq!(second.id, first.id);
        assert_eq!(second.file_name, "renamed.pdf");

        assert_eq!(storage.list_documents().await.unwrap().len(), 1);
        assert!(storage
            .find_document_by_hash(&first.content_hash)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let storage = Storage::open_memory().await.unwrap();
        let (doc, _) = storage.upsert_document(&upload("a")).await.unwrap();

        let won = storage
            .transition_status(
                doc.id,
                ProcessingStatus::Pending,
                ProcessingStatus::ProcessingAnalysis,
                None,
            )
            .await
            .unwrap();
        assert!(won);

        let lost = storage
            .transition_status(
                doc.id,
                ProcessingStatus::Pending,
                ProcessingStatus::ProcessingAnalysis,
                None,
            )
            .await
            .unwrap();
        assert!(!lost);

        let missing = storage
            .transition_status(
                Uuid::now_v7(),
                ProcessingStatus::Pending,
                ProcessingStatus::ProcessingAnalysis,
                None,
            )
            .await;
        assert!(matches!(missing, Err(Error::DocumentNotFound(_))));
    }

    #[tokio::test]
    async fn test_analysis_upsert_replaces() {
        let storage = Storage::open_memory().await.unwrap();
        let (doc, _) = storage.upsert_document(&upload("a")).await.unwrap();

        let now = Utc::now();
        let mut result = AnalysisResult {
            id: Uuid::now_v7(),
            document_id: doc.id,
            results_by_template: BTreeMap::from([("A".to_string(), serde_json::json!({"x": 1}))]),
            selected_template_ids: TemplateSet::new(["A"]),
            reference_clauses: ClauseSnapshot::new(),
            created_at: now,
            updated_at: now,
        };
        storage.upsert_analysis(&result).await.unwrap();

        result.id = Uuid::now_v7();
        result.selected_template_ids = TemplateSet::new(["A", "B"]);
        storage.upsert_analysis(&result).await.unwrap();

        let stored = storage.get_analysis(doc.id).await.unwrap().unwrap();
        assert_eq!(stored.selected_template_ids, TemplateSet::new(["B", "A"]));
        assert_eq!(stored.results_by_template["A"]["x"], 1);
    }

    #[tokio::test]
    async fn test_malformed_analysis_degrades() {
        let storage = Storage::open_memory().await.unwrap();
        let (doc, _) = storage.upsert_document(&upload("a")).await.unwrap();
        let now = timestamp(Utc::now());

        sqlx::query(
            "INSERT INTO analysis_results VALUES (?, ?, 'not json', '{bad', '[]', ?, ?)",
        )
        .bind(Uuid::now_v7().to_string())
        .bind(doc.id.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&storage.pool)
        .await
        .unwrap();

        let stored = storage.get_analysis(doc.id).await.unwrap().unwrap();
        assert!(stored.results_by_template.is_empty());
        assert!(stored.selected_template_ids.is_empty());
    }

    #[tokio::test]
    async fn test_templates_and_clauses() {
        let storage = Storage::open_memory().await.unwrap();

        let template = storage.ensure_template("default", "Default").await.unwrap();
        let again = storage.ensure_template("default", "Other").await.unwrap();
        assert_eq!(template.id, again.id);

        storage
            .insert_reference_clauses(&template.id, &[ReferenceClause::new("c", "i1", "t1")])
            .await
            .unwrap();
        storage
            .insert_reference_clauses(&template.id, &[ReferenceClause::new("c", "i2", "t2")])
            .await
            .unwrap();

        let clauses = storage.reference_clauses(&template.id).await.unwrap();
        assert_eq!(clauses.len(), 2);
        assert_eq!(clauses[1].clause_item, "i2");

        assert!(!storage
            .seed_reference_clauses(&template.id, &[ReferenceClause::new("c", "i3", "t3")])
            .await
            .unwrap());

        let fresh = storage.ensure_template("other", "Other").await.unwrap();
        assert!(storage
            .seed_reference_clauses(&fresh.id, &[ReferenceClause::new("c", "i", "t")])
            .await
            .unwrap());
        assert_eq!(storage.reference_clauses(&fresh.id).await.unwrap().len(), 1);

        assert!(storage.find_template(&template.id).await.unwrap().is_some());
        assert!(storage.find_template("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_service_plans_roundtrip() {
        let storage = Storage::open_memory().await.unwrap();
        let plan = ServicePlan::new("Gold", Some("full cover".into())).with_clause(
            ServicePlanClause {
                category: None,
                clause_item: "Response".into(),
                requirement: "4h".into(),
                notes: None,
            },
        );
        storage.insert_service_plan(&plan).await.unwrap();

        let plans = storage.list_service_plans().await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].id, plan.id);
        assert_eq!(plans[0].clauses.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_claim_outcomes() {
        let storage = Storage::open_memory().await.unwrap();
        let (a, _) = storage.upsert_document(&upload("a")).await.unwrap();
        let (b, _) = storage.upsert_document(&upload("b")).await.unwrap();

        let batch = NotificationBatch::new("ops@example.com", vec![a.id, b.id]);
        storage.insert_batch(&batch).await.unwrap();

        assert_eq!(
            storage.pending_batches_for_document(a.id).await.unwrap(),
            vec![batch.id]
        );
        assert!(matches!(
            storage.claim_batch(batch.id).await.unwrap(),
            ClaimOutcome::NotReady
        ));

        for id in [a.id, b.id] {
            storage
                .transition_status(id, ProcessingStatus::Pending, ProcessingStatus::ProcessingAnalysis, None)
                .await
                .unwrap();
            storage
                .transition_status(id, ProcessingStatus::ProcessingAnalysis, ProcessingStatus::Failed, Some("x"))
                .await
                .unwrap();
        }

        match storage.claim_batch(batch.id).await.unwrap() {
            ClaimOutcome::Claimed { batch, members } => {
                assert_eq!(batch.status, BatchStatus::InProgress);
                assert_eq!(members.len(), 2);
            }
            other => panic!("expected claim, got {other:?}"),
        }
        assert!(matches!(
            storage.claim_batch(batch.id).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        ));

        storage.complete_batch(batch.id).await.unwrap();
        let stored = storage.get_batch(batch.id).await.unwrap();
        assert_eq!(stored.status, BatchStatus::Completed);
        assert!(stored.completed_at.is_some());
        assert!(storage
            .pending_batches_for_document(a.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_failed_claim_releases_connection() {
        let storage = Storage::open_memory().await.unwrap();

        for _ in 0..2 {
            assert!(matches!(
                storage.claim_batch(Uuid::now_v7()).await,
                Err(Error::BatchNotFound(_))
            ));
        }

        let (a, _) = storage.upsert_document(&upload("a")).await.unwrap();
        let batch = NotificationBatch::new("ops@example.com", vec![a.id]);
        storage.insert_batch(&batch).await.unwrap();
        assert!(matches!(
            storage.claim_batch(batch.id).await.unwrap(),
            ClaimOutcome::NotReady
        ));
    }

    #[tokio::test]
    async fn test_batch_with_missing_member_fails() {
        let storage = Storage::open_memory().await.unwrap();
        let ghost = Uuid::now_v7();
        let batch = NotificationBatch::new("ops@example.com", vec![ghost]);
        storage.insert_batch(&batch).await.unwrap();

        let outcome = storage.claim_batch(batch.id).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::MissingMembers(ref ids) if ids == &[ghost]));

        let stored = storage.get_batch(batch.id).await.unwrap();
        assert_eq!(stored.status, BatchStatus::Failed);
        assert!(stored.error.unwrap().contains(&ghost.to_string()));
    }

    #[tokio::test]
    async fn test_stale_documents_oldest_first() {
        let storage = Storage::open_memory().await.unwrap();
        let (a, _) = storage.upsert_document(&upload("a")).await.unwrap();
        let (b, _) = storage.upsert_document(&upload("b")).await.unwrap();

        let future = Utc::now() + chrono::Duration::minutes(1);
        let stale = storage.list_stale_documents(future, 10).await.unwrap();
        assert_eq!(stale.iter().map(|d| d.id).collect::<Vec<_>>(), vec![a.id, b.id]);

        let past = Utc::now() - chrono::Duration::minutes(5);
        assert!(storage.list_stale_documents(past, 10).await.unwrap().is_empty());
        assert_eq!(storage.list_active_documents().await.unwrap().len(), 2);
    }
}
