//! Task repository: durable mirror of extraction and download tasks.
//!
//! In-memory task state is authoritative while a task runs; these rows keep
//! the record across restarts and back the "at most one live extraction per
//! tenant" check.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};

use super::{connect, parse_datetime_opt, to_option};
use crate::error::Result;
use crate::models::{
    DownloadTask, ExtractionSummary, ExtractionTask, RequestedDocuments, TaskStatus,
};

pub(super) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS extraction_tasks (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
            status TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            progress INTEGER NOT NULL DEFAULT 0,
            result_summary TEXT,
            error_message TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_extraction_tasks_tenant ON extraction_tasks(tenant_id, status);

        CREATE TABLE IF NOT EXISTS download_tasks (
            id TEXT PRIMARY KEY,
            process_id TEXT NOT NULL REFERENCES processes(id) ON DELETE CASCADE,
            status TEXT NOT NULL,
            requested_documents TEXT NOT NULL,
            results TEXT NOT NULL DEFAULT '{}',
            started_at TEXT,
            finished_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_download_tasks_process ON download_tasks(process_id, status);
        "#,
    )?;
    Ok(())
}

/// SQLite-backed task repository.
pub struct TaskRepository {
    db_path: PathBuf,
}

impl TaskRepository {
    pub fn new(db_path: &Path) -> Result<Self> {
        let repo = Self {
            db_path: db_path.to_path_buf(),
        };
        init_schema(&repo.connect()?)?;
        Ok(repo)
    }

    fn connect(&self) -> Result<Connection> {
        connect(&self.db_path)
    }

    fn row_to_extraction(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExtractionTask> {
        Ok(ExtractionTask {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            status: TaskStatus::from_str(&row.get::<_, String>("status")?)
                .unwrap_or(TaskStatus::Failed),
            started_at: parse_datetime_opt(row.get("started_at")?),
            finished_at: parse_datetime_opt(row.get("finished_at")?),
            progress: row.get::<_, i64>("progress")?.clamp(0, 100) as u8,
            result_summary: row
                .get::<_, Option<String>>("result_summary")?
                .and_then(|s| serde_json::from_str(&s).ok()),
            error_message: row.get("error_message")?,
        })
    }

    fn row_to_download(row: &rusqlite::Row<'_>) -> rusqlite::Result<DownloadTask> {
        Ok(DownloadTask {
            id: row.get("id")?,
            process_id: row.get("process_id")?,
            status: TaskStatus::from_str(&row.get::<_, String>("status")?)
                .unwrap_or(TaskStatus::Failed),
            requested_documents: serde_json::from_str(
                &row.get::<_, String>("requested_documents")?,
            )
            .unwrap_or(RequestedDocuments::All),
            results: serde_json::from_str(&row.get::<_, String>("results")?).unwrap_or_default(),
            started_at: parse_datetime_opt(row.get("started_at")?),
            finished_at: parse_datetime_opt(row.get("finished_at")?),
        })
    }

    pub fn save_extraction(&self, task: &ExtractionTask) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO extraction_tasks (id, tenant_id, status, started_at, finished_at,
                                          progress, result_summary, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                progress = excluded.progress,
                result_summary = excluded.result_summary,
                error_message = excluded.error_message
            "#,
            params![
                task.id,
                task.tenant_id,
                task.status.as_str(),
                task.started_at.map(|t| t.to_rfc3339()),
                task.finished_at.map(|t| t.to_rfc3339()),
                task.progress as i64,
                task.result_summary
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                task.error_message,
            ],
        )?;
        Ok(())
    }

    pub fn get_extraction(&self, id: &str) -> Result<Option<ExtractionTask>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM extraction_tasks WHERE id = ?")?;
        to_option(stmt.query_row(params![id], Self::row_to_extraction))
    }

    /// The live (pending or running) extraction for a tenant, if any.
    pub fn live_extraction_for_tenant(&self, tenant_id: &str) -> Result<Option<ExtractionTask>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM extraction_tasks
             WHERE tenant_id = ? AND status IN ('pending', 'running')
             ORDER BY started_at DESC LIMIT 1",
        )?;
        to_option(stmt.query_row(params![tenant_id], Self::row_to_extraction))
    }

    pub fn recent_extractions(&self, tenant_id: &str, limit: usize) -> Result<Vec<ExtractionTask>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM extraction_tasks WHERE tenant_id = ?
             ORDER BY COALESCE(started_at, '') DESC LIMIT ?",
        )?;
        let tasks = stmt
            .query_map(params![tenant_id, limit as i64], Self::row_to_extraction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    pub fn save_download(&self, task: &DownloadTask) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO download_tasks (id, process_id, status, requested_documents,
                                        results, started_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                requested_documents = excluded.requested_documents,
                results = excluded.results,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at
            "#,
            params![
                task.id,
                task.process_id,
                task.status.as_str(),
                serde_json::to_string(&task.requested_documents)?,
                serde_json::to_string(&task.results)?,
                task.started_at.map(|t| t.to_rfc3339()),
                task.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_download(&self, id: &str) -> Result<Option<DownloadTask>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM download_tasks WHERE id = ?")?;
        to_option(stmt.query_row(params![id], Self::row_to_download))
    }

    /// Startup sweep: any task still `running` was orphaned by a crash or
    /// restart and transitions to `failed`.
    pub fn fail_orphaned_running(&self) -> Result<usize> {
        let conn = self.connect()?;
        let now = chrono::Utc::now().to_rfc3339();
        let extractions = conn.execute(
            "UPDATE extraction_tasks
             SET status = 'failed', error_message = 'orphaned', finished_at = ?
             WHERE status = 'running'",
            params![now],
        )?;
        let downloads = conn.execute(
            "UPDATE download_tasks
             SET status = 'failed', finished_at = ?
             WHERE status = 'running'",
            params![now],
        )?;
        Ok(extractions + downloads)
    }
}
