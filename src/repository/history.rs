//! Document history repository. Append-only.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};

use super::{connect, parse_datetime};
use crate::error::Result;
use crate::models::{DocumentHistory, DocumentStatus};

pub(super) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS document_history (
            id TEXT PRIMARY KEY,
            process_id TEXT NOT NULL REFERENCES processes(id) ON DELETE CASCADE,
            document_number TEXT NOT NULL,
            action TEXT NOT NULL,
            new_status TEXT,
            timestamp TEXT NOT NULL,
            details TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_history_process ON document_history(process_id);
        "#,
    )?;
    Ok(())
}

/// SQLite-backed document history repository.
pub struct DocumentHistoryRepository {
    db_path: PathBuf,
}

impl DocumentHistoryRepository {
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

    fn row_to_history(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentHistory> {
        Ok(DocumentHistory {
            id: row.get("id")?,
            process_id: row.get("process_id")?,
            document_number: row.get("document_number")?,
            action: row.get("action")?,
            new_status: row
                .get::<_, Option<String>>("new_status")?
                .as_deref()
                .and_then(DocumentStatus::from_str),
            timestamp: parse_datetime(&row.get::<_, String>("timestamp")?),
            details: serde_json::from_str(&row.get::<_, String>("details")?).unwrap_or_default(),
        })
    }

    pub fn append(&self, entry: &DocumentHistory) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO document_history (id, process_id, document_number, action,
                                          new_status, timestamp, details)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                entry.id,
                entry.process_id,
                entry.document_number,
                entry.action,
                entry.new_status.map(|s| s.as_str()),
                entry.timestamp.to_rfc3339(),
                serde_json::to_string(&entry.details)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_for_document(
        &self,
        process_id: &str,
        document_number: &str,
    ) -> Result<Vec<DocumentHistory>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM document_history
             WHERE process_id = ? AND document_number = ?
             ORDER BY timestamp",
        )?;
        let rows = stmt
            .query_map(params![process_id, document_number], Self::row_to_history)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of rows recording the given resulting status for a document.
    pub fn count_with_status(
        &self,
        process_id: &str,
        document_number: &str,
        status: DocumentStatus,
    ) -> Result<i64> {
        let conn = self.connect()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM document_history
             WHERE process_id = ? AND document_number = ? AND new_status = ?",
            params![process_id, document_number, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
