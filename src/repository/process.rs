//! Process repository.
//!
//! Each per-process upsert runs in its own `BEGIN IMMEDIATE` transaction so a
//! failing process never takes down the rest of the run, and two workers
//! visiting the same process through different links merge serially.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use serde::Deserialize;

use super::{connect, parse_datetime, to_option};
use crate::error::Result;
use crate::models::{
    legacy_timestamp, AccessType, CategoryStatus, DocumentStatus, Process, VisitOutcome,
};

pub(super) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS processes (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
            process_number TEXT NOT NULL,
            links TEXT NOT NULL DEFAULT '{}',
            documents TEXT NOT NULL DEFAULT '{}',
            access_type TEXT,
            best_current_link TEXT,
            category TEXT,
            category_status TEXT,
            authority TEXT,
            unit TEXT,
            nickname TEXT,
            no_valid_links INTEGER NOT NULL DEFAULT 0,
            last_updated TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(tenant_id, process_number)
        );
        CREATE INDEX IF NOT EXISTS idx_processes_tenant ON processes(tenant_id);
        CREATE INDEX IF NOT EXISTS idx_processes_number ON processes(process_number);
        CREATE INDEX IF NOT EXISTS idx_processes_authority ON processes(authority);
        "#,
    )?;
    Ok(())
}

/// Result of merging a visit into the stored row.
#[derive(Debug)]
pub struct VisitMerge {
    pub process: Process,
    /// Document numbers newly discovered (or re-surfaced after an error).
    pub new_documents: Vec<String>,
    /// Whether the process row was created by this merge.
    pub created: bool,
}

/// Operator-editable fields, accepted from the API boundary. The legacy
/// capitalized spelling of `authority` is accepted on input only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessPatch {
    pub category: Option<String>,
    pub category_status: Option<CategoryStatus>,
    pub nickname: Option<String>,
    #[serde(alias = "Authority")]
    pub authority: Option<String>,
}

/// SQLite-backed process repository.
pub struct ProcessRepository {
    db_path: PathBuf,
}

impl ProcessRepository {
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

    fn row_to_process(row: &rusqlite::Row<'_>) -> rusqlite::Result<Process> {
        Ok(Process {
            id: row.get("id")?,
            tenant_id: row.get("tenant_id")?,
            process_number: row.get("process_number")?,
            links: serde_json::from_str(&row.get::<_, String>("links")?).unwrap_or_default(),
            documents: serde_json::from_str(&row.get::<_, String>("documents")?)
                .unwrap_or_default(),
            access_type: row
                .get::<_, Option<String>>("access_type")?
                .as_deref()
                .and_then(AccessType::from_str),
            best_current_link: row.get("best_current_link")?,
            category: row.get("category")?,
            category_status: row
                .get::<_, Option<String>>("category_status")?
                .as_deref()
                .and_then(CategoryStatus::from_str),
            authority: row.get("authority")?,
            unit: row.get("unit")?,
            nickname: row.get("nickname")?,
            no_valid_links: row.get("no_valid_links")?,
            last_updated: row.get("last_updated")?,
            created_at: parse_datetime(&row.get::<_, String>("created_at")?),
            updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
        })
    }

    fn write_process(conn: &Connection, process: &Process) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO processes (id, tenant_id, process_number, links, documents,
                                   access_type, best_current_link, category, category_status,
                                   authority, unit, nickname, no_valid_links, last_updated,
                                   created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(tenant_id, process_number) DO UPDATE SET
                links = excluded.links,
                documents = excluded.documents,
                access_type = excluded.access_type,
                best_current_link = excluded.best_current_link,
                category = excluded.category,
                category_status = excluded.category_status,
                authority = excluded.authority,
                unit = excluded.unit,
                nickname = excluded.nickname,
                no_valid_links = excluded.no_valid_links,
                last_updated = excluded.last_updated,
                updated_at = excluded.updated_at
            "#,
            params![
                process.id,
                process.tenant_id,
                process.process_number,
                serde_json::to_string(&process.links)?,
                serde_json::to_string(&process.documents)?,
                process.access_type.map(|a| a.as_str()),
                process.best_current_link,
                process.category,
                process.category_status.map(|s| s.as_str()),
                process.authority,
                process.unit,
                process.nickname,
                process.no_valid_links,
                process.last_updated,
                process.created_at.to_rfc3339(),
                process.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Process>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM processes WHERE id = ?")?;
        to_option(stmt.query_row(params![id], Self::row_to_process))
    }

    pub fn get_by_number(&self, tenant_id: &str, process_number: &str) -> Result<Option<Process>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT * FROM processes WHERE tenant_id = ? AND process_number = ?")?;
        to_option(stmt.query_row(params![tenant_id, process_number], Self::row_to_process))
    }

    pub fn get_all_by_tenant(&self, tenant_id: &str) -> Result<Vec<Process>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT * FROM processes WHERE tenant_id = ? ORDER BY process_number")?;
        let processes = stmt
            .query_map(params![tenant_id], Self::row_to_process)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(processes)
    }

    /// Known process numbers for the discovery join.
    pub fn known_numbers(&self, tenant_id: &str) -> Result<std::collections::HashSet<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT process_number FROM processes WHERE tenant_id = ?")?;
        let numbers = stmt
            .query_map(params![tenant_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(numbers)
    }

    pub fn save(&self, process: &Process) -> Result<()> {
        let conn = self.connect()?;
        Self::write_process(&conn, process)
    }

    /// Merge one worker visit into the stored row, atomically.
    ///
    /// The read-merge-write runs under `BEGIN IMMEDIATE` so two workers
    /// finishing the same process through different links serialize instead
    /// of losing updates.
    pub fn apply_visit(
        &self,
        tenant_id: &str,
        process_number: &str,
        visit: &VisitOutcome,
    ) -> Result<VisitMerge> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| {
            let existing = to_option(
                conn.query_row(
                    "SELECT * FROM processes WHERE tenant_id = ? AND process_number = ?",
                    params![tenant_id, process_number],
                    Self::row_to_process,
                ),
            )?;

            let created = existing.is_none();
            let mut process =
                existing.unwrap_or_else(|| Process::new(tenant_id, process_number));
            let new_documents = process.apply_visit(visit);

            Self::write_process(&conn, &process)?;
            Ok(VisitMerge {
                process,
                new_documents,
                created,
            })
        })();

        match result {
            Ok(merge) => {
                conn.execute("COMMIT", [])?;
                Ok(merge)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Update one document's status inside the JSON column, atomically.
    pub fn set_document_status(
        &self,
        process_id: &str,
        document_number: &str,
        status: DocumentStatus,
    ) -> Result<bool> {
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| {
            let existing = to_option(conn.query_row(
                "SELECT * FROM processes WHERE id = ?",
                params![process_id],
                Self::row_to_process,
            ))?;

            let Some(mut process) = existing else {
                return Ok(false);
            };
            let Some(record) = process.documents.get_mut(document_number) else {
                return Ok(false);
            };

            let now = chrono::Utc::now();
            record.status = status;
            record.last_checked = legacy_timestamp(now);
            process.updated_at = now;
            Self::write_process(&conn, &process)?;
            Ok(true)
        })();

        match result {
            Ok(updated) => {
                conn.execute("COMMIT", [])?;
                Ok(updated)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Apply operator edits. Only fields present in the patch change.
    pub fn apply_patch(&self, process_id: &str, patch: &ProcessPatch) -> Result<bool> {
        let conn = self.connect()?;
        let Some(mut process) = to_option(conn.query_row(
            "SELECT * FROM processes WHERE id = ?",
            params![process_id],
            Self::row_to_process,
        ))?
        else {
            return Ok(false);
        };

        if let Some(category) = &patch.category {
            process.category = Some(category.clone());
        }
        if let Some(status) = patch.category_status {
            process.category_status = Some(status);
        }
        if let Some(nickname) = &patch.nickname {
            process.nickname = Some(nickname.clone());
        }
        if let Some(authority) = &patch.authority {
            process.authority = Some(authority.clone());
        }
        process.updated_at = chrono::Utc::now();
        Self::write_process(&conn, &process)?;
        Ok(true)
    }

    /// Nicknames for the notification digest, keyed by process number.
    pub fn nicknames_by_number(&self, tenant_id: &str) -> Result<BTreeMap<String, String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT process_number, nickname FROM processes
             WHERE tenant_id = ? AND nickname IS NOT NULL",
        )?;
        let pairs = stmt
            .query_map(params![tenant_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LinkResult, LinkStatus, ObservedDocument, Tenant};
    use crate::repository::TenantRepository;

    fn setup() -> (ProcessRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        super::super::init_schema(&db).unwrap();
        TenantRepository::new(&db)
            .unwrap()
            .save(&Tenant::new("t1", "T", "https://x", "4.2.0"))
            .unwrap();
        (ProcessRepository::new(&db).unwrap(), dir)
    }

    fn integral_visit(link_id: &str, docs: Vec<ObservedDocument>) -> VisitOutcome {
        VisitOutcome {
            link_results: vec![LinkResult {
                link_id: link_id.to_string(),
                status: LinkStatus::Active,
                access: Some(AccessType::Integral),
            }],
            authority: Some("Dr. Silva".to_string()),
            unit: None,
            documents: Some(docs),
            checked_at: Some(chrono::Utc::now()),
        }
    }

    fn order_doc(number: &str) -> ObservedDocument {
        ObservedDocument {
            number: number.to_string(),
            doc_type: "Order".to_string(),
            date: "01/07/2024".to_string(),
            signer: None,
        }
    }

    #[test]
    fn apply_visit_creates_then_updates() {
        let (repo, _dir) = setup();
        let number = "12345.001234/2024-56";

        let merge = repo
            .apply_visit("t1", number, &integral_visit("ABC", vec![order_doc("10000001")]))
            .unwrap();
        assert!(merge.created);
        assert_eq!(merge.new_documents, vec!["10000001"]);

        let merge = repo
            .apply_visit("t1", number, &integral_visit("ABC", vec![order_doc("10000001")]))
            .unwrap();
        assert!(!merge.created);
        assert!(merge.new_documents.is_empty());

        let stored = repo.get_by_number("t1", number).unwrap().unwrap();
        assert_eq!(stored.access_type, Some(AccessType::Integral));
        assert_eq!(stored.links["ABC"].history.len(), 2);
        assert_eq!(stored.documents.len(), 1);
    }

    #[test]
    fn unique_per_tenant_number() {
        let (repo, _dir) = setup();
        let number = "12345.001234/2024-56";
        repo.apply_visit("t1", number, &integral_visit("ABC", vec![]))
            .unwrap();
        repo.apply_visit("t1", number, &integral_visit("DEF", vec![]))
            .unwrap();
        assert_eq!(repo.get_all_by_tenant("t1").unwrap().len(), 1);
    }

    #[test]
    fn set_document_status_roundtrip() {
        let (repo, _dir) = setup();
        let number = "12345.001234/2024-56";
        let merge = repo
            .apply_visit("t1", number, &integral_visit("ABC", vec![order_doc("10000001")]))
            .unwrap();

        assert!(repo
            .set_document_status(&merge.process.id, "10000001", DocumentStatus::Downloaded)
            .unwrap());
        let stored = repo.get_by_id(&merge.process.id).unwrap().unwrap();
        assert_eq!(
            stored.documents["10000001"].status,
            DocumentStatus::Downloaded
        );

        assert!(!repo
            .set_document_status(&merge.process.id, "99999999", DocumentStatus::Downloaded)
            .unwrap());
        assert!(!repo
            .set_document_status("missing", "10000001", DocumentStatus::Downloaded)
            .unwrap());
    }

    #[test]
    fn patch_edits_survive_next_visit() {
        let (repo, _dir) = setup();
        let number = "12345.001234/2024-56";
        let merge = repo
            .apply_visit("t1", number, &integral_visit("ABC", vec![]))
            .unwrap();

        let patch = ProcessPatch {
            nickname: Some("land dispute".to_string()),
            ..Default::default()
        };
        assert!(repo.apply_patch(&merge.process.id, &patch).unwrap());

        repo.apply_visit("t1", number, &integral_visit("ABC", vec![]))
            .unwrap();
        let stored = repo.get_by_number("t1", number).unwrap().unwrap();
        assert_eq!(stored.nickname.as_deref(), Some("land dispute"));
    }

    #[test]
    fn patch_accepts_legacy_authority_spelling() {
        let patch: ProcessPatch =
            serde_json::from_str(r#"{ "Authority": "Dr. Souza" }"#).unwrap();
        assert_eq!(patch.authority.as_deref(), Some("Dr. Souza"));

        let patch: ProcessPatch =
            serde_json::from_str(r#"{ "authority": "Dr. Souza" }"#).unwrap();
        assert_eq!(patch.authority.as_deref(), Some("Dr. Souza"));
    }

    #[test]
    fn tenant_delete_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        super::super::init_schema(&db).unwrap();
        let tenants = TenantRepository::new(&db).unwrap();
        tenants
            .save(&Tenant::new("t1", "T", "https://x", "4.2.0"))
            .unwrap();

        let repo = ProcessRepository::new(&db).unwrap();
        repo.apply_visit("t1", "12345.001234/2024-56", &integral_visit("ABC", vec![]))
            .unwrap();
        assert_eq!(repo.get_all_by_tenant("t1").unwrap().len(), 1);

        tenants.delete("t1").unwrap();
        assert!(repo.get_all_by_tenant("t1").unwrap().is_empty());
    }
}
