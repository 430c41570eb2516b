//! Extraction schedule repository. Zero-or-one row per tenant.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};

use super::{connect, to_option};
use crate::error::Result;
use crate::models::{ExtractionSchedule, ScheduleKind};

pub(super) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS extraction_schedules (
            tenant_id TEXT PRIMARY KEY REFERENCES tenants(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            expression TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1
        );
        "#,
    )?;
    Ok(())
}

/// SQLite-backed schedule repository.
pub struct ScheduleRepository {
    db_path: PathBuf,
}

impl ScheduleRepository {
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

    fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExtractionSchedule> {
        Ok(ExtractionSchedule {
            tenant_id: row.get("tenant_id")?,
            kind: ScheduleKind::from_str(&row.get::<_, String>("kind")?)
                .unwrap_or(ScheduleKind::Interval),
            expression: row.get("expression")?,
            is_active: row.get("is_active")?,
        })
    }

    /// Insert or replace the tenant's schedule. The expression is validated
    /// before anything is written.
    pub fn upsert(&self, schedule: &ExtractionSchedule) -> Result<()> {
        schedule.validate()?;
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO extraction_schedules (tenant_id, kind, expression, is_active)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(tenant_id) DO UPDATE SET
                kind = excluded.kind,
                expression = excluded.expression,
                is_active = excluded.is_active
            "#,
            params![
                schedule.tenant_id,
                schedule.kind.as_str(),
                schedule.expression,
                schedule.is_active,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, tenant_id: &str) -> Result<Option<ExtractionSchedule>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM extraction_schedules WHERE tenant_id = ?")?;
        to_option(stmt.query_row(params![tenant_id], Self::row_to_schedule))
    }

    pub fn get_all_active(&self) -> Result<Vec<ExtractionSchedule>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT * FROM extraction_schedules WHERE is_active = 1 ORDER BY tenant_id")?;
        let schedules = stmt
            .query_map([], Self::row_to_schedule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(schedules)
    }

    pub fn set_active(&self, tenant_id: &str, is_active: bool) -> Result<bool> {
        let conn = self.connect()?;
        let rows = conn.execute(
            "UPDATE extraction_schedules SET is_active = ? WHERE tenant_id = ?",
            params![is_active, tenant_id],
        )?;
        Ok(rows > 0)
    }

    pub fn delete(&self, tenant_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let rows = conn.execute(
            "DELETE FROM extraction_schedules WHERE tenant_id = ?",
            params![tenant_id],
        )?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tenant;
    use crate::repository::TenantRepository;

    fn setup() -> (ScheduleRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        super::super::init_schema(&db).unwrap();
        let tenants = TenantRepository::new(&db).unwrap();
        tenants
            .save(&Tenant::new("t1", "T", "https://x", "4.2.0"))
            .unwrap();
        tenants
            .save(&Tenant::new("t2", "T2", "https://y", "4.2.0"))
            .unwrap();
        (ScheduleRepository::new(&db).unwrap(), dir)
    }

    fn interval(tenant_id: &str, expression: &str, is_active: bool) -> ExtractionSchedule {
        ExtractionSchedule {
            tenant_id: tenant_id.to_string(),
            kind: ScheduleKind::Interval,
            expression: expression.to_string(),
            is_active,
        }
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let (repo, _dir) = setup();
        repo.upsert(&interval("t1", "30m", true)).unwrap();
        repo.upsert(&interval("t1", "1h", true)).unwrap();

        let stored = repo.get("t1").unwrap().unwrap();
        assert_eq!(stored.expression, "1h");
        assert_eq!(repo.get_all_active().unwrap().len(), 1);
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let (repo, _dir) = setup();
        assert!(repo.upsert(&interval("t1", "nonsense", true)).is_err());
        assert!(repo.get("t1").unwrap().is_none());
    }

    #[test]
    fn active_filter() {
        let (repo, _dir) = setup();
        repo.upsert(&interval("t1", "30m", true)).unwrap();
        repo.upsert(&interval("t2", "30m", false)).unwrap();

        let active = repo.get_all_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].tenant_id, "t1");

        assert!(repo.set_active("t1", false).unwrap());
        assert!(repo.get_all_active().unwrap().is_empty());
        assert!(!repo.set_active("missing", true).unwrap());
    }
}
