//! Tenant repository.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};

use super::{connect, parse_datetime, to_option};
use crate::error::Result;
use crate::models::Tenant;

pub(super) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            upstream_url TEXT NOT NULL,
            scraper_version TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            encrypted_credentials BLOB,
            extra_metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

/// SQLite-backed tenant repository.
pub struct TenantRepository {
    db_path: PathBuf,
}

impl TenantRepository {
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

    fn row_to_tenant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
        Ok(Tenant {
            id: row.get("id")?,
            name: row.get("name")?,
            upstream_url: row.get("upstream_url")?,
            scraper_version: row.get("scraper_version")?,
            is_active: row.get("is_active")?,
            encrypted_credentials: row.get("encrypted_credentials")?,
            extra_metadata: serde_json::from_str(&row.get::<_, String>("extra_metadata")?)
                .unwrap_or_default(),
            created_at: parse_datetime(&row.get::<_, String>("created_at")?),
            updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Tenant>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM tenants WHERE id = ?")?;
        to_option(stmt.query_row(params![id], Self::row_to_tenant))
    }

    pub fn get_all(&self) -> Result<Vec<Tenant>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM tenants ORDER BY id")?;
        let tenants = stmt
            .query_map([], Self::row_to_tenant)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tenants)
    }

    pub fn save(&self, tenant: &Tenant) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO tenants (id, name, upstream_url, scraper_version, is_active,
                                 encrypted_credentials, extra_metadata, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                upstream_url = excluded.upstream_url,
                scraper_version = excluded.scraper_version,
                is_active = excluded.is_active,
                encrypted_credentials = excluded.encrypted_credentials,
                extra_metadata = excluded.extra_metadata,
                updated_at = excluded.updated_at
            "#,
            params![
                tenant.id,
                tenant.name,
                tenant.upstream_url,
                tenant.scraper_version,
                tenant.is_active,
                tenant.encrypted_credentials,
                serde_json::to_string(&tenant.extra_metadata)?,
                tenant.created_at.to_rfc3339(),
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Store a freshly encrypted credential payload.
    pub fn set_credentials(&self, id: &str, encrypted: &[u8]) -> Result<bool> {
        let conn = self.connect()?;
        let rows = conn.execute(
            "UPDATE tenants SET encrypted_credentials = ?, updated_at = ? WHERE id = ?",
            params![encrypted, chrono::Utc::now().to_rfc3339(), id],
        )?;
        Ok(rows > 0)
    }

    /// Delete a tenant. Processes, tasks, and schedules cascade through
    /// foreign keys.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let rows = conn.execute("DELETE FROM tenants WHERE id = ?", params![id])?;
        Ok(rows > 0)
    }
}
