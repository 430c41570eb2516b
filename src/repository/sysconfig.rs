//! System configuration key/value bag.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};

use super::{connect, to_option};
use crate::error::Result;

/// Key holding the notification recipient list (JSON array of addresses).
pub const NOTIFICATION_RECIPIENTS_KEY: &str = "notification_recipients";

pub(super) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS system_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

/// SQLite-backed system configuration repository.
pub struct SystemConfigRepository {
    db_path: PathBuf,
}

impl SystemConfigRepository {
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

    pub fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.connect()?;
        let raw = to_option(conn.query_row(
            "SELECT value FROM system_config WHERE key = ?",
            params![key],
            |row| row.get::<_, String>(0),
        ))?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    pub fn set(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO system_config (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![
                key,
                serde_json::to_string(value)?,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Notification recipients, or an empty list when unset.
    pub fn notification_recipients(&self) -> Result<Vec<String>> {
        let value = self.get(NOTIFICATION_RECIPIENTS_KEY)?;
        Ok(value
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (SystemConfigRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        super::super::init_schema(&db).unwrap();
        (SystemConfigRepository::new(&db).unwrap(), dir)
    }

    #[test]
    fn get_set_roundtrip() {
        let (repo, _dir) = setup();
        assert!(repo.get("missing").unwrap().is_none());

        repo.set("retention_days", &serde_json::json!(30)).unwrap();
        assert_eq!(repo.get("retention_days").unwrap(), Some(serde_json::json!(30)));

        repo.set("retention_days", &serde_json::json!(60)).unwrap();
        assert_eq!(repo.get("retention_days").unwrap(), Some(serde_json::json!(60)));
    }

    #[test]
    fn recipients_default_to_empty() {
        let (repo, _dir) = setup();
        assert!(repo.notification_recipients().unwrap().is_empty());

        repo.set(
            NOTIFICATION_RECIPIENTS_KEY,
            &serde_json::json!(["ops@example.com"]),
        )
        .unwrap();
        assert_eq!(
            repo.notification_recipients().unwrap(),
            vec!["ops@example.com"]
        );
    }
}
