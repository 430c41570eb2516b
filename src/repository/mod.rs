//! Repository layer for SQLite persistence.
//!
//! Repositories own the database path and open short-lived connections per
//! operation. JSON-shaped columns (`links`, `documents`, summaries, details)
//! stay opaque at this boundary and are (de)serialized with `serde_json`.

pub mod history;
pub mod process;
pub mod schedule;
pub mod sysconfig;
pub mod task;
pub mod tenant;

pub use history::DocumentHistoryRepository;
pub use process::ProcessRepository;
pub use schedule::ScheduleRepository;
pub use sysconfig::SystemConfigRepository;
pub use task::TaskRepository;
pub use tenant::TenantRepository;

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Open a connection with the pragmas every repository relies on.
pub fn connect(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

/// Create every table. Idempotent; called by `init` and by tests.
pub fn init_schema(db_path: &Path) -> Result<()> {
    let conn = connect(db_path)?;
    tenant::init_schema(&conn)?;
    process::init_schema(&conn)?;
    history::init_schema(&conn)?;
    task::init_schema(&conn)?;
    schedule::init_schema(&conn)?;
    sysconfig::init_schema(&conn)?;
    Ok(())
}

/// Parse a datetime string from the database, defaulting to the Unix epoch.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse an optional datetime string from the database.
pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Map `QueryReturnedNoRows` to `None`.
pub fn to_option<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
