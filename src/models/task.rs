//! Background task rows: extraction runs and document downloads.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a background task. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

/// Aggregated counters reported by an extraction run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionSummary {
    pub discovered: usize,
    pub new_processes: usize,
    pub updated_processes: usize,
    pub new_documents: usize,
    pub failures: usize,
}

/// One extraction run against a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionTask {
    pub id: String,
    pub tenant_id: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Percentage in `[0, 100]`.
    pub progress: u8,
    pub result_summary: Option<ExtractionSummary>,
    pub error_message: Option<String>,
}

impl ExtractionTask {
    pub fn new(tenant_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            status: TaskStatus::Pending,
            started_at: None,
            finished_at: None,
            progress: 0,
            result_summary: None,
            error_message: None,
        }
    }
}

/// Per-document result inside a download task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOutcome {
    pub uploaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Which documents a download task was asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedDocuments {
    /// Everything with a status in `{not_downloaded, error, partial}`.
    All,
    Subset(Vec<String>),
}

/// One download run against a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: String,
    pub process_id: String,
    pub status: TaskStatus,
    pub requested_documents: RequestedDocuments,
    pub results: BTreeMap<String, DownloadOutcome>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DownloadTask {
    pub fn new(process_id: &str, requested: RequestedDocuments) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            process_id: process_id.to_string(),
            status: TaskStatus::Pending,
            requested_documents: requested,
            results: BTreeMap::new(),
            started_at: None,
            finished_at: None,
        }
    }
}
