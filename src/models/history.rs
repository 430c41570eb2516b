//! Append-only audit trail of document download attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::process::DocumentStatus;

/// One audited action against a document. Rows are never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentHistory {
    pub id: String,
    pub process_id: String,
    pub document_number: String,
    pub action: String,
    pub new_status: Option<DocumentStatus>,
    pub timestamp: DateTime<Utc>,
    /// Timing breakdown and context; see [`HistoryDetails`].
    pub details: serde_json::Value,
}

impl DocumentHistory {
    pub fn download_attempt(
        process_id: &str,
        document_number: &str,
        new_status: DocumentStatus,
        details: &HistoryDetails,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            process_id: process_id.to_string(),
            document_number: document_number.to_string(),
            action: "download".to_string(),
            new_status: Some(new_status),
            timestamp: Utc::now(),
            details: serde_json::to_value(details).unwrap_or_default(),
        }
    }
}

/// Outcome label stored inside the details payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    /// Downloaded but not uploaded.
    PartialSuccess,
    Failure,
}

/// Detail payload of a download attempt, with the legacy timing breakdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryDetails {
    pub process_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_nickname: Option<String>,
    pub document_type: String,
    pub document_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_finished: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_finished: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AttemptOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
