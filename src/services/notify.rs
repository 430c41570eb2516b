//! Post-run notification dispatch.
//!
//! The extractor reports two snapshot-based digests after every run: the
//! processes sitting in pending categorization, and the new documents found,
//! grouped by signer. Transport (email, webhooks) lives outside the core;
//! the default sink writes structured log events and the recipient list is
//! read from system configuration.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::info;

/// A process awaiting manual categorization, with the link operators use to
/// reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCategorization {
    pub process_number: String,
    pub link_id: Option<String>,
}

/// New documents discovered on one process, grouped by signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDocumentsDigest {
    pub process_number: String,
    pub nickname: Option<String>,
    pub documents_by_signer: BTreeMap<String, Vec<String>>,
}

/// Signer bucket for documents without an identified signer.
pub const UNKNOWN_SIGNER: &str = "Unidentified signer";

/// Where run digests are delivered.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn pending_categorization(&self, tenant_id: &str, items: &[PendingCategorization]);

    async fn new_documents(&self, tenant_id: &str, digests: &[NewDocumentsDigest]);
}

/// Sink that records digests as structured log events.
#[derive(Default)]
pub struct LogSink {
    recipients: Vec<String>,
}

impl LogSink {
    pub fn new(recipients: Vec<String>) -> Self {
        Self { recipients }
    }
}

#[async_trait]
impl NotificationSink for LogSink {
    async fn pending_categorization(&self, tenant_id: &str, items: &[PendingCategorization]) {
        if items.is_empty() {
            return;
        }
        let numbers: Vec<&str> = items.iter().map(|i| i.process_number.as_str()).collect();
        info!(
            tenant_id,
            recipients = ?self.recipients,
            processes = ?numbers,
            "processes awaiting categorization"
        );
    }

    async fn new_documents(&self, tenant_id: &str, digests: &[NewDocumentsDigest]) {
        if digests.is_empty() {
            return;
        }
        for digest in digests {
            let total: usize = digest.documents_by_signer.values().map(|d| d.len()).sum();
            info!(
                tenant_id,
                recipients = ?self.recipients,
                process_number = %digest.process_number,
                nickname = digest.nickname.as_deref().unwrap_or(""),
                new_documents = total,
                by_signer = ?digest.documents_by_signer,
                "new documents discovered"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_sink_accepts_empty_digests() {
        let sink = LogSink::new(vec!["ops@example.com".into()]);
        sink.pending_categorization("t1", &[]).await;
        sink.new_documents("t1", &[]).await;
    }
}
