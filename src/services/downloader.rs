//! Document downloader: fetch, normalize to PDF, upload, record history.
//!
//! Works one process at a time through its best current link. Every document
//! attempt appends a history row with the full timing breakdown regardless of
//! outcome, and a failing document never aborts the task. Uploads that cannot
//! run (store unavailable) or fail leave the document `partial` so a later
//! run finishes the job without losing the audit trail.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::browser::{SessionProvider, UpstreamSession};
use crate::error::{Result, ScrapeError, Stage};
use crate::models::{
    AttemptOutcome, DocumentHistory, DocumentRecord, DocumentStatus, DownloadOutcome,
    DownloadTask, HistoryDetails, Process, RequestedDocuments, TaskStatus,
};
use crate::repository::{DocumentHistoryRepository, ProcessRepository, TenantRepository};
use crate::scrapers::ScraperRegistry;
use crate::services::tasks::{CancelFlag, TaskControl};
use crate::storage::{blob_path, ObjectStore};
use crate::vault::CredentialVault;

/// What one document attempt produced.
struct AttemptResult {
    status: DocumentStatus,
    outcome: DownloadOutcome,
    details: HistoryDetails,
}

/// The download pipeline.
pub struct DocumentDownloader {
    tenants: Arc<TenantRepository>,
    processes: Arc<ProcessRepository>,
    history: Arc<DocumentHistoryRepository>,
    control: Arc<TaskControl>,
    registry: Arc<ScraperRegistry>,
    sessions: Arc<dyn SessionProvider>,
    vault: Arc<CredentialVault>,
    store: Option<Arc<dyn ObjectStore>>,
    run_timeout: Duration,
}

impl DocumentDownloader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenants: Arc<TenantRepository>,
        processes: Arc<ProcessRepository>,
        history: Arc<DocumentHistoryRepository>,
        control: Arc<TaskControl>,
        registry: Arc<ScraperRegistry>,
        sessions: Arc<dyn SessionProvider>,
        vault: Arc<CredentialVault>,
        store: Option<Arc<dyn ObjectStore>>,
        run_timeout: Duration,
    ) -> Self {
        Self {
            tenants,
            processes,
            history,
            control,
            registry,
            sessions,
            vault,
            store,
            run_timeout,
        }
    }

    /// Download documents for a process. `requested` defaults to everything
    /// still needing a download. Returns the terminal task row; a concurrent
    /// request for the same process receives the live task instead.
    pub async fn run(
        &self,
        process_id: &str,
        requested: RequestedDocuments,
    ) -> Result<DownloadTask> {
        let (mut task, cancel) = match self.control.begin_download(process_id, requested)? {
            Ok(started) => started,
            Err(live_id) => {
                info!(process_id, task_id = %live_id, "download already live for process");
                return self.control.download_status(&live_id)?.ok_or_else(|| {
                    ScrapeError::Config(format!("live task {live_id} has no row"))
                });
            }
        };

        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        self.control.update_download(&task)?;

        let outcome = tokio::time::timeout(
            self.run_timeout,
            self.pipeline(&mut task, cancel.clone()),
        )
        .await;

        match outcome {
            Ok(Ok(())) => task.status = TaskStatus::Completed,
            Ok(Err(e)) => {
                warn!(process_id, error = %e, "download task failed");
                task.status = TaskStatus::Failed;
            }
            Err(_) => {
                warn!(process_id, "download task exceeded run timeout");
                cancel.cancel();
                task.status = TaskStatus::Failed;
            }
        }
        task.finished_at = Some(Utc::now());
        self.control.finish_download(&task)?;
        Ok(task)
    }

    async fn pipeline(&self, task: &mut DownloadTask, cancel: CancelFlag) -> Result<()> {
        let process = self
            .processes
            .get_by_id(&task.process_id)?
            .ok_or_else(|| ScrapeError::Config(format!("process {} not found", task.process_id)))?;
        if process.no_valid_links {
            return Err(ScrapeError::Config(format!(
                "process {} has no valid links",
                process.process_number
            )));
        }
        let best_link = process.best_current_link.clone().ok_or_else(|| {
            ScrapeError::Config(format!(
                "process {} has no usable access link",
                process.process_number
            ))
        })?;

        let tenant = self
            .tenants
            .get(&process.tenant_id)?
            .ok_or_else(|| ScrapeError::Config(format!("tenant {} not found", process.tenant_id)))?;
        let plugin = self.registry.get(&tenant.scraper_version)?;
        let encrypted = tenant.encrypted_credentials.as_deref().ok_or_else(|| {
            ScrapeError::Config(format!("tenant {} has no stored credentials", tenant.id))
        })?;
        let credentials = self.vault.decrypt_credentials(encrypted)?;

        // Resolve the target set. Already-downloaded documents named
        // explicitly are observed and skipped, which is what makes a second
        // identical invocation safe.
        let mut targets: Vec<(String, DocumentRecord)> = Vec::new();
        match &task.requested_documents {
            RequestedDocuments::All => {
                for (number, record) in &process.documents {
                    if record.status.needs_download() {
                        targets.push((number.clone(), record.clone()));
                    }
                }
            }
            RequestedDocuments::Subset(numbers) => {
                for number in numbers {
                    match process.documents.get(number) {
                        Some(record) if record.status == DocumentStatus::Downloaded => {
                            debug!(document_number = %number, "already downloaded, skipping");
                            task.results.insert(
                                number.clone(),
                                DownloadOutcome {
                                    uploaded: true,
                                    reason: Some("already downloaded".to_string()),
                                },
                            );
                        }
                        Some(record) => targets.push((number.clone(), record.clone())),
                        None => {
                            task.results.insert(
                                number.clone(),
                                DownloadOutcome {
                                    uploaded: false,
                                    reason: Some("unknown document number".to_string()),
                                },
                            );
                        }
                    }
                }
            }
        }

        if targets.is_empty() {
            self.control.update_download(task)?;
            return Ok(());
        }

        // A session failure here is fatal to the task, not just a document.
        let mut session = self
            .sessions
            .acquire(&tenant, &credentials, plugin.clone())
            .await?;

        // Scoped download area, removed on every exit path.
        let temp_dir = tempfile::tempdir()
            .map_err(|e| ScrapeError::Plugin(format!("could not create download dir: {e}")))?;

        for (number, record) in targets {
            if cancel.is_cancelled() {
                session.close().await;
                return Err(ScrapeError::Cancelled);
            }

            let result = self
                .download_one(&mut *session, &process, &number, &record, temp_dir.path(), &best_link)
                .await;

            self.history.append(&DocumentHistory::download_attempt(
                &process.id,
                &number,
                result.status,
                &result.details,
            ))?;
            self.processes
                .set_document_status(&process.id, &number, result.status)?;

            task.results.insert(number, result.outcome);
            self.control.update_download(task)?;
        }

        session.close().await;
        Ok(())
    }

    /// One document: navigate, trigger, capture, upload. Never fails the
    /// task; every outcome is encoded in the returned attempt.
    async fn download_one(
        &self,
        session: &mut dyn UpstreamSession,
        process: &Process,
        number: &str,
        record: &DocumentRecord,
        download_dir: &Path,
        best_link: &str,
    ) -> AttemptResult {
        let started = Utc::now();
        let mut details = HistoryDetails {
            process_number: process.process_number.clone(),
            process_nickname: process.nickname.clone(),
            document_type: record.doc_type.clone(),
            document_date: record.date.clone(),
            signer: record.signer.clone(),
            download_started: Some(started),
            ..Default::default()
        };

        let finish = |mut details: HistoryDetails,
                      status: DocumentStatus,
                      outcome: AttemptOutcome,
                      reason: Option<String>| {
            details.outcome = Some(outcome);
            details.error = reason.clone();
            details.total_duration_ms =
                Some((Utc::now() - started).num_milliseconds());
            AttemptResult {
                status,
                outcome: DownloadOutcome {
                    uploaded: status == DocumentStatus::Downloaded,
                    reason,
                },
                details,
            }
        };

        // Each document gets a fresh navigation to the process view; the
        // previous download may have navigated away (HTML conversion).
        if let Err(e) = session.open_process(best_link).await {
            warn!(
                tenant_id = %process.tenant_id,
                process_number = %process.process_number,
                link_id = %best_link,
                stage = %Stage::Navigation,
                "could not reach process view: {e}"
            );
            return finish(
                details,
                DocumentStatus::Error,
                AttemptOutcome::Failure,
                Some(format!("navigation failed: {e}")),
            );
        }

        let doc_dir = download_dir.join(number);
        let captured = match session
            .download_document(number, &record.doc_type, &doc_dir)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                warn!(
                    tenant_id = %process.tenant_id,
                    process_number = %process.process_number,
                    document_number = %number,
                    stage = %Stage::Download,
                    "download failed: {e}"
                );
                return finish(
                    details,
                    DocumentStatus::Error,
                    AttemptOutcome::Failure,
                    Some(e.to_string()),
                );
            }
        };

        let finished = Utc::now();
        details.download_finished = Some(finished);
        details.download_duration_ms = Some((finished - started).num_milliseconds());
        details.file_name = captured
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());

        let bytes = match std::fs::read(&captured) {
            Ok(bytes) => bytes,
            Err(e) => {
                return finish(
                    details,
                    DocumentStatus::Error,
                    AttemptOutcome::Failure,
                    Some(format!("could not read downloaded file: {e}")),
                );
            }
        };
        details.file_size_bytes = Some(bytes.len() as u64);

        let Some(store) = &self.store else {
            return finish(
                details,
                DocumentStatus::Partial,
                AttemptOutcome::PartialSuccess,
                Some("object store unavailable, upload deferred".to_string()),
            );
        };

        let path = blob_path(&process.tenant_id, &process.process_number, number);
        details.upload_started = Some(Utc::now());
        let uploaded = match store.upload(&path, bytes).await {
            Ok(uploaded) => uploaded,
            Err(e) => {
                details.upload_finished = Some(Utc::now());
                return finish(
                    details,
                    DocumentStatus::Partial,
                    AttemptOutcome::PartialSuccess,
                    Some(format!("upload error: {e}")),
                );
            }
        };
        details.upload_finished = Some(Utc::now());

        if uploaded {
            details.storage_path = Some(path);
            finish(details, DocumentStatus::Downloaded, AttemptOutcome::Success, None)
        } else {
            finish(
                details,
                DocumentStatus::Partial,
                AttemptOutcome::PartialSuccess,
                Some("upload refused by object store".to_string()),
            )
        }
    }
}
