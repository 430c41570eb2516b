//! Task control plane: the process-wide registry of live background tasks.
//!
//! In-memory state is authoritative while a task runs; every state change is
//! mirrored to the database so the API can answer "where is task T?" across
//! restarts. Startup transitions any still-`running` row to `failed` with
//! reason `orphaned`.
//!
//! Lock order: the registry mutex may be held while touching the database,
//! never the other way around.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::error::Result;
use crate::models::{DownloadTask, ExtractionTask, RequestedDocuments, TaskStatus};
use crate::repository::TaskRepository;

/// Cooperative abort signal, observed by workers at every suspension point.
#[derive(Clone, Default, Debug)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of asking for a new extraction run.
pub enum BeginExtraction {
    /// A fresh task was created; the caller owns the run.
    Started(ExtractionHandle),
    /// Another extraction is live for this tenant; callers share its id.
    Coalesced(String),
}

/// Ownership of one started extraction run.
pub struct ExtractionHandle {
    pub task: ExtractionTask,
    pub cancel: CancelFlag,
}

struct LiveEntry {
    task_id: String,
    cancel: CancelFlag,
}

/// Process-wide task registry.
pub struct TaskControl {
    repo: TaskRepository,
    /// Live extractions keyed by tenant id.
    extractions: Mutex<HashMap<String, LiveEntry>>,
    /// Live downloads keyed by process id.
    downloads: Mutex<HashMap<String, LiveEntry>>,
}

impl TaskControl {
    pub fn new(repo: TaskRepository) -> Self {
        Self {
            repo,
            extractions: Mutex::new(HashMap::new()),
            downloads: Mutex::new(HashMap::new()),
        }
    }

    /// Fail tasks orphaned by a previous process. Called once at startup.
    pub fn startup_sweep(&self) -> Result<usize> {
        let swept = self.repo.fail_orphaned_running()?;
        if swept > 0 {
            info!(swept, "failed orphaned running tasks from previous process");
        }
        Ok(swept)
    }

    /// Begin an extraction for a tenant, or coalesce onto the live one.
    ///
    /// At most one extraction is live per tenant: the registry is checked
    /// first, then the database (covers rows written before a restart whose
    /// status is still `pending`).
    pub fn begin_extraction(&self, tenant_id: &str) -> Result<BeginExtraction> {
        let mut live = self.extractions.lock().expect("task registry poisoned");

        if let Some(entry) = live.get(tenant_id) {
            return Ok(BeginExtraction::Coalesced(entry.task_id.clone()));
        }
        if let Some(row) = self.repo.live_extraction_for_tenant(tenant_id)? {
            if row.status.is_live() {
                return Ok(BeginExtraction::Coalesced(row.id));
            }
        }

        let task = ExtractionTask::new(tenant_id);
        self.repo.save_extraction(&task)?;

        let cancel = CancelFlag::new();
        live.insert(
            tenant_id.to_string(),
            LiveEntry {
                task_id: task.id.clone(),
                cancel: cancel.clone(),
            },
        );
        Ok(BeginExtraction::Started(ExtractionHandle { task, cancel }))
    }

    /// Whether a tenant has a live extraction. Used by the scheduler to drop
    /// overlapping fires.
    pub fn extraction_running(&self, tenant_id: &str) -> bool {
        self.extractions
            .lock()
            .expect("task registry poisoned")
            .contains_key(tenant_id)
    }

    /// Persist a task row update while the run is live.
    pub fn update_extraction(&self, task: &ExtractionTask) -> Result<()> {
        self.repo.save_extraction(task)
    }

    /// Record the terminal task row and release the tenant slot.
    pub fn finish_extraction(&self, task: &ExtractionTask) -> Result<()> {
        self.repo.save_extraction(task)?;
        self.extractions
            .lock()
            .expect("task registry poisoned")
            .remove(&task.tenant_id);
        Ok(())
    }

    /// Begin a download run for a process. Unlike extractions, concurrent
    /// requests for one process are rejected by returning the live id.
    pub fn begin_download(
        &self,
        process_id: &str,
        requested: RequestedDocuments,
    ) -> Result<std::result::Result<(DownloadTask, CancelFlag), String>> {
        let mut live = self.downloads.lock().expect("task registry poisoned");

        if let Some(entry) = live.get(process_id) {
            return Ok(Err(entry.task_id.clone()));
        }

        let task = DownloadTask::new(process_id, requested);
        self.repo.save_download(&task)?;

        let cancel = CancelFlag::new();
        live.insert(
            process_id.to_string(),
            LiveEntry {
                task_id: task.id.clone(),
                cancel: cancel.clone(),
            },
        );
        Ok(Ok((task, cancel)))
    }

    pub fn update_download(&self, task: &DownloadTask) -> Result<()> {
        self.repo.save_download(task)
    }

    pub fn finish_download(&self, task: &DownloadTask) -> Result<()> {
        self.repo.save_download(task)?;
        self.downloads
            .lock()
            .expect("task registry poisoned")
            .remove(&task.process_id);
        Ok(())
    }

    /// Signal cancellation for the task with the given id, if it is live.
    pub fn cancel(&self, task_id: &str) -> bool {
        let extractions = self.extractions.lock().expect("task registry poisoned");
        if let Some(entry) = extractions.values().find(|e| e.task_id == task_id) {
            entry.cancel.cancel();
            return true;
        }
        drop(extractions);

        let downloads = self.downloads.lock().expect("task registry poisoned");
        if let Some(entry) = downloads.values().find(|e| e.task_id == task_id) {
            entry.cancel.cancel();
            return true;
        }
        false
    }

    /// Cancel everything live. Used at shutdown.
    pub fn cancel_all(&self) {
        for entry in self
            .extractions
            .lock()
            .expect("task registry poisoned")
            .values()
        {
            entry.cancel.cancel();
        }
        for entry in self.downloads.lock().expect("task registry poisoned").values() {
            entry.cancel.cancel();
        }
    }

    /// Task status lookup for the API: extraction rows first, then downloads.
    pub fn extraction_status(&self, task_id: &str) -> Result<Option<ExtractionTask>> {
        self.repo.get_extraction(task_id)
    }

    /// The live extraction row for a tenant, if any.
    pub fn live_extraction(&self, tenant_id: &str) -> Result<Option<ExtractionTask>> {
        self.repo.live_extraction_for_tenant(tenant_id)
    }

    /// Recent extraction rows for a tenant, newest first.
    pub fn recent_extractions(&self, tenant_id: &str) -> Result<Vec<ExtractionTask>> {
        self.repo.recent_extractions(tenant_id, 50)
    }

    pub fn download_status(&self, task_id: &str) -> Result<Option<DownloadTask>> {
        self.repo.get_download(task_id)
    }
}
