//! Process extractor: the two-phase extraction pipeline.
//!
//! Phase A discovers the process listing on a single session. Phase B fans
//! out to a bounded pool of workers, each owning one session for its
//! lifetime, visiting one `(process_number, link_id)` pair per work item in a
//! single navigation (link validation and document listing happen together;
//! there is no second pass). Every successfully visited process is upserted
//! in its own transaction before the task completes; one failing process
//! never aborts the run.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::browser::{SessionProvider, UpstreamSession};
use crate::error::{Result, ScrapeError, Stage};
use crate::models::{
    is_valid_process_number, AccessType, CategoryStatus, Credentials, ExtractionSummary,
    ExtractionTask, LinkRecord, LinkResult, LinkStatus, ObservedDocument, Process, TaskStatus,
    Tenant, VisitOutcome,
};
use crate::repository::{ProcessRepository, TenantRepository};
use crate::scrapers::{ScraperPlugin, ScraperRegistry};
use crate::services::notify::{
    NewDocumentsDigest, NotificationSink, PendingCategorization, UNKNOWN_SIGNER,
};
use crate::services::tasks::{BeginExtraction, CancelFlag, ExtractionHandle, TaskControl};
use crate::vault::CredentialVault;

/// One unit of phase-B work: a discovered `(process_number, link_id)` pair
/// plus the fallback links known from previous runs.
#[derive(Debug, Clone)]
struct WorkItem {
    process_number: String,
    link_id: String,
    unit: Option<String>,
    fallback_links: Vec<String>,
    prior: Option<Process>,
}

/// Aggregates shared by the phase-B workers.
#[derive(Default)]
struct RunAggregates {
    new_processes: HashSet<String>,
    updated_processes: HashSet<String>,
    new_documents: BTreeMap<String, Vec<ObservedDocument>>,
    pending: BTreeMap<String, Option<String>>,
    nicknames: BTreeMap<String, String>,
    failures: usize,
    fatal: Option<ScrapeError>,
}

struct WorkerContext {
    tenant: Tenant,
    credentials: Credentials,
    plugin: Arc<dyn ScraperPlugin>,
    sessions: Arc<dyn SessionProvider>,
    processes: Arc<ProcessRepository>,
    control: Arc<TaskControl>,
    queue: Arc<Mutex<VecDeque<WorkItem>>>,
    aggregates: Arc<Mutex<RunAggregates>>,
    processed: Arc<AtomicUsize>,
    total: usize,
    task: ExtractionTask,
    cancel: CancelFlag,
}

/// The extraction pipeline core.
pub struct ProcessExtractor {
    tenants: Arc<TenantRepository>,
    processes: Arc<ProcessRepository>,
    control: Arc<TaskControl>,
    registry: Arc<ScraperRegistry>,
    sessions: Arc<dyn SessionProvider>,
    vault: Arc<CredentialVault>,
    notifier: Arc<dyn NotificationSink>,
    worker_limit: usize,
    run_timeout: Duration,
}

impl ProcessExtractor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenants: Arc<TenantRepository>,
        processes: Arc<ProcessRepository>,
        control: Arc<TaskControl>,
        registry: Arc<ScraperRegistry>,
        sessions: Arc<dyn SessionProvider>,
        vault: Arc<CredentialVault>,
        notifier: Arc<dyn NotificationSink>,
        worker_limit: usize,
        run_timeout: Duration,
    ) -> Self {
        Self {
            tenants,
            processes,
            control,
            registry,
            sessions,
            vault,
            notifier,
            worker_limit: worker_limit.max(1),
            run_timeout,
        }
    }

    /// Run an extraction for a tenant, or coalesce onto the live one.
    /// Returns the terminal (or live, when coalesced) task row.
    pub async fn run(&self, tenant_id: &str) -> Result<ExtractionTask> {
        match self.control.begin_extraction(tenant_id)? {
            BeginExtraction::Coalesced(task_id) => {
                info!(tenant_id, task_id = %task_id, "extraction already live, coalescing");
                self.control.extraction_status(&task_id)?.ok_or_else(|| {
                    ScrapeError::Config(format!("live task {task_id} has no row"))
                })
            }
            BeginExtraction::Started(handle) => self.execute(handle).await,
        }
    }

    async fn execute(&self, handle: ExtractionHandle) -> Result<ExtractionTask> {
        let ExtractionHandle { mut task, cancel } = handle;

        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        self.control.update_extraction(&task)?;

        let outcome = tokio::time::timeout(
            self.run_timeout,
            self.pipeline(task.clone(), cancel.clone()),
        )
        .await;

        match outcome {
            Ok(Ok(summary)) => {
                info!(
                    tenant_id = %task.tenant_id,
                    discovered = summary.discovered,
                    new_processes = summary.new_processes,
                    new_documents = summary.new_documents,
                    failures = summary.failures,
                    "extraction completed"
                );
                task.status = TaskStatus::Completed;
                task.progress = 100;
                task.result_summary = Some(summary);
            }
            Ok(Err(e)) => {
                warn!(tenant_id = %task.tenant_id, error = %e, "extraction failed");
                task.status = TaskStatus::Failed;
                task.error_message = Some(match e {
                    ScrapeError::Cancelled => "cancelled".to_string(),
                    other => other.to_string(),
                });
            }
            Err(_) => {
                warn!(tenant_id = %task.tenant_id, "extraction exceeded run timeout");
                cancel.cancel();
                task.status = TaskStatus::Failed;
                task.error_message = Some("run timeout exceeded".to_string());
            }
        }
        task.finished_at = Some(Utc::now());
        self.control.finish_extraction(&task)?;
        Ok(task)
    }

    async fn pipeline(
        &self,
        task: ExtractionTask,
        cancel: CancelFlag,
    ) -> Result<ExtractionSummary> {
        let tenant_id = task.tenant_id.clone();
        let tenant = self
            .tenants
            .get(&tenant_id)?
            .ok_or_else(|| ScrapeError::Config(format!("tenant {tenant_id} not found")))?;
        if !tenant.is_active {
            return Err(ScrapeError::Config(format!("tenant {tenant_id} is inactive")));
        }

        let plugin = self.registry.get(&tenant.scraper_version)?;
        let encrypted = tenant.encrypted_credentials.as_deref().ok_or_else(|| {
            ScrapeError::Config(format!("tenant {tenant_id} has no stored credentials"))
        })?;
        let credentials = self.vault.decrypt_credentials(encrypted)?;

        // Phase A: discovery on one session, single-threaded.
        let mut discovery = self
            .sessions
            .acquire(&tenant, &credentials, plugin.clone())
            .await?;
        let listings = discovery.list_processes().await;
        discovery.close().await;
        let listings = listings?;

        let listings: Vec<_> = listings
            .into_iter()
            .filter(|l| {
                let valid = is_valid_process_number(&l.process_number);
                if !valid {
                    warn!(
                        tenant_id = %tenant_id,
                        process_number = %l.process_number,
                        stage = %Stage::Discovery,
                        "discarding malformed process number"
                    );
                }
                valid
            })
            .collect();

        let discovered: HashSet<&str> =
            listings.iter().map(|l| l.process_number.as_str()).collect();
        let discovered = discovered.len();
        info!(tenant_id = %tenant_id, discovered, "discovery finished");

        if listings.is_empty() {
            self.notifier.pending_categorization(&tenant_id, &[]).await;
            self.notifier.new_documents(&tenant_id, &[]).await;
            return Ok(ExtractionSummary {
                discovered: 0,
                ..Default::default()
            });
        }

        // Left-outer-join against the stored corpus.
        let prior: HashMap<String, Process> = self
            .processes
            .get_all_by_tenant(&tenant_id)?
            .into_iter()
            .map(|p| (p.process_number.clone(), p))
            .collect();

        let items: Vec<WorkItem> = listings
            .into_iter()
            .map(|listing| {
                let prior_process = prior.get(&listing.process_number).cloned();
                let fallback_links = prior_process
                    .as_ref()
                    .map(|p| fallback_links(p, &listing.link_id))
                    .unwrap_or_default();
                WorkItem {
                    process_number: listing.process_number,
                    link_id: listing.link_id,
                    unit: listing.unit,
                    fallback_links,
                    prior: prior_process,
                }
            })
            .collect();
        let total = items.len();

        // Phase B: bounded worker fan-out.
        let queue = Arc::new(Mutex::new(VecDeque::from(items)));
        let aggregates = Arc::new(Mutex::new(RunAggregates::default()));
        let processed = Arc::new(AtomicUsize::new(0));

        let worker_count = self.worker_limit.min(total);
        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let ctx = WorkerContext {
                tenant: tenant.clone(),
                credentials: credentials.clone(),
                plugin: plugin.clone(),
                sessions: self.sessions.clone(),
                processes: self.processes.clone(),
                control: self.control.clone(),
                queue: queue.clone(),
                aggregates: aggregates.clone(),
                processed: processed.clone(),
                total,
                task: task.clone(),
                cancel: cancel.clone(),
            };
            handles.push(tokio::spawn(worker_loop(worker_id, ctx)));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let aggregates = Arc::try_unwrap(aggregates)
            .map_err(|_| ScrapeError::Plugin("worker still holds run aggregates".into()))?
            .into_inner()
            .map_err(|_| ScrapeError::Plugin("run aggregates poisoned".into()))?;

        if let Some(fatal) = aggregates.fatal {
            return Err(fatal);
        }
        if cancel.is_cancelled() {
            return Err(ScrapeError::Cancelled);
        }

        self.dispatch_notifications(&tenant_id, &aggregates).await;

        let new_documents = aggregates.new_documents.values().map(|d| d.len()).sum();
        let updated = aggregates
            .updated_processes
            .difference(&aggregates.new_processes)
            .count();
        Ok(ExtractionSummary {
            discovered,
            new_processes: aggregates.new_processes.len(),
            updated_processes: updated,
            new_documents,
            failures: aggregates.failures,
        })
    }

    async fn dispatch_notifications(&self, tenant_id: &str, aggregates: &RunAggregates) {
        let pending: Vec<PendingCategorization> = aggregates
            .pending
            .iter()
            .map(|(number, link)| PendingCategorization {
                process_number: number.clone(),
                link_id: link.clone(),
            })
            .collect();
        self.notifier.pending_categorization(tenant_id, &pending).await;

        let digests: Vec<NewDocumentsDigest> = aggregates
            .new_documents
            .iter()
            .map(|(number, documents)| {
                let mut by_signer: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for doc in documents {
                    by_signer
                        .entry(
                            doc.signer
                                .clone()
                                .unwrap_or_else(|| UNKNOWN_SIGNER.to_string()),
                        )
                        .or_default()
                        .push(doc.number.clone());
                }
                NewDocumentsDigest {
                    process_number: number.clone(),
                    nickname: aggregates.nicknames.get(number).cloned(),
                    documents_by_signer: by_signer,
                }
            })
            .collect();
        self.notifier.new_documents(tenant_id, &digests).await;
    }
}

/// Known links that can stand in when the discovered one fails, in
/// descending order of past success: integral before partial before unknown,
/// most recent check first, ties broken by link id. Links already marked
/// inactive are not offered again; the same ranking drives
/// `best_current_link` on the process itself.
fn fallback_links(prior: &Process, primary: &str) -> Vec<String> {
    fn success_rank(link: &LinkRecord) -> u8 {
        match link.access_type {
            Some(AccessType::Integral) => 2,
            Some(AccessType::Partial) => 1,
            _ => 0,
        }
    }

    let mut links: Vec<(&String, &LinkRecord)> = prior
        .links
        .iter()
        .filter(|(id, link)| id.as_str() != primary && link.status == LinkStatus::Active)
        .collect();
    links.sort_by(|(id_a, a), (id_b, b)| {
        success_rank(b)
            .cmp(&success_rank(a))
            .then(b.last_checked.cmp(&a.last_checked))
            .then(id_a.cmp(id_b))
    });
    links.into_iter().map(|(id, _)| id.clone()).collect()
}

async fn worker_loop(worker_id: usize, ctx: WorkerContext) {
    let mut session = match ctx
        .sessions
        .acquire(&ctx.tenant, &ctx.credentials, ctx.plugin.clone())
        .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!(
                tenant_id = %ctx.tenant.id,
                worker_id,
                stage = %Stage::Login,
                "worker could not establish a session: {e}"
            );
            let mut aggregates = ctx.aggregates.lock().expect("run aggregates poisoned");
            if aggregates.fatal.is_none() {
                aggregates.fatal = Some(e);
            }
            return;
        }
    };

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if ctx
            .aggregates
            .lock()
            .expect("run aggregates poisoned")
            .fatal
            .is_some()
        {
            break;
        }

        let Some(item) = ctx
            .queue
            .lock()
            .expect("work queue poisoned")
            .pop_front()
        else {
            break;
        };

        process_item(&mut *session, &ctx, &item).await;

        let done = ctx.processed.fetch_add(1, Ordering::Relaxed) + 1;
        let mut progress_row = ctx.task.clone();
        progress_row.progress = ((done * 100) / ctx.total.max(1)).min(99) as u8;
        if let Err(e) = ctx.control.update_extraction(&progress_row) {
            warn!(worker_id, "could not persist progress: {e}");
        }
    }

    session.close().await;
}

/// Visit one `(process_number, link_id)` pair: navigate, classify, extract,
/// and merge. Per-process failures accumulate; only session-level faults
/// escalate to the run.
async fn process_item(session: &mut dyn UpstreamSession, ctx: &WorkerContext, item: &WorkItem) {
    let tenant_id = &ctx.tenant.id;
    let mut link_results: Vec<LinkResult> = Vec::new();
    let mut reached: Option<(String, AccessType)> = None;

    let mut candidates = vec![item.link_id.clone()];
    candidates.extend(item.fallback_links.iter().cloned());

    for (index, link_id) in candidates.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            return;
        }

        // The discovered link gets one retry on navigation failure; known
        // fallbacks get a single attempt each.
        let attempts = if index == 0 { 2 } else { 1 };
        let mut navigated = false;
        for attempt in 0..attempts {
            match session.open_process(link_id).await {
                Ok(()) => {
                    navigated = true;
                    break;
                }
                Err(ScrapeError::Navigation(e)) => {
                    debug!(
                        tenant_id = %tenant_id,
                        process_number = %item.process_number,
                        link_id = %link_id,
                        stage = %Stage::Navigation,
                        attempt,
                        "navigation failed: {e}"
                    );
                }
                Err(e) => {
                    record_failure(ctx, item, link_id, Stage::Navigation, &e);
                    return;
                }
            }
        }
        if !navigated {
            link_results.push(LinkResult {
                link_id: link_id.clone(),
                status: LinkStatus::Inactive,
                access: None,
            });
            continue;
        }

        let access = match session.classify_access().await {
            Ok(access) => access,
            Err(e) => {
                record_failure(ctx, item, link_id, Stage::Classification, &e);
                return;
            }
        };
        if access == AccessType::Error {
            link_results.push(LinkResult {
                link_id: link_id.clone(),
                status: LinkStatus::Inactive,
                access: Some(AccessType::Error),
            });
            continue;
        }

        link_results.push(LinkResult {
            link_id: link_id.clone(),
            status: LinkStatus::Active,
            access: Some(access),
        });
        reached = Some((link_id.clone(), access));
        break;
    }

    let mut visit = VisitOutcome {
        link_results,
        authority: None,
        unit: item.unit.clone(),
        documents: None,
        checked_at: Some(Utc::now()),
    };

    if let Some((link_id, access)) = &reached {
        let base_state = item
            .prior
            .clone()
            .unwrap_or_else(|| Process::new(tenant_id, &item.process_number));

        if base_state.authority.is_none() {
            match session.extract_authority().await {
                Ok(authority) => visit.authority = authority,
                Err(e) => debug!(
                    tenant_id = %tenant_id,
                    process_number = %item.process_number,
                    link_id = %link_id,
                    stage = %Stage::Classification,
                    "authority extraction failed: {e}"
                ),
            }
        }

        if base_state.allows_document_extraction(*access) {
            match session.list_documents().await {
                Ok(documents) => visit.documents = Some(documents),
                Err(e) => {
                    // The visit still merges; only the listing failed.
                    warn!(
                        tenant_id = %tenant_id,
                        process_number = %item.process_number,
                        link_id = %link_id,
                        stage = %Stage::DocumentListing,
                        "document listing failed: {e}"
                    );
                    ctx.aggregates
                        .lock()
                        .expect("run aggregates poisoned")
                        .failures += 1;
                }
            }
        } else {
            debug!(
                tenant_id = %tenant_id,
                process_number = %item.process_number,
                "document extraction skipped by category policy"
            );
        }
    }

    let merge = match ctx
        .processes
        .apply_visit(tenant_id, &item.process_number, &visit)
    {
        Ok(merge) => merge,
        Err(e) => {
            record_failure(ctx, item, &item.link_id, Stage::Persistence, &e);
            return;
        }
    };

    let mut aggregates = ctx.aggregates.lock().expect("run aggregates poisoned");
    if merge.created {
        aggregates.new_processes.insert(item.process_number.clone());
    } else {
        aggregates
            .updated_processes
            .insert(item.process_number.clone());
    }
    if !merge.new_documents.is_empty() {
        if let Some(observed) = &visit.documents {
            let new_set: HashSet<&str> =
                merge.new_documents.iter().map(|n| n.as_str()).collect();
            let entry = aggregates
                .new_documents
                .entry(item.process_number.clone())
                .or_default();
            for doc in observed {
                if new_set.contains(doc.number.as_str())
                    && !entry.iter().any(|d| d.number == doc.number)
                {
                    entry.push(doc.clone());
                }
            }
        }
    }
    if merge.process.category_status == Some(CategoryStatus::Pending) {
        aggregates
            .pending
            .insert(item.process_number.clone(), reached.map(|(l, _)| l));
    }
    if let Some(nickname) = &merge.process.nickname {
        aggregates
            .nicknames
            .insert(item.process_number.clone(), nickname.clone());
    }
}

fn record_failure(
    ctx: &WorkerContext,
    item: &WorkItem,
    link_id: &str,
    stage: Stage,
    error: &ScrapeError,
) {
    warn!(
        tenant_id = %ctx.tenant.id,
        process_number = %item.process_number,
        link_id = %link_id,
        stage = %stage,
        "process failed: {error}"
    );
    ctx.aggregates
        .lock()
        .expect("run aggregates poisoned")
        .failures += 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(
        process: &mut Process,
        id: &str,
        status: LinkStatus,
        access: Option<AccessType>,
        checked: &str,
    ) {
        process.links.insert(
            id.to_string(),
            LinkRecord {
                status,
                access_type: access,
                last_checked: checked.to_string(),
                history: Vec::new(),
            },
        );
    }

    #[test]
    fn fallbacks_prefer_access_quality_over_recency() {
        let mut process = Process::new("t1", "12345.001234/2024-56");
        // An errored link checked just now must rank below an integral link
        // checked a week earlier.
        link(
            &mut process,
            "ERR",
            LinkStatus::Active,
            Some(AccessType::Error),
            "2024-07-08 12:00:00",
        );
        link(
            &mut process,
            "OLD",
            LinkStatus::Active,
            Some(AccessType::Integral),
            "2024-07-01 12:00:00",
        );
        link(
            &mut process,
            "PAR",
            LinkStatus::Active,
            Some(AccessType::Partial),
            "2024-07-07 12:00:00",
        );

        assert_eq!(fallback_links(&process, "ABC"), vec!["OLD", "PAR", "ERR"]);
    }

    #[test]
    fn fallbacks_skip_inactive_links_and_the_primary() {
        let mut process = Process::new("t1", "12345.001234/2024-56");
        link(
            &mut process,
            "DEAD",
            LinkStatus::Inactive,
            Some(AccessType::Integral),
            "2024-07-08 12:00:00",
        );
        link(
            &mut process,
            "ABC",
            LinkStatus::Active,
            Some(AccessType::Integral),
            "2024-07-08 12:00:00",
        );
        link(
            &mut process,
            "DEF",
            LinkStatus::Active,
            Some(AccessType::Partial),
            "2024-07-08 12:00:00",
        );

        assert_eq!(fallback_links(&process, "ABC"), vec!["DEF"]);
    }

    #[test]
    fn fallbacks_tie_break_on_recency_then_id() {
        let mut process = Process::new("t1", "12345.001234/2024-56");
        link(
            &mut process,
            "ZZZ",
            LinkStatus::Active,
            Some(AccessType::Integral),
            "2024-07-08 12:00:00",
        );
        link(
            &mut process,
            "AAA",
            LinkStatus::Active,
            Some(AccessType::Integral),
            "2024-07-08 12:00:00",
        );
        link(
            &mut process,
            "BBB",
            LinkStatus::Active,
            Some(AccessType::Integral),
            "2024-07-01 12:00:00",
        );

        assert_eq!(fallback_links(&process, "XYZ"), vec!["AAA", "ZZZ", "BBB"]);
    }
}
