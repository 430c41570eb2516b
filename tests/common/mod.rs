//! Shared test doubles: a scripted upstream, a recording object store, and a
//! recording notification sink, plus the wiring to stand up a full pipeline
//! against a temporary database.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use conectasei::browser::{SessionProvider, UpstreamSession};
use conectasei::error::{Result, ScrapeError};
use conectasei::models::{
    AccessType, Credentials, ObservedDocument, Tenant,
};
use conectasei::repository::{
    init_schema, DocumentHistoryRepository, ProcessRepository, ScheduleRepository,
    SystemConfigRepository, TaskRepository, TenantRepository,
};
use conectasei::scrapers::{ProcessListing, ScraperPlugin, ScraperRegistry};
use conectasei::services::notify::{NewDocumentsDigest, NotificationSink, PendingCategorization};
use conectasei::services::{DocumentDownloader, ProcessExtractor, TaskControl};
use conectasei::storage::ObjectStore;
use conectasei::vault::CredentialVault;

pub const TENANT: &str = "t1";
pub const PROCESS: &str = "12345.001234/2024-56";

/// Behavior of one upstream access link in the scripted upstream.
#[derive(Clone)]
pub enum LinkBehavior {
    /// Navigation succeeds; the view grants this access and lists these
    /// documents.
    Access(AccessType, Vec<ObservedDocument>),
    /// Navigation fails outright (timeout, dead link).
    NavError,
    /// Navigation succeeds after a delay, then grants access.
    Slow(Duration, AccessType),
}

/// Scripted upstream state shared by every session the provider hands out.
#[derive(Default)]
pub struct Script {
    pub listings: Mutex<Vec<ProcessListing>>,
    pub links: Mutex<HashMap<String, LinkBehavior>>,
    pub authority: Mutex<Option<String>>,
    /// document number → (suggested file name, payload)
    pub downloads: Mutex<HashMap<String, (String, Vec<u8>)>>,
    pub navigations: AtomicUsize,
    pub download_triggers: AtomicUsize,
}

impl Script {
    pub fn set_listings(&self, listings: Vec<(&str, &str)>) {
        *self.listings.lock().unwrap() = listings
            .into_iter()
            .map(|(number, link)| ProcessListing {
                process_number: number.to_string(),
                link_id: link.to_string(),
                unit: None,
            })
            .collect();
    }

    pub fn set_link(&self, link_id: &str, behavior: LinkBehavior) {
        self.links
            .lock()
            .unwrap()
            .insert(link_id.to_string(), behavior);
    }

    pub fn set_authority(&self, authority: &str) {
        *self.authority.lock().unwrap() = Some(authority.to_string());
    }

    pub fn set_download(&self, number: &str, file_name: &str, payload: &[u8]) {
        self.downloads
            .lock()
            .unwrap()
            .insert(number.to_string(), (file_name.to_string(), payload.to_vec()));
    }
}

pub struct ScriptedSession {
    script: Arc<Script>,
    current_link: Option<String>,
}

#[async_trait]
impl UpstreamSession for ScriptedSession {
    async fn list_processes(&mut self) -> Result<Vec<ProcessListing>> {
        Ok(self.script.listings.lock().unwrap().clone())
    }

    async fn open_process(&mut self, link_id: &str) -> Result<()> {
        self.script.navigations.fetch_add(1, Ordering::SeqCst);
        let behavior = self.script.links.lock().unwrap().get(link_id).cloned();
        match behavior {
            Some(LinkBehavior::NavError) | None => {
                self.current_link = None;
                Err(ScrapeError::Navigation(format!("link {link_id} unreachable")))
            }
            Some(LinkBehavior::Slow(delay, _)) => {
                tokio::time::sleep(delay).await;
                self.current_link = Some(link_id.to_string());
                Ok(())
            }
            Some(LinkBehavior::Access(..)) => {
                self.current_link = Some(link_id.to_string());
                Ok(())
            }
        }
    }

    async fn classify_access(&mut self) -> Result<AccessType> {
        let link = self.current_link.clone().ok_or_else(|| {
            ScrapeError::Plugin("classify_access without an open process".into())
        })?;
        match self.script.links.lock().unwrap().get(&link) {
            Some(LinkBehavior::Access(access, _)) => Ok(*access),
            Some(LinkBehavior::Slow(_, access)) => Ok(*access),
            _ => Ok(AccessType::Error),
        }
    }

    async fn extract_authority(&mut self) -> Result<Option<String>> {
        Ok(self.script.authority.lock().unwrap().clone())
    }

    async fn list_documents(&mut self) -> Result<Vec<ObservedDocument>> {
        let link = self.current_link.clone().ok_or_else(|| {
            ScrapeError::Plugin("list_documents without an open process".into())
        })?;
        match self.script.links.lock().unwrap().get(&link) {
            Some(LinkBehavior::Access(_, documents)) => Ok(documents.clone()),
            _ => Ok(Vec::new()),
        }
    }

    async fn download_document(
        &mut self,
        doc_number: &str,
        _doc_type: &str,
        download_dir: &Path,
    ) -> Result<PathBuf> {
        self.script.download_triggers.fetch_add(1, Ordering::SeqCst);
        let entry = self.script.downloads.lock().unwrap().get(doc_number).cloned();
        let (file_name, payload) = entry.ok_or_else(|| {
            ScrapeError::Plugin(format!("no upstream payload for document {doc_number}"))
        })?;
        std::fs::create_dir_all(download_dir)
            .map_err(|e| ScrapeError::Plugin(e.to_string()))?;
        let path = download_dir.join(file_name);
        std::fs::write(&path, payload).map_err(|e| ScrapeError::Plugin(e.to_string()))?;
        Ok(path)
    }

    async fn close(&mut self) {}
}

/// Session provider handing out scripted sessions.
pub struct ScriptedProvider {
    pub script: Arc<Script>,
    pub fail_acquire: AtomicBool,
    pub acquired: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(script: Arc<Script>) -> Self {
        Self {
            script,
            fail_acquire: AtomicBool::new(false),
            acquired: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionProvider for ScriptedProvider {
    async fn acquire(
        &self,
        _tenant: &Tenant,
        credentials: &Credentials,
        _plugin: Arc<dyn ScraperPlugin>,
    ) -> Result<Box<dyn UpstreamSession>> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(ScrapeError::Navigation("upstream unreachable".into()));
        }
        if credentials.password != "hunter2" {
            return Err(ScrapeError::Auth("bad credentials".into()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            script: self.script.clone(),
            current_link: None,
        }))
    }
}

/// Object store double recording every upload.
#[derive(Default)]
pub struct RecordingStore {
    pub objects: Mutex<BTreeMap<String, Vec<u8>>>,
    pub refuse_uploads: AtomicBool,
    pub upload_calls: AtomicUsize,
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<bool> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse_uploads.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.objects.lock().unwrap().insert(path.to_string(), bytes);
        Ok(true)
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().remove(path).is_some())
    }

    fn url_for(&self, path: &str) -> String {
        format!("mock://bucket/{path}")
    }
}

/// Notification sink double recording every digest.
#[derive(Default)]
pub struct RecordingSink {
    pub pending: Mutex<Vec<PendingCategorization>>,
    pub digests: Mutex<Vec<NewDocumentsDigest>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn pending_categorization(&self, _tenant_id: &str, items: &[PendingCategorization]) {
        self.pending.lock().unwrap().extend(items.iter().cloned());
    }

    async fn new_documents(&self, _tenant_id: &str, digests: &[NewDocumentsDigest]) {
        self.digests.lock().unwrap().extend(digests.iter().cloned());
    }
}

/// A fully wired pipeline against a temporary database and scripted upstream.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub db: PathBuf,
    pub script: Arc<Script>,
    pub provider: Arc<ScriptedProvider>,
    pub store: Arc<RecordingStore>,
    pub sink: Arc<RecordingSink>,
    pub tenants: Arc<TenantRepository>,
    pub processes: Arc<ProcessRepository>,
    pub history: Arc<DocumentHistoryRepository>,
    pub schedules: Arc<ScheduleRepository>,
    pub sysconfig: Arc<SystemConfigRepository>,
    pub control: Arc<TaskControl>,
    pub registry: Arc<ScraperRegistry>,
    pub vault: Arc<CredentialVault>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("conectasei.db");
        init_schema(&db).unwrap();

        let vault = Arc::new(CredentialVault::from_key_material("test-key").unwrap());
        let tenants = Arc::new(TenantRepository::new(&db).unwrap());

        let mut tenant = Tenant::new(TENANT, "Tribunal", "https://sei.example.gov.br", "4.2.0");
        tenant.encrypted_credentials = Some(
            vault
                .encrypt_credentials(&Credentials {
                    email: "robot@example.com".to_string(),
                    password: "hunter2".to_string(),
                })
                .unwrap(),
        );
        tenants.save(&tenant).unwrap();

        let script = Arc::new(Script::default());
        Self {
            provider: Arc::new(ScriptedProvider::new(script.clone())),
            store: Arc::new(RecordingStore::default()),
            sink: Arc::new(RecordingSink::default()),
            tenants,
            processes: Arc::new(ProcessRepository::new(&db).unwrap()),
            history: Arc::new(DocumentHistoryRepository::new(&db).unwrap()),
            schedules: Arc::new(ScheduleRepository::new(&db).unwrap()),
            sysconfig: Arc::new(SystemConfigRepository::new(&db).unwrap()),
            control: Arc::new(TaskControl::new(TaskRepository::new(&db).unwrap())),
            registry: Arc::new(ScraperRegistry::builtin()),
            vault,
            script,
            db,
            dir,
        }
    }

    pub fn extractor(&self) -> Arc<ProcessExtractor> {
        Arc::new(ProcessExtractor::new(
            self.tenants.clone(),
            self.processes.clone(),
            self.control.clone(),
            self.registry.clone(),
            self.provider.clone(),
            self.vault.clone(),
            self.sink.clone(),
            5,
            Duration::from_secs(60),
        ))
    }

    pub fn downloader(&self) -> DocumentDownloader {
        DocumentDownloader::new(
            self.tenants.clone(),
            self.processes.clone(),
            self.history.clone(),
            self.control.clone(),
            self.registry.clone(),
            self.provider.clone(),
            self.vault.clone(),
            Some(self.store.clone()),
            Duration::from_secs(60),
        )
    }

    pub fn downloader_without_store(&self) -> DocumentDownloader {
        DocumentDownloader::new(
            self.tenants.clone(),
            self.processes.clone(),
            self.history.clone(),
            self.control.clone(),
            self.registry.clone(),
            self.provider.clone(),
            self.vault.clone(),
            None,
            Duration::from_secs(60),
        )
    }
}

/// An Order/Petition pair matching the fresh-extraction seed.
pub fn seed_documents() -> Vec<ObservedDocument> {
    vec![
        ObservedDocument {
            number: "10000001".to_string(),
            doc_type: "Order".to_string(),
            date: "01/07/2024".to_string(),
            signer: Some("Dr. Silva".to_string()),
        },
        ObservedDocument {
            number: "10000002".to_string(),
            doc_type: "Petition".to_string(),
            date: "02/07/2024".to_string(),
            signer: None,
        },
    ]
}
