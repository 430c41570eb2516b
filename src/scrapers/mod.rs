//! Scraper plugins for the upstream system's many versions.
//!
//! Plugins share one capability interface ([`ScraperPlugin`]); a family-level
//! value carries the shared behavior and selectors, and version-specific
//! plugins embed it, overriding only what differs. The registry maps a
//! tenant's pinned version string to a plugin instance.

pub mod registry;
pub mod sei_v4;
pub mod selectors;

pub use registry::ScraperRegistry;
pub use selectors::{DocumentSelectors, LoginSelectors, ProcessSelectors, SelectorTables};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chromiumoxide::Page;

use crate::error::Result;
use crate::models::{AccessType, ObservedDocument};

/// Identity a plugin reports about itself.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub version: &'static str,
    pub family: &'static str,
    pub description: &'static str,
}

/// One entry from the process listing page: a process number together with
/// the normalized access-link id granting some view of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessListing {
    pub process_number: String,
    pub link_id: String,
    pub unit: Option<String>,
}

/// Version-agnostic capability interface every scraper plugin implements.
///
/// All operations observe the caller's navigation timeout through the page
/// they are handed; none of them retries internally.
#[async_trait]
pub trait ScraperPlugin: Send + Sync {
    fn version_info(&self) -> VersionInfo;

    /// Declarative selector tables driving this plugin.
    fn selectors(&self) -> &SelectorTables;

    /// Inspect a loaded page and report the upstream version, if this plugin
    /// recognizes it. Advisory only; used during onboarding.
    async fn detect_version(&self, page: &Page) -> Result<Option<String>>;

    /// Drive the login form. The caller has already navigated to the
    /// tenant's upstream origin.
    async fn login(&self, page: &Page, email: &str, password: &str) -> Result<()>;

    /// Whether the current session is authenticated.
    async fn is_logged_in(&self, page: &Page) -> Result<bool>;

    /// Path of the process listing page, relative to the upstream origin.
    fn process_list_path(&self) -> &'static str;

    /// Absolute URL of a process view, given its access-link id.
    fn process_url(&self, base_url: &str, link_id: &str) -> String;

    /// Enumerate the process listing page the caller navigated to.
    async fn list_processes(&self, page: &Page) -> Result<Vec<ProcessListing>>;

    /// Navigate to a process view and wait until its document table is ready.
    async fn open_process(&self, page: &Page, base_url: &str, link_id: &str) -> Result<()>;

    /// Classify the access level granted by the currently open process view.
    async fn classify_access(&self, page: &Page) -> Result<AccessType>;

    /// Authority string from the open process view, when present.
    async fn extract_authority(&self, page: &Page) -> Result<Option<String>>;

    /// Document records from the open process view.
    async fn list_documents(&self, page: &Page) -> Result<Vec<ObservedDocument>>;

    /// Trigger one document download on the open process view and return the
    /// downloaded file. Dialogs opened along the way are dismissed by the
    /// session owner.
    async fn download_document(
        &self,
        page: &Page,
        doc_number: &str,
        download_dir: &Path,
    ) -> Result<PathBuf>;
}
