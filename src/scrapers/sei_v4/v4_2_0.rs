//! Upstream release 4.2.0, the version most production tenants run.
//!
//! 4.2.0 matches the family defaults everywhere; it exists as its own plugin
//! so operators pin tenants to an exact version string and later releases can
//! override selectors without touching this one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chromiumoxide::Page;

use super::V4Family;
use crate::error::Result;
use crate::models::{AccessType, ObservedDocument};
use crate::scrapers::selectors::{SelectorTables, V4_SELECTORS};
use crate::scrapers::{ProcessListing, ScraperPlugin, VersionInfo};

#[allow(non_camel_case_types)]
pub struct SeiV4_2_0 {
    family: V4Family,
}

impl SeiV4_2_0 {
    pub fn new() -> Self {
        Self {
            family: V4Family::new(V4_SELECTORS),
        }
    }
}

impl Default for SeiV4_2_0 {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScraperPlugin for SeiV4_2_0 {
    fn version_info(&self) -> VersionInfo {
        VersionInfo {
            version: "4.2.0",
            family: "v4",
            description: "Upstream 4.2.0 (production default)",
        }
    }

    fn selectors(&self) -> &SelectorTables {
        self.family.selectors()
    }

    async fn detect_version(&self, page: &Page) -> Result<Option<String>> {
        self.family.detect_version(page).await
    }

    async fn login(&self, page: &Page, email: &str, password: &str) -> Result<()> {
        self.family.login(page, email, password).await
    }

    async fn is_logged_in(&self, page: &Page) -> Result<bool> {
        self.family.is_logged_in(page).await
    }

    fn process_list_path(&self) -> &'static str {
        self.family.process_list_path()
    }

    fn process_url(&self, base_url: &str, link_id: &str) -> String {
        self.family.process_url(base_url, link_id)
    }

    async fn list_processes(&self, page: &Page) -> Result<Vec<ProcessListing>> {
        self.family.list_processes(page).await
    }

    async fn open_process(&self, page: &Page, base_url: &str, link_id: &str) -> Result<()> {
        self.family.open_process(page, base_url, link_id).await
    }

    async fn classify_access(&self, page: &Page) -> Result<AccessType> {
        self.family.classify_access(page).await
    }

    async fn extract_authority(&self, page: &Page) -> Result<Option<String>> {
        self.family.extract_authority(page).await
    }

    async fn list_documents(&self, page: &Page) -> Result<Vec<ObservedDocument>> {
        self.family.list_documents(page).await
    }

    async fn download_document(
        &self,
        page: &Page,
        doc_number: &str,
        download_dir: &Path,
    ) -> Result<PathBuf> {
        self.family.download_document(page, doc_number, download_dir).await
    }
}
