//! A pooled browser session bound to one tenant login.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::{
    EventJavascriptDialogOpening, HandleJavaScriptDialogParams, PrintToPdfParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use tracing::{debug, warn};

use super::{with_nav_timeout, UpstreamSession};
use crate::error::{Result, ScrapeError};
use crate::models::{AccessType, ObservedDocument};
use crate::scrapers::{ProcessListing, ScraperPlugin};
use crate::utils::files::{describe_filename, is_html_file};

/// Auto-dismiss any JavaScript dialog the page opens; an unanswered dialog
/// hangs every subsequent navigation.
pub(super) async fn dismiss_dialogs(page: &Page) {
    let Ok(mut events) = page.event_listener::<EventJavascriptDialogOpening>().await else {
        warn!("could not attach dialog listener");
        return;
    };
    let handler_page = page.clone();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            debug!(message = %event.message, "dismissing upstream dialog");
            if handler_page
                .execute(HandleJavaScriptDialogParams::new(false))
                .await
                .is_err()
            {
                break;
            }
        }
    });
}

/// Production [`UpstreamSession`] backed by one chromiumoxide page.
pub struct PooledSession {
    page: Page,
    plugin: Arc<dyn ScraperPlugin>,
    base_url: String,
    nav_timeout: Duration,
    closed: bool,
}

impl PooledSession {
    pub(super) fn new(
        page: Page,
        plugin: Arc<dyn ScraperPlugin>,
        base_url: String,
        nav_timeout: Duration,
    ) -> Self {
        Self {
            page,
            plugin,
            base_url,
            nav_timeout,
            closed: false,
        }
    }

    /// Render an HTML download to PDF in this same browser context and
    /// remove the original file.
    async fn convert_html_to_pdf(&self, html_path: &Path) -> Result<PathBuf> {
        let pdf_path = html_path.with_extension("pdf");
        let file_url = format!("file://{}", html_path.display());

        with_nav_timeout(self.nav_timeout, async {
            self.page
                .goto(file_url.as_str())
                .await
                .map_err(|e| ScrapeError::Navigation(format!("open downloaded HTML: {e}")))?;
            self.page
                .wait_for_navigation()
                .await
                .map_err(|e| ScrapeError::Navigation(format!("downloaded HTML load: {e}")))?;
            Ok(())
        })
        .await?;

        self.page
            .save_pdf(PrintToPdfParams::default(), &pdf_path)
            .await
            .map_err(|e| ScrapeError::Plugin(format!("HTML to PDF conversion failed: {e}")))?;

        if let Err(e) = std::fs::remove_file(html_path) {
            warn!(file = %html_path.display(), "could not remove converted HTML: {e}");
        }
        Ok(pdf_path)
    }
}

#[async_trait]
impl UpstreamSession for PooledSession {
    async fn list_processes(&mut self) -> Result<Vec<ProcessListing>> {
        let url = format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.plugin.process_list_path()
        );
        with_nav_timeout(self.nav_timeout, async {
            self.page
                .goto(url.as_str())
                .await
                .map_err(|e| ScrapeError::Navigation(format!("open process listing: {e}")))?;
            self.page
                .wait_for_navigation()
                .await
                .map_err(|e| ScrapeError::Navigation(format!("process listing load: {e}")))?;
            Ok(())
        })
        .await?;
        self.plugin.list_processes(&self.page).await
    }

    async fn open_process(&mut self, link_id: &str) -> Result<()> {
        with_nav_timeout(
            self.nav_timeout,
            self.plugin.open_process(&self.page, &self.base_url, link_id),
        )
        .await
    }

    async fn classify_access(&mut self) -> Result<AccessType> {
        self.plugin.classify_access(&self.page).await
    }

    async fn extract_authority(&mut self) -> Result<Option<String>> {
        self.plugin.extract_authority(&self.page).await
    }

    async fn list_documents(&mut self) -> Result<Vec<ObservedDocument>> {
        self.plugin.list_documents(&self.page).await
    }

    async fn download_document(
        &mut self,
        doc_number: &str,
        doc_type: &str,
        download_dir: &Path,
    ) -> Result<PathBuf> {
        let captured = self
            .plugin
            .download_document(&self.page, doc_number, download_dir)
            .await?;

        // Bare-number filenames gain the document type before conversion so
        // the converted PDF keeps the descriptive name.
        let file_name = captured
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(doc_number);
        let described = describe_filename(file_name, doc_type);
        let final_path = if described != file_name {
            let renamed = captured.with_file_name(&described);
            std::fs::rename(&captured, &renamed)
                .map_err(|e| ScrapeError::Plugin(format!("rename download: {e}")))?;
            renamed
        } else {
            captured
        };

        if is_html_file(&final_path) {
            self.convert_html_to_pdf(&final_path).await
        } else {
            Ok(final_path)
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.page.clone().close().await;
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        // Workers close explicitly; this covers panics and early returns.
        if !self.closed {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let page = self.page.clone();
                handle.spawn(async move {
                    let _ = page.close().await;
                });
            }
        }
    }
}
