//! v4 family defaults: the behavior shared by every 4.x upstream release.
//!
//! Version-specific plugins embed a [`V4Family`] value and delegate to it,
//! overriding individual operations (usually just selectors) where a release
//! moved things around.

mod v4_2_0;

pub use v4_2_0::SeiV4_2_0;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::Page;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;

use super::selectors::{DocumentSelectors, ProcessSelectors, SelectorTables};
use super::ProcessListing;
use crate::error::{Result, ScrapeError};
use crate::models::{is_valid_document_number, AccessType, ObservedDocument};

/// How long family operations wait for page elements. The session layer
/// enforces the configurable navigation timeout around every plugin call;
/// this is only the inner polling ceiling.
const ELEMENT_WAIT: Duration = Duration::from_secs(30);
const ELEMENT_POLL: Duration = Duration::from_millis(250);

/// Ceiling for a triggered download to land on disk.
const DOWNLOAD_WAIT: Duration = Duration::from_secs(120);
const DOWNLOAD_POLL: Duration = Duration::from_millis(200);

fn link_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"id_procedimento_externo=([^&]+)").unwrap())
}

fn version_marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"SEI[^0-9]{0,20}(\d+\.\d+\.\d+)").unwrap())
}

fn css(selector: &str) -> Result<Selector> {
    Selector::parse(selector)
        .map_err(|e| ScrapeError::Plugin(format!("invalid selector '{selector}': {e}")))
}

/// Extract the access-link id from a listing href.
pub fn normalize_link(href: &str) -> Option<String> {
    link_id_regex()
        .captures(href)
        .map(|caps| caps[1].to_string())
}

/// Parse the process listing table out of a page snapshot.
pub fn parse_process_listing(
    html: &str,
    selectors: &ProcessSelectors,
) -> Result<Vec<ProcessListing>> {
    let document = Html::parse_document(html);
    let row_sel = css(selectors.rows)?;
    let link_sel = css(selectors.row_link)?;
    let unit_sel = css(selectors.row_unit)?;

    let mut listings = Vec::new();
    for row in document.select(&row_sel) {
        let Some(anchor) = row.select(&link_sel).next() else {
            continue;
        };
        let process_number = anchor.text().collect::<String>().trim().to_string();
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Some(link_id) = normalize_link(href) else {
            continue;
        };
        if process_number.is_empty() {
            continue;
        }

        let unit = row
            .select(&unit_sel)
            .next()
            .map(|cell| cell.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty());

        listings.push(ProcessListing {
            process_number,
            link_id,
            unit,
        });
    }
    Ok(listings)
}

/// Classify the access level from the location-bar text.
pub fn classify_location(text: &str, selectors: &ProcessSelectors) -> AccessType {
    if selectors.integral_markers.iter().any(|m| text.contains(m)) {
        AccessType::Integral
    } else if selectors.partial_markers.iter().any(|m| text.contains(m)) {
        AccessType::Partial
    } else {
        AccessType::Error
    }
}

/// The authority cell reads `"UNIT - ROLE - Name"`; keep the name part.
pub fn parse_authority_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parts: Vec<&str> = trimmed.split('-').collect();
    let picked = match parts.len() {
        0 | 1 => trimmed,
        2 => parts[1],
        _ => parts[2],
    };
    let picked = picked.trim();
    (!picked.is_empty()).then(|| picked.to_string())
}

/// Parse the document table out of a process-view snapshot.
///
/// Rows whose anchor carries an `onclick` alert are access-restricted and
/// skipped, as are rows without a valid 8-digit number. The table exposes no
/// signatory column, so `signer` is left unset.
pub fn parse_documents(html: &str, selectors: &DocumentSelectors) -> Result<Vec<ObservedDocument>> {
    let document = Html::parse_document(html);
    let row_sel = css(selectors.rows)?;
    let link_sel = css(selectors.number_link)?;
    let type_sel = css(selectors.type_cell)?;
    let date_sel = css(selectors.date_cell)?;

    let mut documents = Vec::new();
    for row in document.select(&row_sel) {
        let Some(anchor) = row.select(&link_sel).next() else {
            continue;
        };
        if anchor
            .value()
            .attr("onclick")
            .is_some_and(|js| js.contains("alert("))
        {
            continue;
        }

        let number = anchor.text().collect::<String>().trim().to_string();
        if !is_valid_document_number(&number) {
            continue;
        }

        let cell_text = |sel: &Selector| {
            row.select(sel)
                .next()
                .map(|cell| cell.text().collect::<String>().trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let (Some(doc_type), Some(date)) = (cell_text(&type_sel), cell_text(&date_sel)) else {
            continue;
        };

        documents.push(ObservedDocument {
            number,
            doc_type,
            date,
            signer: None,
        });
    }
    Ok(documents)
}

/// Shared v4 behavior, embedded by concrete version plugins.
pub struct V4Family {
    selectors: SelectorTables,
}

impl V4Family {
    pub fn new(selectors: SelectorTables) -> Self {
        Self { selectors }
    }

    pub fn selectors(&self) -> &SelectorTables {
        &self.selectors
    }

    pub fn process_list_path(&self) -> &'static str {
        "/controlador.php?acao=procedimento_controlar"
    }

    pub fn process_url(&self, base_url: &str, link_id: &str) -> String {
        format!(
            "{}/controlador_externo.php?acao=procedimento_visualizar&id_procedimento_externo={}",
            base_url.trim_end_matches('/'),
            link_id
        )
    }

    /// Poll for a selector until it appears or [`ELEMENT_WAIT`] elapses.
    async fn wait_for_selector(&self, page: &Page, selector: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + ELEMENT_WAIT;
        loop {
            if page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ScrapeError::Navigation(format!(
                    "timed out waiting for selector '{selector}'"
                )));
            }
            tokio::time::sleep(ELEMENT_POLL).await;
        }
    }

    async fn page_content(&self, page: &Page) -> Result<String> {
        page.content()
            .await
            .map_err(|e| ScrapeError::Navigation(format!("could not read page content: {e}")))
    }

    pub async fn detect_version(&self, page: &Page) -> Result<Option<String>> {
        let content = self.page_content(page).await?;
        Ok(version_marker_regex()
            .captures(&content)
            .map(|caps| caps[1].to_string()))
    }

    pub async fn login(&self, page: &Page, email: &str, password: &str) -> Result<()> {
        let login = &self.selectors.login;
        self.wait_for_selector(page, login.email).await?;

        let fill = |selector: &'static str, value: String| async move {
            let element = page
                .find_element(selector)
                .await
                .map_err(|e| ScrapeError::Navigation(format!("login field '{selector}': {e}")))?;
            element
                .click()
                .await
                .map_err(|e| ScrapeError::Navigation(format!("focus '{selector}': {e}")))?;
            element
                .type_str(value)
                .await
                .map_err(|e| ScrapeError::Navigation(format!("type into '{selector}': {e}")))?;
            Ok::<_, ScrapeError>(())
        };
        fill(login.email, email.to_string()).await?;
        fill(login.password, password.to_string()).await?;

        page.find_element(login.submit)
            .await
            .map_err(|e| ScrapeError::Navigation(format!("login submit: {e}")))?
            .click()
            .await
            .map_err(|e| ScrapeError::Navigation(format!("login submit click: {e}")))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| ScrapeError::Navigation(format!("post-login navigation: {e}")))?;

        if let Ok(error_el) = page.find_element(login.error).await {
            let message = error_el
                .inner_text()
                .await
                .ok()
                .flatten()
                .unwrap_or_default();
            let message = message.trim();
            if !message.is_empty() {
                return Err(ScrapeError::Auth(format!("upstream rejected login: {message}")));
            }
        }
        if !self.is_logged_in(page).await? {
            return Err(ScrapeError::Auth("login verification failed".into()));
        }
        Ok(())
    }

    pub async fn is_logged_in(&self, page: &Page) -> Result<bool> {
        Ok(page.find_element(self.selectors.login.logged_in).await.is_ok())
    }

    pub async fn list_processes(&self, page: &Page) -> Result<Vec<ProcessListing>> {
        self.wait_for_selector(page, self.selectors.process.table).await?;
        let content = self.page_content(page).await?;
        parse_process_listing(&content, &self.selectors.process)
    }

    pub async fn open_process(&self, page: &Page, base_url: &str, link_id: &str) -> Result<()> {
        let url = self.process_url(base_url, link_id);
        page.goto(url.as_str())
            .await
            .map_err(|e| ScrapeError::Navigation(format!("open process view: {e}")))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| ScrapeError::Navigation(format!("process view load: {e}")))?;
        self.wait_for_selector(page, self.selectors.document.table)
            .await
    }

    pub async fn classify_access(&self, page: &Page) -> Result<AccessType> {
        let Ok(bar) = page.find_element(self.selectors.process.location_bar).await else {
            return Ok(AccessType::Error);
        };
        let text = bar.inner_text().await.ok().flatten().unwrap_or_default();
        Ok(classify_location(&text, &self.selectors.process))
    }

    pub async fn extract_authority(&self, page: &Page) -> Result<Option<String>> {
        let Ok(cell) = page.find_element(self.selectors.process.authority).await else {
            return Ok(None);
        };
        let text = cell.inner_text().await.ok().flatten().unwrap_or_default();
        Ok(parse_authority_text(&text))
    }

    pub async fn list_documents(&self, page: &Page) -> Result<Vec<ObservedDocument>> {
        self.wait_for_selector(page, self.selectors.document.table)
            .await?;
        let content = self.page_content(page).await?;
        parse_documents(&content, &self.selectors.document)
    }

    /// Trigger a download through the document anchor. The upstream serves
    /// the raw file on an Alt-modified click.
    pub async fn download_document(
        &self,
        page: &Page,
        doc_number: &str,
        download_dir: &Path,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(download_dir).map_err(|e| {
            ScrapeError::Plugin(format!("could not create download dir: {e}"))
        })?;

        page.execute(
            SetDownloadBehaviorParams::builder()
                .behavior(SetDownloadBehaviorBehavior::Allow)
                .download_path(download_dir.to_string_lossy().to_string())
                .build()
                .map_err(ScrapeError::Plugin)?,
        )
        .await
        .map_err(|e| ScrapeError::Navigation(format!("set download behavior: {e}")))?;

        let before = list_files(download_dir);

        let clicked: bool = page
            .evaluate(alt_click_script(self.selectors.document.table, doc_number))
            .await
            .map_err(|e| ScrapeError::Navigation(format!("trigger download: {e}")))?
            .into_value()
            .map_err(|e| ScrapeError::Plugin(format!("download trigger result: {e}")))?;
        if !clicked {
            return Err(ScrapeError::Plugin(format!(
                "document anchor {doc_number} not found on process view"
            )));
        }

        self.wait_for_download(download_dir, &before).await
    }

    /// Wait for a new, fully written file to appear in the download dir.
    async fn wait_for_download(
        &self,
        download_dir: &Path,
        before: &[PathBuf],
    ) -> Result<PathBuf> {
        let deadline = tokio::time::Instant::now() + DOWNLOAD_WAIT;
        let mut last_size: Option<(PathBuf, u64)> = None;

        loop {
            let candidate = list_files(download_dir)
                .into_iter()
                .find(|p| !before.contains(p) && !is_in_progress(p));

            if let Some(path) = candidate {
                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                match &last_size {
                    // Two consecutive equal sizes: the write has settled.
                    Some((prev_path, prev_size)) if *prev_path == path && *prev_size == size => {
                        debug!(file = %path.display(), size, "download landed");
                        return Ok(path);
                    }
                    _ => last_size = Some((path, size)),
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ScrapeError::Navigation(
                    "timed out waiting for download to finish".into(),
                ));
            }
            tokio::time::sleep(DOWNLOAD_POLL).await;
        }
    }
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect()
        })
        .unwrap_or_default()
}

fn is_in_progress(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("crdownload") | Some("tmp") | Some("part")
    )
}

fn alt_click_script(table_selector: &str, doc_number: &str) -> String {
    format!(
        r#"(() => {{
            const table = document.querySelector('{table_selector}');
            if (!table) return false;
            const anchor = Array.from(table.querySelectorAll('a'))
                .find(a => a.textContent.trim() === '{doc_number}');
            if (!anchor) return false;
            anchor.dispatchEvent(new MouseEvent('click', {{
                bubbles: true, cancelable: true, altKey: true
            }}));
            return true;
        }})()"#
    )
}
