//! Browser session pool over chromiumoxide (CDP).
//!
//! One headless browser process is shared by every worker; each acquired
//! session owns its own page (browser context) and is not safe for concurrent
//! use. Release is guaranteed on all exit paths: dropping a session closes
//! its page even when the owning worker unwinds.

mod session;

pub use session::PooledSession;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::{Result, ScrapeError};
use crate::models::{AccessType, Credentials, ObservedDocument, Tenant};
use crate::scrapers::{ProcessListing, ScraperPlugin};

/// One logged-in view of a tenant's upstream account. Held by exactly one
/// worker for its lifetime.
#[async_trait]
pub trait UpstreamSession: Send {
    /// Navigate to the process listing and enumerate it.
    async fn list_processes(&mut self) -> Result<Vec<ProcessListing>>;

    /// Navigate to a process view through the given access link.
    async fn open_process(&mut self, link_id: &str) -> Result<()>;

    /// Classify the access level of the currently open process view.
    async fn classify_access(&mut self) -> Result<AccessType>;

    /// Authority string from the open process view, if present.
    async fn extract_authority(&mut self) -> Result<Option<String>>;

    /// Document records from the open process view.
    async fn list_documents(&mut self) -> Result<Vec<ObservedDocument>>;

    /// Download one document from the open process view into `download_dir`,
    /// converting HTML payloads to PDF and renaming bare-number files.
    /// Returns the final file path.
    async fn download_document(
        &mut self,
        doc_number: &str,
        doc_type: &str,
        download_dir: &std::path::Path,
    ) -> Result<PathBuf>;

    /// Close the session. Idempotent; also runs on drop.
    async fn close(&mut self);
}

/// Hands out logged-in sessions. The production implementation is
/// [`BrowserPool`]; tests substitute scripted sessions.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn acquire(
        &self,
        tenant: &Tenant,
        credentials: &Credentials,
        plugin: Arc<dyn ScraperPlugin>,
    ) -> Result<Box<dyn UpstreamSession>>;
}

/// Browser binary names probed on extraction hosts, preferred order.
const BROWSER_BINARIES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome-stable",
    "google-chrome",
];

/// Directories those binaries typically land in on the worker images.
const BROWSER_DIRS: &[&str] = &["/usr/bin", "/usr/local/bin", "/snap/bin", "/opt/google/chrome"];

/// Shared headless-browser pool.
pub struct BrowserPool {
    nav_timeout: Duration,
    /// Operator-pinned browser binary (`BROWSER_EXECUTABLE`). When unset,
    /// well-known locations and `PATH` are probed.
    executable: Option<PathBuf>,
    browser: OnceCell<Browser>,
}

impl BrowserPool {
    pub fn new(nav_timeout: Duration, executable: Option<PathBuf>) -> Self {
        Self {
            nav_timeout,
            executable,
            browser: OnceCell::new(),
        }
    }

    pub fn nav_timeout(&self) -> Duration {
        self.nav_timeout
    }

    fn locate_browser(&self) -> Result<PathBuf> {
        // A pinned binary is authoritative: a bad pin is a configuration
        // error, not a reason to fall back to probing.
        if let Some(pinned) = &self.executable {
            if pinned.exists() {
                return Ok(pinned.clone());
            }
            return Err(ScrapeError::Config(format!(
                "BROWSER_EXECUTABLE points at {}, which does not exist",
                pinned.display()
            )));
        }

        for name in BROWSER_BINARIES {
            for dir in BROWSER_DIRS {
                let candidate = std::path::Path::new(dir).join(name);
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }
        if let Some(found) = BROWSER_BINARIES.iter().find_map(|name| which(name)) {
            return Ok(found);
        }

        Err(ScrapeError::Config(
            "no Chromium binary found on this host; install chromium on the worker image \
             or pin one with BROWSER_EXECUTABLE"
                .into(),
        ))
    }

    /// Launch the shared browser on first use.
    async fn browser(&self) -> Result<&Browser> {
        self.browser
            .get_or_try_init(|| async {
                let chrome_path = self.locate_browser()?;
                info!(path = %chrome_path.display(), "launching headless browser");

                let config = BrowserConfig::builder()
                    .chrome_executable(chrome_path)
                    .arg("--disable-blink-features=AutomationControlled")
                    .arg("--disable-dev-shm-usage")
                    .arg("--no-first-run")
                    .arg("--no-default-browser-check")
                    .arg("--disable-background-networking")
                    .arg("--no-sandbox")
                    .arg("--disable-gpu")
                    .build()
                    .map_err(|e| ScrapeError::Config(format!("browser config: {e}")))?;

                let (browser, mut handler) = Browser::launch(config)
                    .await
                    .map_err(|e| ScrapeError::Config(format!("browser launch failed: {e}")))?;

                tokio::spawn(async move {
                    while let Some(event) = handler.next().await {
                        if event.is_err() {
                            break;
                        }
                    }
                });

                Ok(browser)
            })
            .await
    }

    /// Create a fresh page with dialog auto-dismissal armed.
    async fn new_page(&self) -> Result<Page> {
        let browser = self.browser().await?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScrapeError::Navigation(format!("could not open page: {e}")))?;
        session::dismiss_dialogs(&page).await;
        Ok(page)
    }
}

#[async_trait]
impl SessionProvider for BrowserPool {
    async fn acquire(
        &self,
        tenant: &Tenant,
        credentials: &Credentials,
        plugin: Arc<dyn ScraperPlugin>,
    ) -> Result<Box<dyn UpstreamSession>> {
        let page = self.new_page().await?;

        let result = establish(
            &page,
            tenant,
            credentials,
            plugin.clone(),
            self.nav_timeout,
        )
        .await;

        match result {
            Ok(()) => Ok(Box::new(PooledSession::new(
                page,
                plugin,
                tenant.upstream_url.clone(),
                self.nav_timeout,
            ))),
            Err(e) => {
                let _ = page.close().await;
                Err(e)
            }
        }
    }
}

/// Navigate to the upstream origin and log in, retrying auth exactly once.
async fn establish(
    page: &Page,
    tenant: &Tenant,
    credentials: &Credentials,
    plugin: Arc<dyn ScraperPlugin>,
    nav_timeout: Duration,
) -> Result<()> {
    with_nav_timeout(nav_timeout, async {
        page.goto(tenant.upstream_url.as_str())
            .await
            .map_err(|e| ScrapeError::Navigation(format!("open upstream origin: {e}")))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| ScrapeError::Navigation(format!("upstream origin load: {e}")))?;
        Ok(())
    })
    .await?;

    // Pages share the browser's cookie jar, so a session opened after the
    // first login is usually authenticated already.
    if plugin.is_logged_in(page).await.unwrap_or(false) {
        return Ok(());
    }

    let login = with_nav_timeout(
        nav_timeout,
        plugin.login(page, &credentials.email, &credentials.password),
    )
    .await;

    match login {
        Ok(()) => Ok(()),
        Err(ScrapeError::Auth(first)) => {
            warn!(tenant_id = %tenant.id, "login failed, retrying once");
            with_nav_timeout(
                nav_timeout,
                plugin.login(page, &credentials.email, &credentials.password),
            )
            .await
            .map_err(|_| ScrapeError::Auth(format!("login failed twice: {first}")))
        }
        Err(e) => Err(e),
    }
}

/// Resolve a command through `PATH`.
fn which(command: &str) -> Option<PathBuf> {
    let output = std::process::Command::new("which")
        .arg(command)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

/// Bound a navigation-shaped future by the configured timeout.
pub(crate) async fn with_nav_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T>> + Send,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ScrapeError::Navigation(format!("navigation timed out after {timeout:?}")))?
}
