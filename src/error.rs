//! Error taxonomy for the extraction and download pipelines.
//!
//! Per-process errors are caught at the worker boundary and accumulated into
//! the task summary; run-level errors (`Config`, exhausted auth) propagate out
//! of the fan-out and fail the task.

use thiserror::Error;

/// Pipeline stage, attached to worker-boundary log context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Login,
    Discovery,
    Navigation,
    Classification,
    DocumentListing,
    Download,
    Conversion,
    Upload,
    Persistence,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Discovery => "discovery",
            Self::Navigation => "navigation",
            Self::Classification => "classification",
            Self::DocumentListing => "document_listing",
            Self::Download => "download",
            Self::Conversion => "conversion",
            Self::Upload => "upload",
            Self::Persistence => "persistence",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the scraping pipeline.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// Bad credentials or an expired session. One re-login is attempted;
    /// a second failure is fatal to the run.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network failure, navigation timeout, or an unexpected page. Retried
    /// once per process, then the attempted link is marked inactive.
    #[error("navigation failed: {0}")]
    Navigation(String),

    /// A selector missed or the classifier could not make sense of the page.
    /// Fatal to the affected process only.
    #[error("scraper plugin error: {0}")]
    Plugin(String),

    /// Object-store upload failure. The document keeps its bytes locally and
    /// is recorded as `partial` so a later run can finish the upload.
    #[error("object store error: {0}")]
    Storage(String),

    /// Database commit failure. The per-process transaction rolls back.
    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// Missing tenant, unregistered scraper version, missing encryption key.
    /// Fatal to the whole run.
    #[error("configuration error: {0}")]
    Config(String),

    /// The run was cancelled through its abort signal.
    #[error("cancelled")]
    Cancelled,
}

impl ScrapeError {
    /// Whether this error terminates the whole run rather than one process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Cancelled)
    }
}

impl From<serde_json::Error> for ScrapeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(rusqlite::Error::ToSqlConversionFailure(Box::new(err)))
    }
}

pub type Result<T> = std::result::Result<T, ScrapeError>;
