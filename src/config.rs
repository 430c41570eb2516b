//! Environment-driven settings for the extraction service.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, ScrapeError};

/// Default number of parallel per-process workers.
pub const DEFAULT_WORKER_LIMIT: usize = 5;

/// Default browser navigation timeout.
pub const DEFAULT_NAV_TIMEOUT_MS: u64 = 30_000;

/// Default hard ceiling for a whole extraction run.
pub const DEFAULT_RUN_TIMEOUT_MS: u64 = 1_800_000;

/// Default grace period for draining in-flight jobs at shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 30_000;

/// Runtime settings, read once from the environment at startup and passed
/// down explicitly.
#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite database path (accepts a `sqlite:` prefix).
    pub database_url: String,
    /// S3-compatible endpoint for the document bucket. Optional: when absent
    /// the downloader still runs but records `partial` statuses.
    pub object_store_endpoint: Option<String>,
    pub object_store_access_key: Option<String>,
    pub object_store_secret_key: Option<String>,
    pub object_store_bucket: Option<String>,
    /// Key material for the credential vault. Either a base64-encoded 32-byte
    /// key or an arbitrary passphrase (stretched at load time).
    pub encryption_key: Option<String>,
    /// Operator-pinned browser binary; when unset the pool probes well-known
    /// locations on the worker image.
    pub browser_executable: Option<PathBuf>,
    /// Bounded parallelism for per-process workers.
    pub worker_limit: usize,
    pub nav_timeout: Duration,
    pub run_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "conectasei.db".to_string(),
            object_store_endpoint: None,
            object_store_access_key: None,
            object_store_secret_key: None,
            object_store_bucket: None,
            encryption_key: None,
            browser_executable: None,
            worker_limit: DEFAULT_WORKER_LIMIT,
            nav_timeout: Duration::from_millis(DEFAULT_NAV_TIMEOUT_MS),
            run_timeout: Duration::from_millis(DEFAULT_RUN_TIMEOUT_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_var("DATABASE_URL").unwrap_or(defaults.database_url),
            object_store_endpoint: env_var("OBJECT_STORE_ENDPOINT"),
            object_store_access_key: env_var("OBJECT_STORE_ACCESS_KEY"),
            object_store_secret_key: env_var("OBJECT_STORE_SECRET_KEY"),
            object_store_bucket: env_var("OBJECT_STORE_BUCKET"),
            encryption_key: env_var("SYMMETRIC_ENCRYPTION_KEY"),
            browser_executable: env_var("BROWSER_EXECUTABLE").map(PathBuf::from),
            worker_limit: env_parse("EXTRACTOR_WORKER_LIMIT", defaults.worker_limit),
            nav_timeout: Duration::from_millis(env_parse(
                "BROWSER_NAV_TIMEOUT_MS",
                DEFAULT_NAV_TIMEOUT_MS,
            )),
            run_timeout: Duration::from_millis(env_parse(
                "EXTRACTION_RUN_TIMEOUT_MS",
                DEFAULT_RUN_TIMEOUT_MS,
            )),
            shutdown_grace: Duration::from_millis(env_parse(
                "SCHEDULER_SHUTDOWN_GRACE_MS",
                DEFAULT_SHUTDOWN_GRACE_MS,
            )),
        }
    }

    /// Filesystem path of the SQLite database, with any `sqlite:` prefix
    /// stripped.
    pub fn database_path(&self) -> PathBuf {
        let url = self
            .database_url
            .strip_prefix("sqlite:")
            .unwrap_or(&self.database_url);
        PathBuf::from(url)
    }

    /// The encryption key is mandatory for any pipeline run that touches
    /// tenant credentials.
    pub fn require_encryption_key(&self) -> Result<&str> {
        self.encryption_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ScrapeError::Config("SYMMETRIC_ENCRYPTION_KEY is not set".into()))
    }

    /// Whether enough object-store configuration is present to attempt
    /// initialization.
    pub fn object_store_configured(&self) -> bool {
        self.object_store_bucket.is_some()
            && self.object_store_access_key.is_some()
            && self.object_store_secret_key.is_some()
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}
