//! Tenant model: one institution with its own upstream instance, scraper
//! version, and encrypted credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Plaintext upstream credentials. Exists only inside the pipeline process
/// for the duration of a single run; never serialized to logs or task rows.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

// Manual impl so accidental debug-formatting cannot leak secrets.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One administrative boundary with its own upstream URL and process corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub upstream_url: String,
    /// Operator-pinned scraper version (e.g. `"4.2.0"`). Auto-detection is
    /// advisory only.
    pub scraper_version: String,
    pub is_active: bool,
    /// Vault-encrypted credential payload; never logged in plaintext.
    #[serde(skip_serializing)]
    pub encrypted_credentials: Option<Vec<u8>>,
    pub extra_metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(id: &str, name: &str, upstream_url: &str, scraper_version: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            upstream_url: upstream_url.trim_end_matches('/').to_string(),
            scraper_version: scraper_version.to_string(),
            is_active: true,
            encrypted_credentials: None,
            extra_metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }
}
