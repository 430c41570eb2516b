//! Object store client for archived documents.
//!
//! Documents live in an S3-compatible bucket under the canonical path
//! `{tenant_id}/{process_number}/{document_number}.pdf`. The client is a
//! process-wide singleton behind a guarded one-time initialization: the fast
//! path after the first call takes no lock. When initialization fails (e.g.
//! missing credentials) the downloader keeps running and records `partial`
//! statuses instead of failing documents outright.

use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::config::Settings;
use crate::error::{Result, ScrapeError};

/// Canonical blob path for a document.
pub fn blob_path(tenant_id: &str, process_number: &str, document_number: &str) -> String {
    format!("{tenant_id}/{process_number}/{document_number}.pdf")
}

/// Minimal object-store surface the downloader needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload bytes to `path`. Returns `false` when the store refused the
    /// write without erroring (the caller records `partial`).
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<bool>;

    /// Delete the object at `path`. Returns whether anything was removed.
    async fn delete(&self, path: &str) -> Result<bool>;

    /// Public URL of the object at `path`.
    fn url_for(&self, path: &str) -> String;
}

/// S3-backed object store.
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    endpoint: Option<String>,
}

impl S3ObjectStore {
    /// Build a client from settings. Fails on missing configuration.
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let bucket = settings
            .object_store_bucket
            .clone()
            .ok_or_else(|| ScrapeError::Storage("OBJECT_STORE_BUCKET is not set".into()))?;
        let access_key = settings
            .object_store_access_key
            .clone()
            .ok_or_else(|| ScrapeError::Storage("OBJECT_STORE_ACCESS_KEY is not set".into()))?;
        let secret_key = settings
            .object_store_secret_key
            .clone()
            .ok_or_else(|| ScrapeError::Storage("OBJECT_STORE_SECRET_KEY is not set".into()))?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region("auto")
            .credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key, secret_key, None, None, "static",
            ));
        if let Some(endpoint) = &settings.object_store_endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;

        Ok(Self {
            client: S3Client::new(&config),
            bucket,
            endpoint: settings.object_store_endpoint.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<bool> {
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .content_type("application/pdf")
            .body(ByteStream::from(bytes))
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(path, "uploaded document to bucket");
                Ok(true)
            }
            Err(e) => {
                error!(path, "upload failed: {e}");
                Ok(false)
            }
        }
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map(|_| true)
            .map_err(|e| ScrapeError::Storage(format!("delete {path}: {e}")))
    }

    fn url_for(&self, path: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, path),
            None => format!("https://{}.s3.amazonaws.com/{}", self.bucket, path),
        }
    }
}

static STORE: OnceCell<Option<Arc<S3ObjectStore>>> = OnceCell::const_new();

/// Initialize the shared store once and return it on every later call
/// without locking. `None` means the store is unavailable for this process
/// lifetime and uploads are deferred.
pub async fn shared_store(settings: &Settings) -> Option<Arc<dyn ObjectStore>> {
    let slot = STORE
        .get_or_init(|| async {
            if !settings.object_store_configured() {
                info!("object store not configured; uploads will be deferred");
                return None;
            }
            match S3ObjectStore::from_settings(settings).await {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    error!("object store initialization failed: {e}");
                    None
                }
            }
        })
        .await;
    slot.clone().map(|s| s as Arc<dyn ObjectStore>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_path_layout() {
        assert_eq!(
            blob_path("t1", "12345.001234/2024-56", "10000001"),
            "t1/12345.001234/2024-56/10000001.pdf"
        );
    }

    #[tokio::test]
    async fn from_settings_requires_configuration() {
        let settings = Settings::default();
        assert!(matches!(
            S3ObjectStore::from_settings(&settings).await,
            Err(ScrapeError::Storage(_))
        ));
    }
}
