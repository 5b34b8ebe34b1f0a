//! Object storage for rendered invoice PDFs.
//!
//! The provider is chosen once from [`Config`] by [`from_config`] and handed
//! to the components that upload files.
use crate::config::{Config, StorageProviderType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub mod cloudinary;
pub mod local;

pub use cloudinary::CloudinaryStorage;
pub use local::LocalStorage;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactError {
    #[error("PDF rendering failed: {0}")]
    Render(String),
    #[error("storage upload failed: {0}")]
    Upload(String),
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("storage misconfigured: {0}")]
    Config(String),
}

/// Where an uploaded file ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub url: String,
    pub public_id: String,
    pub size: u64,
    pub provider: String,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PdfStorage: Send + Sync {
    /// Store `bytes` under `name` (without extension).
    async fn upload(&self, bytes: Vec<u8>, name: &str) -> Result<StoredObject, ArtifactError>;

    /// Remove a stored file. `false` when it did not exist or could not be
    /// removed.
    async fn delete(&self, public_id: &str) -> bool;

    fn public_url(&self, public_id: &str) -> String;

    fn provider_name(&self) -> &'static str;
}

/// Build the configured storage provider.
///
/// `s3` and `azure` are accepted but not implemented; they fall back to
/// local storage with a warning.
///
/// # Errors
/// Returns [`ArtifactError::Config`] when Cloudinary credentials are
/// incomplete and [`ArtifactError::Io`] when the local directory cannot be
/// created.
pub fn from_config(config: &Config) -> Result<Arc<dyn PdfStorage>, ArtifactError> {
    let provider = config.storage_provider();
    match provider {
        StorageProviderType::Cloudinary => {
            info!(provider = provider.as_str(), "using PDF storage provider");
            Ok(Arc::new(CloudinaryStorage::new(config.cloudinary().clone())?))
        }
        StorageProviderType::Local => {
            info!(provider = provider.as_str(), "using PDF storage provider");
            Ok(Arc::new(LocalStorage::from_config(config)?))
        }
        StorageProviderType::S3 | StorageProviderType::Azure => {
            warn!(
                provider = provider.as_str(),
                "storage provider not implemented, using local storage"
            );
            Ok(Arc::new(LocalStorage::from_config(config)?))
        }
    }
}
