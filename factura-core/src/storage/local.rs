use super::{ArtifactError, PdfStorage, StoredObject};
use crate::config::Config;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Stores PDFs in a directory served under `base_url`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub exists: bool,
    pub size: Option<u64>,
    pub path: Option<PathBuf>,
}

impl LocalStorage {
    /// Creates `root` if it does not exist.
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Result<Self, ArtifactError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            ArtifactError::Io(format!("cannot create {}: {e}", root.display()))
        })?;
        Ok(Self {
            root,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ArtifactError> {
        Self::new(config.pdf_storage_path(), config.pdf_base_url())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, public_id: &str) -> PathBuf {
        self.root.join(format!("{}.pdf", sanitize_file_name(public_id)))
    }

    pub fn file_info(&self, public_id: &str) -> FileInfo {
        let path = self.file_path(public_id);
        match std::fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => FileInfo {
                exists: true,
                size: Some(metadata.len()),
                path: Some(path),
            },
            _ => FileInfo {
                exists: false,
                size: None,
                path: None,
            },
        }
    }
}

/// Strip a trailing `.pdf` and replace anything outside `[A-Za-z0-9_-]`
/// with `_`.
///
/// # Examples
/// ```rust
/// use factura_core::storage::local::sanitize_file_name;
///
/// assert_eq!(sanitize_file_name("../factura 001.PDF"), "___factura_001");
/// ```
pub fn sanitize_file_name(name: &str) -> String {
    let stem = match name.len().checked_sub(4) {
        Some(cut) if name.is_char_boundary(cut) && name[cut..].eq_ignore_ascii_case(".pdf") => {
            &name[..cut]
        }
        _ => name,
    };
    stem.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl PdfStorage for LocalStorage {
    async fn upload(&self, bytes: Vec<u8>, name: &str) -> Result<StoredObject, ArtifactError> {
        let public_id = sanitize_file_name(name);
        let path = self.file_path(&public_id);
        let size = bytes.len() as u64;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ArtifactError::Io(format!("cannot write {}: {e}", path.display())))?;
        debug!(path = %path.display(), size, "PDF stored locally");
        Ok(StoredObject {
            url: self.public_url(&public_id),
            public_id,
            size,
            provider: self.provider_name().to_string(),
        })
    }

    async fn delete(&self, public_id: &str) -> bool {
        let path = self.file_path(public_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not delete local PDF");
                false
            }
        }
    }

    fn public_url(&self, public_id: &str) -> String {
        format!("{}/{}.pdf", self.base_url, sanitize_file_name(public_id))
    }

    fn provider_name(&self) -> &'static str {
        "local"
    }
}
