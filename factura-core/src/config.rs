//! Configuration and environment selection.
//!
//! The SRI environment is a per-company setting
//! ([`crate::model::IssuingCompany::environment`]), not a process-wide one.
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

/// SRI environment a taxpayer emits into.
///
/// The numeric code is the `ambiente` digit embedded in every access key.
/// - Pruebas: the SRI test environment (`1`).
/// - Produccion: the live environment (`2`).
///
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use factura_core::config::EnvironmentType;
///
/// let env = EnvironmentType::from_str("produccion")?;
/// assert_eq!(env.code(), 2);
/// # Ok::<(), factura_core::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum EnvironmentType {
    Pruebas,
    Produccion,
}

/// Error returned when parsing an [`EnvironmentType`] from a string or code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment type: {input}")]
    Invalid { input: String },
}

impl FromStr for EnvironmentType {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<EnvironmentType, EnvironmentParseError> {
        match env.trim().to_ascii_lowercase().as_str() {
            "1" | "pruebas" | "test" => Ok(EnvironmentType::Pruebas),
            "2" | "produccion" | "production" => Ok(EnvironmentType::Produccion),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl TryFrom<u8> for EnvironmentType {
    type Error = EnvironmentParseError;
    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(EnvironmentType::Pruebas),
            2 => Ok(EnvironmentType::Produccion),
            other => Err(EnvironmentParseError::Invalid {
                input: other.to_string(),
            }),
        }
    }
}

impl From<EnvironmentType> for u8 {
    fn from(env: EnvironmentType) -> u8 {
        env.code()
    }
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Pruebas => "pruebas",
            EnvironmentType::Produccion => "produccion",
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            EnvironmentType::Pruebas => 1,
            EnvironmentType::Produccion => 2,
        }
    }
}

/// Object storage backend used for rendered PDFs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProviderType {
    Cloudinary,
    Local,
    S3,
    Azure,
}

impl StorageProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageProviderType::Cloudinary => "cloudinary",
            StorageProviderType::Local => "local",
            StorageProviderType::S3 => "s3",
            StorageProviderType::Azure => "azure",
        }
    }

    /// Whether the provider has a real implementation rather than the local fallback.
    pub fn is_implemented(&self) -> bool {
        matches!(
            self,
            StorageProviderType::Cloudinary | StorageProviderType::Local
        )
    }
}

impl FromStr for StorageProviderType {
    type Err = EnvironmentParseError;
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cloudinary" => Ok(StorageProviderType::Cloudinary),
            "local" => Ok(StorageProviderType::Local),
            "s3" => Ok(StorageProviderType::S3),
            "azure" => Ok(StorageProviderType::Azure),
            _ => Err(EnvironmentParseError::Invalid {
                input: value.to_string(),
            }),
        }
    }
}

/// Cloudinary account settings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub api_base_url: String,
}

impl CloudinaryConfig {
    pub const DEFAULT_API_BASE_URL: &'static str = "https://api.cloudinary.com/";

    pub fn is_complete(&self) -> bool {
        !self.cloud_name.is_empty() && !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

/// Runtime configuration for the issuance pipeline.
///
/// # Examples
/// ```rust
/// use factura_core::config::{Config, StorageProviderType};
///
/// let config = Config::default().with_storage_provider(StorageProviderType::Local);
/// assert_eq!(config.storage_provider(), StorageProviderType::Local);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    encryption_key: Option<String>,
    storage_provider: StorageProviderType,
    pdf_storage_path: PathBuf,
    pdf_base_url: String,
    cloudinary: CloudinaryConfig,
}

impl Config {
    /// Build a configuration from process environment variables, falling back
    /// to [`Config::default`] for anything unset.
    ///
    /// # Errors
    /// Returns [`EnvironmentParseError`] when `PDF_STORAGE_PROVIDER` holds an
    /// unknown value.
    pub fn from_env() -> Result<Self, EnvironmentParseError> {
        let mut config = Self::default();
        config.encryption_key = std::env::var("FACTURA_ENCRYPTION_KEY").ok();
        if let Ok(value) = std::env::var("PDF_STORAGE_PROVIDER") {
            config.storage_provider = StorageProviderType::from_str(&value)?;
        }
        if let Ok(value) = std::env::var("PDF_STORAGE_PATH") {
            config.pdf_storage_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("PDF_BASE_URL") {
            config.pdf_base_url = value;
        }
        config.cloudinary = CloudinaryConfig {
            cloud_name: std::env::var("CLOUDINARY_CLOUD_NAME").unwrap_or_default(),
            api_key: std::env::var("CLOUDINARY_API_KEY").unwrap_or_default(),
            api_secret: std::env::var("CLOUDINARY_API_SECRET").unwrap_or_default(),
            api_base_url: std::env::var("CLOUDINARY_API_BASE_URL")
                .ok()
                .map(|value| {
                    if value.ends_with('/') {
                        value
                    } else {
                        format!("{value}/")
                    }
                })
                .unwrap_or_else(|| CloudinaryConfig::DEFAULT_API_BASE_URL.to_string()),
        };
        Ok(config)
    }

    pub fn with_encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    pub fn with_storage_provider(mut self, provider: StorageProviderType) -> Self {
        self.storage_provider = provider;
        self
    }

    pub fn with_pdf_storage(mut self, path: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        self.pdf_storage_path = path.into();
        self.pdf_base_url = base_url.into();
        self
    }

    pub fn with_cloudinary(mut self, cloudinary: CloudinaryConfig) -> Self {
        self.cloudinary = cloudinary;
        self
    }

    pub fn encryption_key(&self) -> Option<&str> {
        self.encryption_key.as_deref()
    }

    pub fn storage_provider(&self) -> StorageProviderType {
        self.storage_provider
    }

    pub fn pdf_storage_path(&self) -> &Path {
        &self.pdf_storage_path
    }

    pub fn pdf_base_url(&self) -> &str {
        &self.pdf_base_url
    }

    pub fn cloudinary(&self) -> &CloudinaryConfig {
        &self.cloudinary
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            encryption_key: None,
            storage_provider: StorageProviderType::Local,
            pdf_storage_path: PathBuf::from("./storage/pdfs"),
            pdf_base_url: "http://localhost:3000/pdfs".to_string(),
            cloudinary: CloudinaryConfig {
                api_base_url: CloudinaryConfig::DEFAULT_API_BASE_URL.to_string(),
                ..CloudinaryConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_names_and_codes() {
        assert_eq!(EnvironmentType::from_str("1"), Ok(EnvironmentType::Pruebas));
        assert_eq!(
            EnvironmentType::from_str("PRODUCCION"),
            Ok(EnvironmentType::Produccion)
        );
        assert_eq!(EnvironmentType::try_from(2u8), Ok(EnvironmentType::Produccion));
        assert!(EnvironmentType::try_from(3u8).is_err());
        assert!(EnvironmentType::from_str("staging").is_err());
    }

    #[test]
    fn environment_serializes_as_code() {
        let json = serde_json::to_string(&EnvironmentType::Produccion).expect("serialize");
        assert_eq!(json, "2");
        let parsed: EnvironmentType = serde_json::from_str("1").expect("deserialize");
        assert_eq!(parsed, EnvironmentType::Pruebas);
    }

    #[test]
    fn storage_provider_reports_implementation() {
        assert!(StorageProviderType::Local.is_implemented());
        assert!(StorageProviderType::Cloudinary.is_implemented());
        assert!(!StorageProviderType::S3.is_implemented());
        assert_eq!(
            StorageProviderType::from_str("Azure"),
            Ok(StorageProviderType::Azure)
        );
    }
}
