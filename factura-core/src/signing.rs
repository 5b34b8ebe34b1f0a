//! Key material extraction and the handoff to the XAdES signer.
//!
//! The external signer consumes a PEM file holding the private key followed
//! by the leaf certificate. That file only exists for the duration of
//! [`SigningOrchestrator::sign`].
use crate::certificate::{ContainerContents, ResolvedCertificate, leaf_index};
use async_trait::async_trait;
use pkcs8::PrivateKeyInfo;
use secrecy::ExposeSecret;
use std::{
    fmt,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, instrument};
use x509_cert::{
    Certificate,
    der::{Decode, EncodePem, pem::LineEnding},
};

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("container holds no certificate")]
    NoCertificate,
    #[error("container holds no private key")]
    NoPrivateKey,
    #[error("key material extraction failed: {0}")]
    Extraction(String),
    #[error("key material conversion failed: {0}")]
    Conversion(String),
    #[error("failed to write key material: {0}")]
    Write(String),
    #[error("signer failed: {0}")]
    Signer(String),
}

/// Signs an unsigned document with the key material at `key_path`.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait XmlSigner: Send + Sync {
    async fn sign(
        &self,
        unsigned_xml: &str,
        key_path: &Path,
        password: &str,
    ) -> Result<String, SigningError>;
}

/// PEM-encoded leaf certificate and its private key.
#[derive(Clone)]
pub struct KeyMaterial {
    private_key_pem: String,
    certificate_pem: String,
}

impl KeyMaterial {
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// Key, blank line, certificate.
    pub fn combined_pem(&self) -> String {
        format!(
            "{}\n\n{}\n",
            self.private_key_pem.trim(),
            self.certificate_pem.trim()
        )
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("certificate_pem", &self.certificate_pem)
            .finish_non_exhaustive()
    }
}

/// Pull the leaf certificate and private key out of an opened container.
///
/// Shrouded (`pkcs8ShroudedKeyBag`) keys are preferred; a plain `keyBag` is
/// used when no shrouded key exists.
pub fn extract_key_material(contents: &ContainerContents) -> Result<KeyMaterial, SigningError> {
    if contents.certificates().is_empty() {
        return Err(SigningError::NoCertificate);
    }
    let certificates = contents
        .certificates()
        .iter()
        .map(|der| Certificate::from_der(der))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SigningError::Conversion(format!("certificate parse error: {e:?}")))?;
    let leaf = leaf_index(&certificates).ok_or(SigningError::NoCertificate)?;

    let key_der = contents.private_key().ok_or(SigningError::NoPrivateKey)?;
    let key_info = PrivateKeyInfo::try_from(key_der)
        .map_err(|e| SigningError::Conversion(format!("private key parse error: {e:?}")))?;

    let private_key_pem = key_info
        .to_pem(LineEnding::LF)
        .map_err(|e| SigningError::Conversion(format!("private key PEM: {e:?}")))?;
    let certificate_pem = certificates[leaf]
        .to_pem(LineEnding::LF)
        .map_err(|e| SigningError::Conversion(format!("certificate PEM: {e:?}")))?;

    Ok(KeyMaterial {
        private_key_pem,
        certificate_pem,
    })
}

/// Write the combined PEM to a fresh temporary file under `dir`.
pub fn write_artifact(
    dir: Option<&Path>,
    material: &KeyMaterial,
) -> Result<NamedTempFile, SigningError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("combined-").suffix(".pem");
    let mut file = match dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
    .map_err(|e| SigningError::Write(e.to_string()))?;
    file.write_all(material.combined_pem().as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| SigningError::Write(e.to_string()))?;
    Ok(file)
}

/// Converts resolved certificates into signer input and calls the signer.
pub struct SigningOrchestrator {
    signer: Arc<dyn XmlSigner>,
    temp_dir: Option<PathBuf>,
}

impl SigningOrchestrator {
    pub fn new(signer: Arc<dyn XmlSigner>) -> Self {
        Self {
            signer,
            temp_dir: None,
        }
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Sign `unsigned_xml` with the certificate's key material.
    ///
    /// The combined PEM file is deleted before this returns, whatever the
    /// outcome.
    #[instrument(skip_all)]
    pub async fn sign(
        &self,
        unsigned_xml: &str,
        certificate: &ResolvedCertificate,
    ) -> Result<String, SigningError> {
        let contents = certificate.contents().clone();
        let temp_dir = self.temp_dir.clone();
        let artifact = tokio::task::spawn_blocking(move || {
            let material = extract_key_material(&contents)?;
            write_artifact(temp_dir.as_deref(), &material)
        })
        .await
        .map_err(|e| SigningError::Extraction(format!("key material task failed: {e}")))??;
        debug!(path = %artifact.path().display(), "key material written");

        let password = certificate.password().expose_secret();
        let signed = self.signer.sign(unsigned_xml, artifact.path(), password).await;
        drop(artifact);
        signed
    }
}

impl fmt::Debug for SigningOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningOrchestrator")
            .field("temp_dir", &self.temp_dir)
            .finish_non_exhaustive()
    }
}
