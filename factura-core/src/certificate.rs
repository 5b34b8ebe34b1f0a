//! PKCS#12 certificate resolution and diagnostics.
//!
//! A taxpayer's certificate is stored as a base64 PKCS#12 blob plus a
//! password that may be encrypted at rest. [`CertificateResolver::resolve`]
//! turns both into a container that is known to open, recovering the
//! password from a fixed candidate list when the stored one does not work.
use crate::{config::Config, model::IssuingCompany};
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::{
    fmt,
    io::Write,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};
use x509_cert::{Certificate, der::Decode};

pub mod container;
pub mod password;

pub use container::{ContainerContents, ContainerError, Pkcs12Container};
pub use password::{
    PasswordCipher, PasswordCipherError, PasswordSource, recovery_candidates,
    resolve_stored_password,
};

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("empty certificate: {0}")]
    EmptyCertificate(String),
    #[error("failed to write certificate file: {0}")]
    Write(String),
    #[error("invalid PKCS#12 container: {0}")]
    InvalidContainer(String),
    #[error("no working certificate password after {attempts} candidates")]
    NoWorkingPassword { attempts: usize },
}

/// Operator-facing report on a PKCS#12 file. Produced by [`diagnose`];
/// failures land in `error` instead of being returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CertificateDiagnosis {
    pub file_exists: bool,
    pub file_size: u64,
    pub is_valid_p12: bool,
    pub password_works: bool,
    pub certificate_count: usize,
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub serial_number: Option<String>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl CertificateDiagnosis {
    /// Whether `now` falls inside the certificate's validity window.
    pub fn is_currently_valid(&self, now: DateTime<Utc>) -> bool {
        match (self.valid_from, self.valid_to) {
            (Some(from), Some(to)) => from <= now && now <= to,
            _ => false,
        }
    }
}

/// A container that opens with `password`, backed by a temporary file that
/// is removed when this value is dropped.
pub struct ResolvedCertificate {
    file: NamedTempFile,
    contents: ContainerContents,
    password: SecretString,
    source: PasswordSource,
    recovered_with: Option<&'static str>,
}

impl ResolvedCertificate {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Certificates and key decrypted with [`Self::password`].
    pub fn contents(&self) -> &ContainerContents {
        &self.contents
    }

    pub fn password(&self) -> &SecretString {
        &self.password
    }

    pub fn password_source(&self) -> PasswordSource {
        self.source
    }

    /// Label of the recovery candidate that opened the container, if the
    /// resolved password itself did not.
    pub fn recovered_with(&self) -> Option<&'static str> {
        self.recovered_with
    }
}

impl fmt::Debug for ResolvedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCertificate")
            .field("path", &self.file.path())
            .field("source", &self.source)
            .field("recovered_with", &self.recovered_with)
            .finish_non_exhaustive()
    }
}

/// Resolves stored certificate material into a usable container.
///
/// Resolution never mutates the company record, so it can be repeated.
#[derive(Debug, Clone, Default)]
pub struct CertificateResolver {
    cipher: Option<PasswordCipher>,
    temp_dir: Option<PathBuf>,
}

impl CertificateResolver {
    pub fn new(cipher: Option<PasswordCipher>) -> Self {
        Self {
            cipher,
            temp_dir: None,
        }
    }

    /// Decrypt stored passwords with `FACTURA_ENCRYPTION_KEY` when it is set.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.encryption_key().map(PasswordCipher::new))
    }

    pub fn decrypts_stored_passwords(&self) -> bool {
        self.cipher.is_some()
    }

    /// Place temporary certificate files under `dir` instead of the system
    /// temp directory.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn resolve(&self, company: &IssuingCompany) -> Result<ResolvedCertificate, CertificateError> {
        self.resolve_blob(
            company.certificate.as_deref().unwrap_or_default(),
            company.certificate_password.as_deref().unwrap_or_default(),
        )
    }

    /// Resolve a base64 PKCS#12 blob and its stored password.
    ///
    /// # Errors
    /// - [`CertificateError::EmptyCertificate`] for a blank or non-base64
    ///   blob, before anything touches the filesystem.
    /// - [`CertificateError::Write`] when the temporary file cannot be
    ///   written or ends up empty.
    /// - [`CertificateError::InvalidContainer`] when the bytes are not PKCS#12
    ///   or use an algorithm that cannot be opened.
    /// - [`CertificateError::NoWorkingPassword`] when every candidate is
    ///   rejected by the container.
    pub fn resolve_blob(
        &self,
        blob: &str,
        stored_password: &str,
    ) -> Result<ResolvedCertificate, CertificateError> {
        let der = decode_blob(blob)?;
        let file = self.write_temp(&der)?;

        let (password, source) = resolve_stored_password(stored_password, self.cipher.as_ref());

        let diagnosis = diagnose(file.path(), &password);
        if !diagnosis.is_valid_p12 {
            return Err(CertificateError::InvalidContainer(
                diagnosis.error.unwrap_or_else(|| "unparsable container".to_string()),
            ));
        }
        let container = Pkcs12Container::parse(&der).map_err(invalid_container)?;

        match container.open(password.expose_secret()) {
            Ok(contents) => {
                debug!(?source, "certificate opened with stored password");
                return Ok(ResolvedCertificate {
                    file,
                    contents,
                    password,
                    source,
                    recovered_with: None,
                });
            }
            Err(ContainerError::WrongPassword) => {}
            Err(e) => return Err(invalid_container(e)),
        }

        warn!(?source, "stored certificate password rejected, trying recovery candidates");
        let candidates = recovery_candidates(&password);
        let attempts = candidates.len();
        for (label, candidate) in candidates {
            match container.open(candidate.expose_secret()) {
                Ok(contents) => {
                    info!(candidate = label, "certificate password recovered");
                    return Ok(ResolvedCertificate {
                        file,
                        contents,
                        password: candidate,
                        source,
                        recovered_with: Some(label),
                    });
                }
                Err(ContainerError::WrongPassword) => continue,
                Err(e) => return Err(invalid_container(e)),
            }
        }
        Err(CertificateError::NoWorkingPassword { attempts })
    }

    fn write_temp(&self, der: &[u8]) -> Result<NamedTempFile, CertificateError> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("cert-").suffix(".p12");
            b
        };
        let mut file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|e| CertificateError::Write(e.to_string()))?;
        file.write_all(der)
            .and_then(|_| file.flush())
            .map_err(|e| CertificateError::Write(e.to_string()))?;
        let written = file
            .as_file()
            .metadata()
            .map_err(|e| CertificateError::Write(e.to_string()))?
            .len();
        if written == 0 {
            return Err(CertificateError::Write(
                "certificate file is empty after writing".to_string(),
            ));
        }
        Ok(file)
    }
}

/// Decode a stored blob, ignoring embedded whitespace.
pub fn decode_blob(blob: &str) -> Result<Vec<u8>, CertificateError> {
    let compact: String = blob.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(CertificateError::EmptyCertificate(
            "certificate blob is empty".to_string(),
        ));
    }
    let der = Base64::decode_vec(&compact)
        .map_err(|e| CertificateError::EmptyCertificate(format!("not valid base64: {e}")))?;
    if der.is_empty() {
        return Err(CertificateError::EmptyCertificate(
            "certificate blob decodes to nothing".to_string(),
        ));
    }
    Ok(der)
}

fn invalid_container(e: ContainerError) -> CertificateError {
    CertificateError::InvalidContainer(e.to_string())
}

/// Inspect a PKCS#12 file without side effects.
///
/// # Examples
/// ```rust
/// use factura_core::certificate::diagnose;
/// use secrecy::SecretString;
/// use std::path::Path;
///
/// let report = diagnose(Path::new("/nonexistent/cert.p12"), &SecretString::from("x"));
/// assert!(!report.file_exists);
/// assert!(report.error.is_some());
/// ```
pub fn diagnose(path: &Path, password: &SecretString) -> CertificateDiagnosis {
    let mut report = CertificateDiagnosis::default();

    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) => {
            report.error = Some(format!("file not accessible: {e}"));
            return report;
        }
    };
    report.file_exists = true;
    report.file_size = metadata.len();
    if report.file_size == 0 {
        report.error = Some("file is empty".to_string());
        return report;
    }

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            report.error = Some(format!("file not readable: {e}"));
            return report;
        }
    };
    let container = match Pkcs12Container::parse(&bytes) {
        Ok(container) => container,
        Err(e) => {
            report.error = Some(e.to_string());
            return report;
        }
    };
    report.is_valid_p12 = true;

    let contents = match container.open(password.expose_secret()) {
        Ok(contents) => contents,
        Err(e) => {
            report.error = Some(e.to_string());
            return report;
        }
    };
    report.password_works = true;

    let certificates = contents.certificates();
    report.certificate_count = certificates.len();

    let parsed: Vec<Certificate> = certificates
        .iter()
        .filter_map(|der| Certificate::from_der(der).ok())
        .collect();
    match leaf_index(&parsed) {
        Some(index) => {
            let tbs = &parsed[index].tbs_certificate;
            report.subject = Some(tbs.subject.to_string());
            report.issuer = Some(tbs.issuer.to_string());
            report.serial_number = Some(hex::encode_upper(tbs.serial_number.as_bytes()));
            report.valid_from = Some(DateTime::<Utc>::from(
                tbs.validity.not_before.to_system_time(),
            ));
            report.valid_to = Some(DateTime::<Utc>::from(
                tbs.validity.not_after.to_system_time(),
            ));
        }
        None => report.error = Some("container holds no parsable certificate".to_string()),
    }
    report
}

/// Index of the end-entity certificate: one whose subject issued no other
/// certificate in the set. Falls back to the first certificate.
pub fn leaf_index(certificates: &[Certificate]) -> Option<usize> {
    if certificates.is_empty() {
        return None;
    }
    let leaf = certificates.iter().position(|candidate| {
        !certificates.iter().any(|other| {
            !std::ptr::eq(other, candidate)
                && other.tbs_certificate.issuer == candidate.tbs_certificate.subject
        })
    });
    Some(leaf.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPENSSL_DEFAULT: &[u8] = include_bytes!("../tests/fixtures/certs/openssl-default.p12");

    #[test]
    fn blank_and_garbage_blobs_are_empty_certificates() {
        assert!(matches!(
            decode_blob("   \n"),
            Err(CertificateError::EmptyCertificate(_))
        ));
        assert!(matches!(
            decode_blob("not base64 !!"),
            Err(CertificateError::EmptyCertificate(_))
        ));
        assert_eq!(decode_blob("AQID\nBA==").unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn resolve_rejects_empty_blob_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CertificateResolver::default().with_temp_dir(dir.path());
        let err = resolver.resolve_blob("", "secret").unwrap_err();
        assert!(matches!(err, CertificateError::EmptyCertificate(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn resolve_rejects_non_pkcs12_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CertificateResolver::default().with_temp_dir(dir.path());
        let blob = Base64::encode_string(b"definitely not a container");
        let err = resolver.resolve_blob(&blob, "secret").unwrap_err();
        assert!(matches!(err, CertificateError::InvalidContainer(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn from_config_uses_the_encryption_key() {
        assert!(!CertificateResolver::from_config(&Config::default()).decrypts_stored_passwords());

        let config = Config::default().with_encryption_key("server-secret");
        let stored = PasswordCipher::new("server-secret").encrypt("Correcta1");
        let resolver = CertificateResolver::from_config(&config);
        assert!(resolver.decrypts_stored_passwords());

        let blob = Base64::encode_string(OPENSSL_DEFAULT);
        let resolved = resolver.resolve_blob(&blob, &stored).unwrap();
        assert_eq!(resolved.password_source(), PasswordSource::Decrypted);
        assert_eq!(resolved.password().expose_secret(), "Correcta1");
        assert!(resolved.recovered_with().is_none());
    }

    #[test]
    fn unsupported_mac_is_invalid_container_not_a_password_failure() {
        let mut pfx = p12::PFX::parse(OPENSSL_DEFAULT).unwrap();
        if let Some(mac) = pfx.mac_data.as_mut() {
            // id-sha3-256
            mac.mac.digest_algorithm =
                p12::AlgorithmIdentifier::OtherAlg(p12::OtherAlgorithmIdentifier {
                    algorithm_type: yasna::models::ObjectIdentifier::from_slice(&[
                        2, 16, 840, 1, 101, 3, 4, 2, 8,
                    ]),
                    params: None,
                });
        }
        let blob = Base64::encode_string(&pfx.to_der());

        let err = CertificateResolver::default()
            .resolve_blob(&blob, "Correcta1")
            .unwrap_err();
        assert!(
            matches!(&err, CertificateError::InvalidContainer(msg) if msg.contains("unsupported")),
            "{err:?}"
        );

        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), pfx.to_der()).unwrap();
        let report = diagnose(file.path(), &SecretString::from("Correcta1"));
        assert!(report.is_valid_p12);
        assert!(!report.password_works);
        assert!(report.error.unwrap().contains("2.16.840.1.101.3.4.2.8"));
    }

    #[test]
    fn diagnose_reports_empty_file() {
        let file = NamedTempFile::new().unwrap();
        let report = diagnose(file.path(), &SecretString::from("x"));
        assert!(report.file_exists);
        assert_eq!(report.file_size, 0);
        assert!(!report.is_valid_p12);
        assert!(!report.is_currently_valid(Utc::now()));
    }
}
