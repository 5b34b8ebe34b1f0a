//! Issuance, signing and submission pipeline for SRI (Ecuador) electronic invoices.
//!
//! # Examples
//! ```rust
//! use factura_core::{certificate::CertificateResolver, config::Config};
//!
//! let config = Config::default().with_encryption_key("server-secret");
//! let resolver = CertificateResolver::from_config(&config);
//! assert!(resolver.decrypts_stored_passwords());
//! ```
pub mod access_key;
pub mod certificate;
pub mod config;
pub mod issuance;
pub mod model;
pub mod pdf;
pub mod request;
pub mod sequencer;
pub mod signing;
pub mod sri;
pub mod storage;
pub mod store;
pub mod submission;

use thiserror::Error;

pub use access_key::{AccessKey, AccessKeyError, AccessKeyParts};
pub use certificate::{CertificateDiagnosis, CertificateError, CertificateResolver};
pub use issuance::{InvoiceService, IssuanceError, IssuedInvoice};
pub use model::SriStatus;
pub use submission::{SubmissionOrchestrator, SubmissionOutcome};

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    AccessKey(#[from] access_key::AccessKeyError),
    #[error(transparent)]
    Sequence(#[from] sequencer::SequenceError),
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Certificate(#[from] certificate::CertificateError),
    #[error(transparent)]
    Signing(#[from] signing::SigningError),
    #[error(transparent)]
    Submission(#[from] sri::SubmissionError),
    #[error(transparent)]
    Artifact(#[from] storage::ArtifactError),
    #[error(transparent)]
    Issuance(#[from] issuance::IssuanceError),
    #[error(transparent)]
    Config(#[from] config::EnvironmentParseError),
}
