//! Signing and submission of persisted invoices.
//!
//! An invoice starts in `PENDIENTE`. [`SubmissionOrchestrator::run`] moves it
//! through signing, submission and, once accepted, PDF generation. Each
//! transition is written to the store before the next step starts, so the
//! stored record always reflects the last completed step.
//!
//! ```text
//! PENDIENTE ──certificate/signing failure──▶ ERROR_FIRMA
//!     │
//!     ├─ xml_firmado stored, sri_fecha_envio stored
//!     ▼
//! submit ──▶ RECIBIDA ──▶ PDF record (GENERADO | ERROR)
//!        ├─▶ other authority status
//!        └─▶ ERROR_PROCESO (any other failure)
//! ```
use crate::{
    certificate::CertificateResolver,
    model::{EmailStatus, Invoice, InvoicePdf, IssuingCompany, PdfStatus, SriStatus},
    pdf::{PdfData, PdfGenerator},
    request::InvoiceRequest,
    signing::SigningOrchestrator,
    sri::ProtocolClient,
    storage::{ArtifactError, PdfStorage, StoredObject},
    store::DocumentStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

pub mod queue;

pub use queue::{QueueClosed, SubmissionQueue, SubmissionWorker};

/// Message stored when the company has no certificate on file.
pub const MISSING_CERTIFICATE_MESSAGE: &str = "Certificate not found for signing";

/// What a single [`SubmissionOrchestrator::run`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// Accepted by the authority; carries the state of the PDF record.
    Received { pdf: PdfStatus },
    /// The authority answered with a status other than `RECIBIDA`.
    Authority(SriStatus),
    /// Stored as `ERROR_FIRMA`.
    SigningFailed(String),
    /// Stored as `ERROR_PROCESO`.
    ProcessFailed(String),
    /// The invoice is not in `PENDIENTE`.
    Skipped(SriStatus),
    /// Another run for the same invoice is in progress.
    AlreadyRunning,
    NotFound,
}

/// Anything that can drive one invoice through the pipeline.
#[async_trait]
pub trait SubmissionRunner: Send + Sync {
    async fn run(&self, invoice_id: &str) -> SubmissionOutcome;
}

enum Failure {
    Signature(serde_json::Value, String),
    Process(String),
}

impl Failure {
    fn signature(message: impl Into<String>) -> Self {
        let message = message.into();
        Failure::Signature(json!({ "error": message }), message)
    }
}

struct InFlight<'a> {
    set: &'a DashSet<String>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

pub struct SubmissionOrchestrator {
    store: Arc<dyn DocumentStore>,
    resolver: CertificateResolver,
    signing: SigningOrchestrator,
    protocol: Arc<dyn ProtocolClient>,
    pdf: Arc<dyn PdfGenerator>,
    storage: Arc<dyn PdfStorage>,
    in_flight: DashSet<String>,
}

impl SubmissionOrchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        resolver: CertificateResolver,
        signing: SigningOrchestrator,
        protocol: Arc<dyn ProtocolClient>,
        pdf: Arc<dyn PdfGenerator>,
        storage: Arc<dyn PdfStorage>,
    ) -> Self {
        Self {
            store,
            resolver,
            signing,
            protocol,
            pdf,
            storage,
            in_flight: DashSet::new(),
        }
    }

    /// Drive a `PENDIENTE` invoice to its next terminal state.
    ///
    /// Never fails: every error is written to the invoice (or its PDF record)
    /// and logged.
    #[instrument(skip(self))]
    pub async fn run(&self, invoice_id: &str) -> SubmissionOutcome {
        if !self.in_flight.insert(invoice_id.to_string()) {
            debug!("submission already running");
            return SubmissionOutcome::AlreadyRunning;
        }
        let _guard = InFlight {
            set: &self.in_flight,
            id: invoice_id.to_string(),
        };

        let mut invoice = match self.store.invoice(invoice_id).await {
            Ok(Some(invoice)) => invoice,
            Ok(None) => {
                warn!("invoice not found");
                return SubmissionOutcome::NotFound;
            }
            Err(e) => {
                error!(error = %e, "could not load invoice");
                return SubmissionOutcome::ProcessFailed(e.to_string());
            }
        };
        if invoice.sri_status != SriStatus::Pendiente {
            debug!(sri_estado = %invoice.sri_status, "invoice is not pending");
            return SubmissionOutcome::Skipped(invoice.sri_status);
        }

        match self.drive(&mut invoice).await {
            Ok(outcome) => outcome,
            Err(Failure::Signature(messages, reason)) => {
                warn!(clave_acceso = %invoice.access_key, reason = %reason, "signing failed");
                self.record_failure(&mut invoice, SriStatus::ErrorFirma, messages)
                    .await;
                SubmissionOutcome::SigningFailed(reason)
            }
            Err(Failure::Process(reason)) => {
                error!(clave_acceso = %invoice.access_key, reason = %reason, "submission failed");
                self.record_failure(&mut invoice, SriStatus::ErrorProceso, json!({ "error": reason }))
                    .await;
                SubmissionOutcome::ProcessFailed(reason)
            }
        }
    }

    async fn drive(&self, invoice: &mut Invoice) -> Result<SubmissionOutcome, Failure> {
        let company = self
            .store
            .company(&invoice.company_id)
            .await
            .map_err(|e| Failure::Process(e.to_string()))?
            .ok_or_else(|| {
                Failure::Process(format!("issuing company {} not found", invoice.company_id))
            })?;
        if !company.has_certificate() {
            return Err(Failure::Signature(
                json!({ "mensaje": MISSING_CERTIFICATE_MESSAGE }),
                MISSING_CERTIFICATE_MESSAGE.to_string(),
            ));
        }

        let signed = self.sign(invoice, &company).await?;

        invoice.signed_xml = Some(signed.clone());
        self.persist(invoice).await?;
        invoice.sri_sent_at = Some(Utc::now());
        self.persist(invoice).await?;

        let response = self
            .protocol
            .submit(&signed)
            .await
            .map_err(|e| Failure::Process(e.to_string()))?;

        invoice.sri_responded_at = Some(Utc::now());
        invoice.sri_status = response.estado.clone();
        if let Some(mensajes) = response.mensajes {
            invoice.sri_messages = Some(mensajes);
        }
        self.persist(invoice).await?;

        if response.estado != SriStatus::Recibida {
            info!(clave_acceso = %invoice.access_key, sri_estado = %response.estado, "invoice not received by SRI");
            return Ok(SubmissionOutcome::Authority(response.estado));
        }
        info!(
            clave_acceso = %invoice.access_key,
            secuencial = %invoice.sequential,
            "invoice received by SRI"
        );
        let pdf = self.generate_pdf(invoice, &company).await;
        Ok(SubmissionOutcome::Received { pdf })
    }

    async fn sign(&self, invoice: &Invoice, company: &IssuingCompany) -> Result<String, Failure> {
        let resolver = self.resolver.clone();
        let company = company.clone();
        let resolved = tokio::task::spawn_blocking(move || resolver.resolve(&company))
            .await
            .map_err(|e| Failure::signature(format!("certificate task failed: {e}")))?
            .map_err(|e| Failure::signature(e.to_string()))?;
        if let Some(label) = resolved.recovered_with() {
            info!(candidate = label, "signing with recovered certificate password");
        }
        self.signing
            .sign(&invoice.xml, &resolved)
            .await
            .map_err(|e| Failure::signature(e.to_string()))
    }

    async fn persist(&self, invoice: &Invoice) -> Result<(), Failure> {
        self.store
            .update_invoice(invoice)
            .await
            .map_err(|e| Failure::Process(e.to_string()))
    }

    async fn record_failure(
        &self,
        invoice: &mut Invoice,
        status: SriStatus,
        messages: serde_json::Value,
    ) {
        invoice.sri_status = status;
        invoice.sri_messages = Some(messages);
        if let Err(e) = self.store.update_invoice(invoice).await {
            error!(error = %e, sri_estado = %invoice.sri_status, "could not persist failure state");
        }
    }

    /// Render, upload and record the PDF. The invoice itself is not touched.
    async fn generate_pdf(&self, invoice: &Invoice, company: &IssuingCompany) -> PdfStatus {
        let authorization_date = invoice.sri_responded_at.unwrap_or_else(Utc::now);
        let record = match self.render_and_store(invoice, company, authorization_date).await {
            Ok(stored) => {
                info!(url = %stored.url, provider = %stored.provider, "PDF stored");
                pdf_record(invoice, stored, PdfStatus::Generado, authorization_date)
            }
            Err(e) => {
                error!(clave_acceso = %invoice.access_key, error = %e, "PDF generation failed");
                let failed = StoredObject {
                    url: String::new(),
                    public_id: String::new(),
                    size: 0,
                    provider: "error".to_string(),
                };
                pdf_record(invoice, failed, PdfStatus::Error, Utc::now())
            }
        };
        let status = record.status;
        if let Err(e) = self.store.save_invoice_pdf(record).await {
            error!(error = %e, "could not save PDF record");
        }
        status
    }

    async fn render_and_store(
        &self,
        invoice: &Invoice,
        company: &IssuingCompany,
        authorization_date: DateTime<Utc>,
    ) -> Result<StoredObject, ArtifactError> {
        let data = self.pdf_data(invoice, company, authorization_date).await?;
        let bytes = self.pdf.render(&data).await?;
        self.storage.upload(bytes, &data.file_name()).await
    }

    async fn pdf_data(
        &self,
        invoice: &Invoice,
        company: &IssuingCompany,
        authorization_date: DateTime<Utc>,
    ) -> Result<PdfData, ArtifactError> {
        let client = self
            .store
            .client(&invoice.client_id)
            .await
            .map_err(|e| ArtifactError::Render(e.to_string()))?
            .ok_or_else(|| ArtifactError::Render(format!("client {} not found", invoice.client_id)))?;
        let details = self
            .store
            .details_for_invoice(&invoice.id)
            .await
            .map_err(|e| ArtifactError::Render(e.to_string()))?;
        let mut products = Vec::with_capacity(details.len());
        for detail in &details {
            let product = self
                .store
                .product(&detail.product_id)
                .await
                .map_err(|e| ArtifactError::Render(e.to_string()))?
                .ok_or_else(|| {
                    ArtifactError::Render(format!("product {} not found", detail.product_id))
                })?;
            products.push(product);
        }
        let request = match invoice.original_request.as_deref() {
            Some(raw) => serde_json::from_str::<InvoiceRequest>(raw)
                .map_err(|e| ArtifactError::Render(format!("stored request unreadable: {e}")))?,
            None => InvoiceRequest::default(),
        };
        Ok(PdfData {
            request,
            company: company.clone(),
            client,
            products,
            access_key: invoice.access_key.clone(),
            sequential: invoice.sequential.clone(),
            issue_date: invoice.issue_date,
            authorization_number: invoice.access_key.clone(),
            authorization_date,
        })
    }
}

fn pdf_record(
    invoice: &Invoice,
    stored: StoredObject,
    status: PdfStatus,
    authorization_date: DateTime<Utc>,
) -> InvoicePdf {
    InvoicePdf {
        id: uuid::Uuid::new_v4().to_string(),
        invoice_id: invoice.id.clone(),
        access_key: invoice.access_key.clone(),
        url: stored.url,
        public_id: stored.public_id,
        provider: stored.provider,
        generated_at: Utc::now(),
        status,
        size: stored.size,
        authorization_number: invoice.access_key.clone(),
        authorization_date,
        email_status: EmailStatus::NoEnviado,
        email_recipient: None,
        email_sent_at: None,
        email_attempts: 0,
        email_last_error: None,
    }
}

#[async_trait]
impl SubmissionRunner for SubmissionOrchestrator {
    async fn run(&self, invoice_id: &str) -> SubmissionOutcome {
        SubmissionOrchestrator::run(self, invoice_id).await
    }
}
