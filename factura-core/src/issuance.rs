//! Invoice issuance entry point.
//!
//! [`InvoiceService::issue`] does everything that must happen before the
//! caller gets an answer: validation, entity lookup, numbering, the unsigned
//! XML and the `PENDIENTE` invoice. Signing and submission are queued and
//! observed later through [`InvoiceService::invoice`].
use crate::{
    access_key::{self, AccessKey, AccessKeyError, AccessKeyParts, DOCUMENT_TYPE_INVOICE},
    model::{Client, Invoice, InvoiceDetail, IssuingCompany, Product, SriStatus},
    request::{InvoiceInfo, InvoiceRequest, LineItem, TaxInfo, parse_amount, parse_issue_date},
    sequencer::{SequenceError, Sequencer},
    sri::SriResponse,
    store::{DocumentStore, StoreError},
    submission::{QueueClosed, SubmissionQueue},
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Attempts at inserting an invoice before giving up on access-key
/// collisions.
pub const MAX_ACCESS_KEY_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("XML build failed: {0}")]
pub struct XmlBuildError(pub String);

#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("invalid invoice request: {0}")]
    Validation(String),
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
    #[error(transparent)]
    AccessKey(#[from] AccessKeyError),
    #[error("access key collided {attempts} times")]
    AccessKeyCollision { attempts: usize },
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    XmlBuild(#[from] XmlBuildError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),
    #[error("invoice {invoice_id} cannot be resubmitted from {status}")]
    InvalidState {
        invoice_id: String,
        status: SriStatus,
    },
}

/// Builds the unsigned invoice XML.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait XmlBuilder: Send + Sync {
    async fn build(
        &self,
        request: &InvoiceRequest,
        company: &IssuingCompany,
        client: &Client,
        products: &[Product],
        access_key: &AccessKey,
        sequential: &str,
    ) -> Result<String, XmlBuildError>;
}

/// Result of a successful [`InvoiceService::issue`]. Signing has not
/// happened yet, so `signed_xml` and `sri_response` are always empty here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssuedInvoice {
    #[serde(rename = "factura")]
    pub invoice: Invoice,
    #[serde(rename = "detalles")]
    pub details: Vec<InvoiceDetail>,
    pub xml: String,
    #[serde(rename = "xml_firmado")]
    pub signed_xml: Option<String>,
    #[serde(rename = "respuesta_sri")]
    pub sri_response: Option<SriResponse>,
}

struct LineAmounts {
    quantity: f64,
    unit_price: f64,
    subtotal: f64,
    vat: f64,
}

struct ValidatedRequest<'a> {
    tax_info: &'a TaxInfo,
    invoice_info: &'a InvoiceInfo,
    lines: Vec<(&'a LineItem, LineAmounts)>,
    issue_date: NaiveDate,
    subtotal: f64,
    total: f64,
}

fn validate(request: &InvoiceRequest) -> Result<ValidatedRequest<'_>, IssuanceError> {
    let invalid = |msg: &str| IssuanceError::Validation(msg.to_string());
    let tax_info = request
        .tax_info
        .as_ref()
        .ok_or_else(|| invalid("infoTributaria is required"))?;
    let invoice_info = request
        .invoice_info
        .as_ref()
        .ok_or_else(|| invalid("infoFactura is required"))?;
    let details = request
        .details
        .as_deref()
        .filter(|d| !d.is_empty())
        .ok_or_else(|| invalid("detalles must contain at least one line"))?;
    if tax_info.ruc.trim().is_empty() {
        return Err(invalid("infoTributaria.ruc is required"));
    }

    let issue_date = parse_issue_date(&invoice_info.issue_date).ok_or_else(|| {
        IssuanceError::Validation(format!(
            "fechaEmision '{}' is not a valid date",
            invoice_info.issue_date
        ))
    })?;
    let subtotal = parse_amount("totalSinImpuestos", &invoice_info.subtotal)
        .map_err(IssuanceError::Validation)?;
    let total =
        parse_amount("importeTotal", &invoice_info.total).map_err(IssuanceError::Validation)?;

    let mut lines = Vec::with_capacity(details.len());
    for entry in details {
        let item = &entry.detail;
        if item.product_code.trim().is_empty() {
            return Err(invalid("detalle.codigoPrincipal is required"));
        }
        let amounts = LineAmounts {
            quantity: parse_amount("cantidad", &item.quantity).map_err(IssuanceError::Validation)?,
            unit_price: parse_amount("precioUnitario", &item.unit_price)
                .map_err(IssuanceError::Validation)?,
            subtotal: parse_amount("precioTotalSinImpuesto", &item.total_without_tax)
                .map_err(IssuanceError::Validation)?,
            vat: item.vat_amount().map_err(IssuanceError::Validation)?,
        };
        lines.push((item, amounts));
    }

    Ok(ValidatedRequest {
        tax_info,
        invoice_info,
        lines,
        issue_date,
        subtotal,
        total,
    })
}

/// Issuance façade over the store, sequencer, XML builder and submission
/// queue.
pub struct InvoiceService {
    store: Arc<dyn DocumentStore>,
    sequencer: Arc<Sequencer>,
    xml: Arc<dyn XmlBuilder>,
    queue: SubmissionQueue,
}

impl InvoiceService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        sequencer: Arc<Sequencer>,
        xml: Arc<dyn XmlBuilder>,
        queue: SubmissionQueue,
    ) -> Self {
        Self {
            store,
            sequencer,
            xml,
            queue,
        }
    }

    /// Validate, number and persist an invoice, then queue its submission.
    ///
    /// # Errors
    /// Validation and lookup failures are returned before anything is
    /// written. Signing and submission failures never surface here; poll
    /// [`InvoiceService::invoice`] for them.
    #[instrument(skip_all)]
    pub async fn issue(&self, request: InvoiceRequest) -> Result<IssuedInvoice, IssuanceError> {
        let valid = validate(&request)?;
        let info = valid.invoice_info;

        self.store
            .identification_type_by_code(&info.buyer_identification_type)
            .await?
            .ok_or_else(|| IssuanceError::NotFound {
                entity: "identification_type",
                key: info.buyer_identification_type.clone(),
            })?;
        let company = self
            .store
            .company_by_ruc(&valid.tax_info.ruc)
            .await?
            .ok_or_else(|| IssuanceError::NotFound {
                entity: "issuing_company",
                key: valid.tax_info.ruc.clone(),
            })?;
        let client = self
            .store
            .client_by_identification(&info.buyer_identification)
            .await?
            .ok_or_else(|| IssuanceError::NotFound {
                entity: "client",
                key: info.buyer_identification.clone(),
            })?;
        let mut products = Vec::with_capacity(valid.lines.len());
        for (item, _) in &valid.lines {
            let product = self
                .store
                .product_by_code(&item.product_code)
                .await?
                .ok_or_else(|| IssuanceError::NotFound {
                    entity: "product",
                    key: item.product_code.clone(),
                })?;
            products.push(product);
        }

        let original_request = serde_json::to_string(&request)
            .map_err(|e| IssuanceError::Validation(format!("request not serializable: {e}")))?;
        let total_vat: f64 = valid.lines.iter().map(|(_, amounts)| amounts.vat).sum();

        let invoice_id = uuid::Uuid::new_v4().to_string();
        let details: Vec<InvoiceDetail> = valid
            .lines
            .iter()
            .zip(&products)
            .map(|((_, amounts), product)| InvoiceDetail {
                id: uuid::Uuid::new_v4().to_string(),
                invoice_id: invoice_id.clone(),
                product_id: product.id.clone(),
                quantity: amounts.quantity,
                unit_price: amounts.unit_price,
                subtotal: amounts.subtotal,
                vat_amount: amounts.vat,
            })
            .collect();

        let reservation = self.sequencer.reserve(self.store.as_ref(), &company.id).await?;
        let sequential = reservation.value().to_string();

        let mut inserted = None;
        for attempt in 1..=MAX_ACCESS_KEY_ATTEMPTS {
            let key = access_key::generate(&AccessKeyParts {
                issue_date: valid.issue_date,
                document_type: DOCUMENT_TYPE_INVOICE.to_string(),
                ruc: company.ruc.clone(),
                environment: company.environment.code().to_string(),
                series: company.series(),
                sequential: sequential.clone(),
                numeric_code: access_key::random_numeric_code(),
                emission_type: company.emission_type.to_string(),
            })?;
            let xml = self
                .xml
                .build(&request, &company, &client, &products, &key, &sequential)
                .await?;
            let invoice = Invoice {
                id: invoice_id.clone(),
                company_id: company.id.clone(),
                client_id: client.id.clone(),
                issue_date: valid.issue_date,
                access_key: key.to_string(),
                sequential: sequential.clone(),
                state: Invoice::STATE_CREATED.to_string(),
                subtotal: valid.subtotal,
                total_vat,
                total: valid.total,
                xml,
                signed_xml: None,
                sri_status: SriStatus::Pendiente,
                sri_messages: None,
                sri_sent_at: None,
                sri_responded_at: None,
                original_request: Some(original_request.clone()),
                created_at: Utc::now(),
            };
            match self.store.insert_invoice(invoice.clone(), details.clone()).await {
                Ok(()) => {
                    inserted = Some(invoice);
                    break;
                }
                Err(StoreError::DuplicateAccessKey(key)) => {
                    warn!(clave_acceso = %key, attempt, "access key collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
        let invoice = inserted.ok_or(IssuanceError::AccessKeyCollision {
            attempts: MAX_ACCESS_KEY_ATTEMPTS,
        })?;
        drop(reservation);

        // A persisted PENDIENTE invoice is picked up by `recover_pending`
        // even if the worker is gone.
        if let Err(e) = self.queue.enqueue(invoice.id.clone()) {
            error!(error = %e, "submission not queued; invoice stays PENDIENTE");
        }
        info!(
            invoice_id = %invoice.id,
            clave_acceso = %invoice.access_key,
            secuencial = %invoice.sequential,
            "invoice issued"
        );

        Ok(IssuedInvoice {
            xml: invoice.xml.clone(),
            invoice,
            details,
            signed_xml: None,
            sri_response: None,
        })
    }

    /// Current persisted state of an invoice.
    pub async fn invoice(&self, invoice_id: &str) -> Result<Invoice, IssuanceError> {
        self.store
            .invoice(invoice_id)
            .await?
            .ok_or_else(|| IssuanceError::NotFound {
                entity: "invoice",
                key: invoice_id.to_string(),
            })
    }

    /// Put a failed or stuck invoice back to `PENDIENTE` and queue it.
    /// The sequential and access key are kept.
    #[instrument(skip(self))]
    pub async fn resubmit(&self, invoice_id: &str) -> Result<Invoice, IssuanceError> {
        let mut invoice = self.invoice(invoice_id).await?;
        if !invoice.sri_status.is_retryable() {
            return Err(IssuanceError::InvalidState {
                invoice_id: invoice.id,
                status: invoice.sri_status,
            });
        }
        invoice.sri_status = SriStatus::Pendiente;
        invoice.sri_messages = None;
        invoice.signed_xml = None;
        invoice.sri_sent_at = None;
        invoice.sri_responded_at = None;
        self.store.update_invoice(&invoice).await?;
        self.queue.enqueue(invoice.id.clone())?;
        info!(clave_acceso = %invoice.access_key, "invoice resubmitted");
        Ok(invoice)
    }

    /// Queue every `PENDIENTE` invoice. Call once at start-up.
    pub async fn recover_pending(&self) -> Result<usize, IssuanceError> {
        let ids = self.store.pending_invoice_ids().await?;
        for id in &ids {
            self.queue.enqueue(id.clone())?;
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "pending invoices re-queued");
        }
        Ok(ids.len())
    }
}
