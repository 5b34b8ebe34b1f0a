//! Document store contract used by the issuance and submission pipeline.
use crate::model::{
    Client, IdentificationType, Invoice, InvoiceDetail, InvoicePdf, IssuingCompany, Product,
};
use async_trait::async_trait;
use thiserror::Error;

pub mod memory;

pub use memory::InMemoryStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("access key already exists: {0}")]
    DuplicateAccessKey(String),
    #[error("sequential {sequential} already used by company {company_id}")]
    DuplicateSequential {
        company_id: String,
        sequential: String,
    },
    #[error("{collection} record not found: {id}")]
    NotFound {
        collection: &'static str,
        id: String,
    },
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Read/write access to the persisted records.
///
/// Implementations must enforce uniqueness of `clave_acceso` and of the
/// `(company_id, secuencial)` pair on insert.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn identification_type_by_code(
        &self,
        code: &str,
    ) -> Result<Option<IdentificationType>, StoreError>;

    async fn company_by_ruc(&self, ruc: &str) -> Result<Option<IssuingCompany>, StoreError>;

    async fn company(&self, id: &str) -> Result<Option<IssuingCompany>, StoreError>;

    async fn client_by_identification(
        &self,
        identification: &str,
    ) -> Result<Option<Client>, StoreError>;

    async fn client(&self, id: &str) -> Result<Option<Client>, StoreError>;

    async fn product_by_code(&self, code: &str) -> Result<Option<Product>, StoreError>;

    async fn product(&self, id: &str) -> Result<Option<Product>, StoreError>;

    /// Highest `secuencial` stored for the company, if any.
    async fn max_sequential(&self, company_id: &str) -> Result<Option<String>, StoreError>;

    /// Store an invoice together with its detail lines. Either everything is
    /// written or nothing is.
    async fn insert_invoice(
        &self,
        invoice: Invoice,
        details: Vec<InvoiceDetail>,
    ) -> Result<(), StoreError>;

    /// Replace the stored invoice with the same id.
    async fn update_invoice(&self, invoice: &Invoice) -> Result<(), StoreError>;

    async fn invoice(&self, id: &str) -> Result<Option<Invoice>, StoreError>;

    /// Ids of invoices whose `sri_estado` is `PENDIENTE`, oldest first.
    async fn pending_invoice_ids(&self) -> Result<Vec<String>, StoreError>;

    async fn details_for_invoice(&self, invoice_id: &str)
    -> Result<Vec<InvoiceDetail>, StoreError>;

    /// Insert or replace the PDF record keyed by its access key.
    async fn save_invoice_pdf(&self, pdf: InvoicePdf) -> Result<(), StoreError>;

    async fn invoice_pdf_by_access_key(
        &self,
        access_key: &str,
    ) -> Result<Option<InvoicePdf>, StoreError>;
}
