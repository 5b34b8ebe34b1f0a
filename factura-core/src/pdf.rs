//! Input to the PDF renderer for an accepted invoice.
use crate::{
    model::{Client, IssuingCompany, Product},
    request::InvoiceRequest,
    storage::ArtifactError,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

/// Everything the renderer needs to lay out the RIDE of an invoice.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfData {
    pub request: InvoiceRequest,
    pub company: IssuingCompany,
    pub client: Client,
    pub products: Vec<Product>,
    pub access_key: String,
    pub sequential: String,
    pub issue_date: NaiveDate,
    pub authorization_number: String,
    pub authorization_date: DateTime<Utc>,
}

impl PdfData {
    /// Object name used when uploading the rendered file.
    pub fn file_name(&self) -> String {
        pdf_file_name(&self.sequential, &self.access_key)
    }
}

pub fn pdf_file_name(sequential: &str, access_key: &str) -> String {
    format!("factura_{sequential}_{access_key}")
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PdfGenerator: Send + Sync {
    async fn render(&self, data: &PdfData) -> Result<Vec<u8>, ArtifactError>;
}
