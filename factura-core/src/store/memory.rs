use super::{DocumentStore, StoreError};
use crate::model::{
    Client, IdentificationType, Invoice, InvoiceDetail, InvoicePdf, IssuingCompany, Product,
    SriStatus,
};
use async_trait::async_trait;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Collections {
    identification_types: Vec<IdentificationType>,
    companies: Vec<IssuingCompany>,
    clients: Vec<Client>,
    products: Vec<Product>,
    invoices: Vec<Invoice>,
    details: Vec<InvoiceDetail>,
    pdfs: Vec<InvoicePdf>,
}

/// Process-local [`DocumentStore`] for tests and single-node runs.
///
/// # Examples
/// ```rust
/// use factura_core::store::{DocumentStore, InMemoryStore};
///
/// let rt = tokio::runtime::Builder::new_current_thread().build()?;
/// rt.block_on(async {
///     let store = InMemoryStore::new();
///     assert_eq!(store.max_sequential("c1").await?, None);
///     Ok::<(), factura_core::store::StoreError>(())
/// })?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Collections>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_identification_type(&self, record: IdentificationType) {
        self.inner.write().await.identification_types.push(record);
    }

    pub async fn add_company(&self, record: IssuingCompany) {
        self.inner.write().await.companies.push(record);
    }

    pub async fn add_client(&self, record: Client) {
        self.inner.write().await.clients.push(record);
    }

    pub async fn add_product(&self, record: Product) {
        self.inner.write().await.products.push(record);
    }

    /// Snapshot of every stored invoice, in insertion order.
    pub async fn invoices(&self) -> Vec<Invoice> {
        self.inner.read().await.invoices.clone()
    }

    pub async fn invoice_pdfs(&self) -> Vec<InvoicePdf> {
        self.inner.read().await.pdfs.clone()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn identification_type_by_code(
        &self,
        code: &str,
    ) -> Result<Option<IdentificationType>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .identification_types
            .iter()
            .find(|t| t.code == code)
            .cloned())
    }

    async fn company_by_ruc(&self, ruc: &str) -> Result<Option<IssuingCompany>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.companies.iter().find(|c| c.ruc == ruc).cloned())
    }

    async fn company(&self, id: &str) -> Result<Option<IssuingCompany>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.companies.iter().find(|c| c.id == id).cloned())
    }

    async fn client_by_identification(
        &self,
        identification: &str,
    ) -> Result<Option<Client>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .clients
            .iter()
            .find(|c| c.identification == identification)
            .cloned())
    }

    async fn client(&self, id: &str) -> Result<Option<Client>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.clients.iter().find(|c| c.id == id).cloned())
    }

    async fn product_by_code(&self, code: &str) -> Result<Option<Product>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.products.iter().find(|p| p.code == code).cloned())
    }

    async fn product(&self, id: &str) -> Result<Option<Product>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.products.iter().find(|p| p.id == id).cloned())
    }

    async fn max_sequential(&self, company_id: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.read().await;
        // Zero-padded to a fixed width, so string order is numeric order.
        Ok(inner
            .invoices
            .iter()
            .filter(|i| i.company_id == company_id)
            .map(|i| i.sequential.clone())
            .max())
    }

    async fn insert_invoice(
        &self,
        invoice: Invoice,
        details: Vec<InvoiceDetail>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner
            .invoices
            .iter()
            .any(|i| i.access_key == invoice.access_key)
        {
            return Err(StoreError::DuplicateAccessKey(invoice.access_key));
        }
        if inner
            .invoices
            .iter()
            .any(|i| i.company_id == invoice.company_id && i.sequential == invoice.sequential)
        {
            return Err(StoreError::DuplicateSequential {
                company_id: invoice.company_id,
                sequential: invoice.sequential,
            });
        }
        if let Some(stray) = details.iter().find(|d| d.invoice_id != invoice.id) {
            return Err(StoreError::Backend(format!(
                "detail {} belongs to invoice {}, not {}",
                stray.id, stray.invoice_id, invoice.id
            )));
        }
        inner.invoices.push(invoice);
        inner.details.extend(details);
        Ok(())
    }

    async fn update_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .invoices
            .iter_mut()
            .find(|i| i.id == invoice.id)
            .ok_or_else(|| StoreError::NotFound {
                collection: "invoice",
                id: invoice.id.clone(),
            })?;
        *slot = invoice.clone();
        Ok(())
    }

    async fn invoice(&self, id: &str) -> Result<Option<Invoice>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.invoices.iter().find(|i| i.id == id).cloned())
    }

    async fn pending_invoice_ids(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .invoices
            .iter()
            .filter(|i| i.sri_status == SriStatus::Pendiente)
            .map(|i| i.id.clone())
            .collect())
    }

    async fn details_for_invoice(
        &self,
        invoice_id: &str,
    ) -> Result<Vec<InvoiceDetail>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .details
            .iter()
            .filter(|d| d.invoice_id == invoice_id)
            .cloned()
            .collect())
    }

    async fn save_invoice_pdf(&self, pdf: InvoicePdf) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner
            .pdfs
            .iter_mut()
            .find(|p| p.access_key == pdf.access_key)
        {
            Some(existing) => {
                let id = existing.id.clone();
                *existing = InvoicePdf { id, ..pdf };
            }
            None => inner.pdfs.push(pdf),
        }
        Ok(())
    }

    async fn invoice_pdf_by_access_key(
        &self,
        access_key: &str,
    ) -> Result<Option<InvoicePdf>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .pdfs
            .iter()
            .find(|p| p.access_key == access_key)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn invoice(id: &str, company: &str, sequential: &str, key: &str) -> Invoice {
        Invoice {
            id: id.into(),
            company_id: company.into(),
            client_id: "cl1".into(),
            issue_date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            access_key: key.into(),
            sequential: sequential.into(),
            state: Invoice::STATE_CREATED.into(),
            subtotal: 10.0,
            total_vat: 1.5,
            total: 11.5,
            xml: "<factura/>".into(),
            signed_xml: None,
            sri_status: SriStatus::Pendiente,
            sri_messages: None,
            sri_sent_at: None,
            sri_responded_at: None,
            original_request: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_enforces_unique_keys_and_sequentials() {
        let store = InMemoryStore::new();
        store
            .insert_invoice(invoice("i1", "c1", "000000001", "k1"), vec![])
            .await
            .unwrap();

        let err = store
            .insert_invoice(invoice("i2", "c1", "000000002", "k1"), vec![])
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::DuplicateAccessKey("k1".into()));

        let err = store
            .insert_invoice(invoice("i3", "c1", "000000001", "k3"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSequential { .. }));

        // Same sequential under another company is fine.
        store
            .insert_invoice(invoice("i4", "c2", "000000001", "k4"), vec![])
            .await
            .unwrap();
        assert_eq!(
            store.max_sequential("c1").await.unwrap().as_deref(),
            Some("000000001")
        );
    }

    #[tokio::test]
    async fn pending_ids_follow_status() {
        let store = InMemoryStore::new();
        store
            .insert_invoice(invoice("i1", "c1", "000000001", "k1"), vec![])
            .await
            .unwrap();
        let mut done = invoice("i2", "c1", "000000002", "k2");
        done.sri_status = SriStatus::Recibida;
        store.insert_invoice(done, vec![]).await.unwrap();
        assert_eq!(store.pending_invoice_ids().await.unwrap(), vec!["i1"]);
    }

    fn detail(id: &str, invoice_id: &str) -> InvoiceDetail {
        InvoiceDetail {
            id: id.into(),
            invoice_id: invoice_id.into(),
            product_id: "p1".into(),
            quantity: 2.0,
            unit_price: 5.0,
            subtotal: 10.0,
            vat_amount: 1.5,
        }
    }

    #[tokio::test]
    async fn invoice_and_details_are_stored_together() {
        let store = InMemoryStore::new();
        store
            .insert_invoice(
                invoice("i1", "c1", "000000001", "k1"),
                vec![detail("d1", "i1"), detail("d2", "i1")],
            )
            .await
            .unwrap();
        assert_eq!(store.details_for_invoice("i1").await.unwrap().len(), 2);

        // A rejected insert leaves neither the invoice nor its details behind.
        let err = store
            .insert_invoice(
                invoice("i2", "c1", "000000002", "k2"),
                vec![detail("d3", "i2"), detail("d4", "other")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(store.invoice("i2").await.unwrap().is_none());
        assert!(store.details_for_invoice("i2").await.unwrap().is_empty());
        assert_eq!(store.pending_invoice_ids().await.unwrap(), vec!["i1"]);

        let err = store
            .insert_invoice(
                invoice("i3", "c1", "000000001", "k3"),
                vec![detail("d5", "i3")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSequential { .. }));
        assert!(store.details_for_invoice("i3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_of_unknown_invoice_is_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .update_invoice(&invoice("nope", "c1", "000000001", "k1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { collection: "invoice", .. }));
    }
}
