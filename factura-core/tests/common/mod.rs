use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use factura_core::{
    access_key::AccessKey,
    certificate::CertificateResolver,
    config::EnvironmentType,
    issuance::{XmlBuildError, XmlBuilder},
    model::{Client, IdentificationType, IssuingCompany, Product},
    pdf::{PdfData, PdfGenerator},
    request::{DetailEntry, InvoiceInfo, InvoiceRequest, LineItem, Tax, TaxEntry, TaxInfo},
    signing::{SigningError, SigningOrchestrator, XmlSigner},
    sri::{ProtocolClient, SriResponse, SubmissionError},
    storage::{ArtifactError, LocalStorage},
    store::InMemoryStore,
    submission::SubmissionOrchestrator,
};
use p12::PFX;
use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::Notify;

pub const RUC: &str = "1790012345001";
pub const BUYER_ID: &str = "1712345678";

const LEAF_CERT: &[u8] = include_bytes!("../fixtures/certs/leaf-cert.der");
const LEAF_KEY: &[u8] = include_bytes!("../fixtures/certs/leaf-key.der");
const CA_CERT: &[u8] = include_bytes!("../fixtures/certs/ca-cert.der");

#[allow(dead_code)]
pub fn p12_der(password: &str) -> Vec<u8> {
    PFX::new(LEAF_CERT, LEAF_KEY, Some(CA_CERT), password, "sri")
        .expect("build pfx")
        .to_der()
}

#[allow(dead_code)]
pub fn p12_blob(password: &str) -> String {
    Base64::encode_string(&p12_der(password))
}

#[allow(dead_code)]
pub fn company(certificate: Option<String>, password: Option<&str>) -> IssuingCompany {
    IssuingCompany {
        id: "company-1".into(),
        ruc: RUC.into(),
        business_name: "COMERCIAL ANDINA S.A.".into(),
        trade_name: "ANDINA".into(),
        head_office_address: Some("Av. Amazonas N34-120, Quito".into()),
        establishment_address: None,
        phone: None,
        email: Some("facturacion@andina.ec".into()),
        establishment_code: "001".into(),
        emission_point: "002".into(),
        environment: EnvironmentType::Pruebas,
        emission_type: 1,
        keeps_accounting: true,
        special_taxpayer: None,
        certificate,
        certificate_password: password.map(str::to_string),
    }
}

#[allow(dead_code)]
pub async fn seeded_store(company: IssuingCompany) -> Arc<InMemoryStore> {
    let store = InMemoryStore::new();
    store
        .add_identification_type(IdentificationType {
            id: "it-05".into(),
            code: "05".into(),
            description: "CEDULA".into(),
        })
        .await;
    store.add_company(company).await;
    store
        .add_client(Client {
            id: "client-1".into(),
            identification: BUYER_ID.into(),
            identification_type: "05".into(),
            name: "MARIA PEREZ".into(),
            email: Some("maria@example.ec".into()),
            address: None,
        })
        .await;
    for (id, code, description, price) in [
        ("product-1", "P001", "Servicio de soporte", 5.0),
        ("product-2", "P002", "Licencia anual", 20.0),
    ] {
        store
            .add_product(Product {
                id: id.into(),
                code: code.into(),
                description: description.into(),
                unit_price: price,
            })
            .await;
    }
    Arc::new(store)
}

#[allow(dead_code)]
pub fn request(product_codes: &[&str]) -> InvoiceRequest {
    InvoiceRequest {
        tax_info: Some(TaxInfo {
            ruc: RUC.into(),
            business_name: Some("COMERCIAL ANDINA S.A.".into()),
        }),
        invoice_info: Some(InvoiceInfo {
            issue_date: "15/03/2024".into(),
            buyer_identification_type: "05".into(),
            buyer_identification: BUYER_ID.into(),
            buyer_name: Some("MARIA PEREZ".into()),
            subtotal: format!("{:.2}", 10.0 * product_codes.len() as f64),
            discount: None,
            total: format!("{:.2}", 11.5 * product_codes.len() as f64),
            currency: Some("DOLAR".into()),
        }),
        details: Some(
            product_codes
                .iter()
                .map(|code| DetailEntry {
                    detail: LineItem {
                        product_code: code.to_string(),
                        description: "line".into(),
                        quantity: "2".into(),
                        unit_price: "5.00".into(),
                        discount: None,
                        total_without_tax: "10.00".into(),
                        taxes: vec![TaxEntry {
                            tax: Tax {
                                code: "2".into(),
                                rate_code: "4".into(),
                                rate: "15".into(),
                                taxable_base: "10.00".into(),
                                amount: "1.50".into(),
                            },
                        }],
                    },
                })
                .collect(),
        ),
    }
}

/// Minimal XML carrying the key and sequential.
#[allow(dead_code)]
pub struct TemplateXmlBuilder;

#[async_trait]
impl XmlBuilder for TemplateXmlBuilder {
    async fn build(
        &self,
        _request: &InvoiceRequest,
        company: &IssuingCompany,
        client: &Client,
        products: &[Product],
        access_key: &AccessKey,
        sequential: &str,
    ) -> Result<String, XmlBuildError> {
        Ok(format!(
            "<factura><ruc>{}</ruc><claveAcceso>{access_key}</claveAcceso><secuencial>{sequential}</secuencial><comprador>{}</comprador><lineas>{}</lineas></factura>",
            company.ruc,
            client.identification,
            products.len()
        ))
    }
}

/// Wraps the document after checking the key file is present.
#[allow(dead_code)]
pub struct StubSigner;

#[async_trait]
impl XmlSigner for StubSigner {
    async fn sign(
        &self,
        unsigned_xml: &str,
        key_path: &Path,
        _password: &str,
    ) -> Result<String, SigningError> {
        let pem = std::fs::read_to_string(key_path)
            .map_err(|e| SigningError::Signer(e.to_string()))?;
        if !pem.contains("PRIVATE KEY") {
            return Err(SigningError::Signer("no key in artifact".into()));
        }
        Ok(format!("<signed>{unsigned_xml}</signed>"))
    }
}

/// Authority stand-in. Optionally blocks every submission until `release`.
#[allow(dead_code)]
#[derive(Default)]
pub struct FakeAuthority {
    pub calls: AtomicUsize,
    pub fail_transport: bool,
    pub status: Option<&'static str>,
    gate: Option<Notify>,
}

#[allow(dead_code)]
impl FakeAuthority {
    pub fn receiving() -> Self {
        Self::default()
    }

    pub fn answering(status: &'static str) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            fail_transport: true,
            ..Self::default()
        }
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Notify::new()),
            ..Self::default()
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolClient for FakeAuthority {
    async fn submit(&self, signed_xml: &str) -> Result<SriResponse, SubmissionError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(signed_xml.starts_with("<signed>"));
        if self.fail_transport {
            return Err(SubmissionError::Transport("connection refused".into()));
        }
        let status = self.status.unwrap_or("RECIBIDA");
        Ok(SriResponse::new(status))
    }
}

#[allow(dead_code)]
pub struct FakePdf {
    pub fail: bool,
}

#[async_trait]
impl PdfGenerator for FakePdf {
    async fn render(&self, data: &PdfData) -> Result<Vec<u8>, ArtifactError> {
        if self.fail {
            return Err(ArtifactError::Render("template missing".into()));
        }
        Ok(format!("%PDF-1.4 {}", data.access_key).into_bytes())
    }
}

#[allow(dead_code)]
pub fn orchestrator(
    store: Arc<InMemoryStore>,
    authority: Arc<FakeAuthority>,
    pdf_fails: bool,
    pdf_dir: &Path,
) -> SubmissionOrchestrator {
    let storage = LocalStorage::new(pdf_dir, "http://files.test/pdfs").expect("local storage");
    SubmissionOrchestrator::new(
        store,
        CertificateResolver::default(),
        SigningOrchestrator::new(Arc::new(StubSigner)),
        authority,
        Arc::new(FakePdf { fail: pdf_fails }),
        Arc::new(storage),
    )
}

/// Poll `check` until it holds or two seconds pass.
#[allow(dead_code)]
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
