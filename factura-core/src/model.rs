//! Persisted records and their lifecycle states.
//!
//! Field names on the wire follow the document store's Spanish schema; the
//! Rust names are English.
use crate::config::EnvironmentType;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Submission state of an invoice as stored in `sri_estado`.
///
/// Anything the authority reports other than `RECIBIDA` is kept verbatim in
/// [`SriStatus::Authority`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SriStatus {
    Pendiente,
    ErrorFirma,
    ErrorProceso,
    Recibida,
    Authority(String),
}

impl SriStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SriStatus::Pendiente => "PENDIENTE",
            SriStatus::ErrorFirma => "ERROR_FIRMA",
            SriStatus::ErrorProceso => "ERROR_PROCESO",
            SriStatus::Recibida => "RECIBIDA",
            SriStatus::Authority(status) => status,
        }
    }

    /// States from which the pipeline can be run again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SriStatus::Pendiente | SriStatus::ErrorFirma | SriStatus::ErrorProceso
        )
    }
}

impl From<String> for SriStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "PENDIENTE" => SriStatus::Pendiente,
            "ERROR_FIRMA" => SriStatus::ErrorFirma,
            "ERROR_PROCESO" => SriStatus::ErrorProceso,
            "RECIBIDA" => SriStatus::Recibida,
            _ => SriStatus::Authority(value),
        }
    }
}

impl From<&str> for SriStatus {
    fn from(value: &str) -> Self {
        SriStatus::from(value.to_string())
    }
}

impl From<SriStatus> for String {
    fn from(status: SriStatus) -> String {
        status.as_str().to_string()
    }
}

impl fmt::Display for SriStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    #[serde(rename = "empresa_emisora_id")]
    pub company_id: String,
    #[serde(rename = "cliente_id")]
    pub client_id: String,
    #[serde(rename = "fecha_emision")]
    pub issue_date: NaiveDate,
    #[serde(rename = "clave_acceso")]
    pub access_key: String,
    #[serde(rename = "secuencial")]
    pub sequential: String,
    #[serde(rename = "estado")]
    pub state: String,
    #[serde(rename = "total_sin_impuestos")]
    pub subtotal: f64,
    #[serde(rename = "total_iva")]
    pub total_vat: f64,
    #[serde(rename = "total_con_impuestos")]
    pub total: f64,
    pub xml: String,
    #[serde(rename = "xml_firmado")]
    pub signed_xml: Option<String>,
    #[serde(rename = "sri_estado")]
    pub sri_status: SriStatus,
    #[serde(rename = "sri_mensajes")]
    pub sri_messages: Option<serde_json::Value>,
    #[serde(rename = "sri_fecha_envio")]
    pub sri_sent_at: Option<DateTime<Utc>>,
    #[serde(rename = "sri_fecha_respuesta")]
    pub sri_responded_at: Option<DateTime<Utc>>,
    #[serde(rename = "datos_originales")]
    pub original_request: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Invoice {
    pub const STATE_CREATED: &'static str = "CREADA";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceDetail {
    pub id: String,
    #[serde(rename = "factura_id")]
    pub invoice_id: String,
    #[serde(rename = "producto_id")]
    pub product_id: String,
    #[serde(rename = "cantidad")]
    pub quantity: f64,
    #[serde(rename = "precio_unitario")]
    pub unit_price: f64,
    pub subtotal: f64,
    #[serde(rename = "valor_iva")]
    pub vat_amount: f64,
}

/// Taxpayer emitting invoices.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuingCompany {
    pub id: String,
    pub ruc: String,
    #[serde(rename = "razon_social")]
    pub business_name: String,
    #[serde(rename = "nombre_comercial")]
    pub trade_name: String,
    #[serde(rename = "direccion_matriz")]
    pub head_office_address: Option<String>,
    #[serde(rename = "direccion_establecimiento")]
    pub establishment_address: Option<String>,
    #[serde(rename = "telefono")]
    pub phone: Option<String>,
    pub email: Option<String>,
    #[serde(rename = "codigo_establecimiento", default = "default_point")]
    pub establishment_code: String,
    #[serde(rename = "punto_emision", default = "default_point")]
    pub emission_point: String,
    #[serde(rename = "tipo_ambiente")]
    pub environment: EnvironmentType,
    #[serde(rename = "tipo_emision", default = "default_emission_type")]
    pub emission_type: u8,
    #[serde(rename = "obligado_contabilidad", default)]
    pub keeps_accounting: bool,
    #[serde(rename = "contribuyente_especial")]
    pub special_taxpayer: Option<String>,
    /// Base64-encoded PKCS#12 container.
    pub certificate: Option<String>,
    /// Plaintext or `hex(iv):hex(ciphertext)`.
    pub certificate_password: Option<String>,
}

fn default_point() -> String {
    "001".to_string()
}

fn default_emission_type() -> u8 {
    1
}

impl IssuingCompany {
    /// Establishment code followed by emission point, e.g. `001001`.
    pub fn series(&self) -> String {
        format!("{}{}", self.establishment_code, self.emission_point)
    }

    pub fn has_certificate(&self) -> bool {
        self.certificate
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }
}

// Certificate material stays out of logs.
impl fmt::Debug for IssuingCompany {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuingCompany")
            .field("id", &self.id)
            .field("ruc", &self.ruc)
            .field("business_name", &self.business_name)
            .field("series", &self.series())
            .field("environment", &self.environment)
            .field("emission_type", &self.emission_type)
            .field("has_certificate", &self.has_certificate())
            .finish_non_exhaustive()
    }
}

/// Buyer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    #[serde(rename = "identificacion")]
    pub identification: String,
    #[serde(rename = "tipo_identificacion")]
    pub identification_type: String,
    #[serde(rename = "razon_social")]
    pub name: String,
    pub email: Option<String>,
    #[serde(rename = "direccion")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    #[serde(rename = "codigo")]
    pub code: String,
    #[serde(rename = "descripcion")]
    pub description: String,
    #[serde(rename = "precio_unitario")]
    pub unit_price: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentificationType {
    pub id: String,
    #[serde(rename = "codigo")]
    pub code: String,
    #[serde(rename = "descripcion")]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PdfStatus {
    Generado,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailStatus {
    #[default]
    NoEnviado,
    Pendiente,
    Enviado,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmailDeliveryError {
    #[error("email recipient is required")]
    MissingRecipient,
    #[error("email already sent successfully")]
    AlreadySent,
    #[error("no email delivery is pending")]
    NotPending,
}

/// Rendered PDF of an accepted invoice. Only a reference to the stored file
/// is kept, never the bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoicePdf {
    pub id: String,
    #[serde(rename = "factura_id")]
    pub invoice_id: String,
    #[serde(rename = "claveAcceso")]
    pub access_key: String,
    #[serde(rename = "pdf_url")]
    pub url: String,
    #[serde(rename = "pdf_public_id")]
    pub public_id: String,
    #[serde(rename = "pdf_provider")]
    pub provider: String,
    #[serde(rename = "fecha_generacion")]
    pub generated_at: DateTime<Utc>,
    #[serde(rename = "estado")]
    pub status: PdfStatus,
    #[serde(rename = "tamano_archivo")]
    pub size: u64,
    #[serde(rename = "numero_autorizacion")]
    pub authorization_number: String,
    #[serde(rename = "fecha_autorizacion")]
    pub authorization_date: DateTime<Utc>,
    #[serde(rename = "email_estado", default)]
    pub email_status: EmailStatus,
    #[serde(rename = "email_destinatario")]
    pub email_recipient: Option<String>,
    #[serde(rename = "email_fecha_envio")]
    pub email_sent_at: Option<DateTime<Utc>>,
    #[serde(rename = "email_intentos", default)]
    pub email_attempts: u32,
    #[serde(rename = "email_ultimo_error")]
    pub email_last_error: Option<String>,
}

impl InvoicePdf {
    /// Queue delivery to `recipient`, resetting the attempt counter.
    pub fn queue_email(&mut self, recipient: &str) -> Result<(), EmailDeliveryError> {
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(EmailDeliveryError::MissingRecipient);
        }
        self.email_status = EmailStatus::Pendiente;
        self.email_recipient = Some(recipient.to_string());
        self.email_attempts = 0;
        self.email_last_error = None;
        Ok(())
    }

    pub fn retry_email(&mut self) -> Result<(), EmailDeliveryError> {
        if self.email_status == EmailStatus::Enviado {
            return Err(EmailDeliveryError::AlreadySent);
        }
        if self.email_recipient.is_none() {
            return Err(EmailDeliveryError::MissingRecipient);
        }
        self.email_status = EmailStatus::Pendiente;
        self.email_last_error = None;
        Ok(())
    }

    pub fn mark_email_sent(&mut self, at: DateTime<Utc>) -> Result<(), EmailDeliveryError> {
        if self.email_status != EmailStatus::Pendiente {
            return Err(EmailDeliveryError::NotPending);
        }
        self.email_status = EmailStatus::Enviado;
        self.email_sent_at = Some(at);
        self.email_attempts += 1;
        Ok(())
    }

    pub fn mark_email_failed(&mut self, error: impl Into<String>) -> Result<(), EmailDeliveryError> {
        if self.email_status != EmailStatus::Pendiente {
            return Err(EmailDeliveryError::NotPending);
        }
        self.email_status = EmailStatus::Error;
        self.email_attempts += 1;
        self.email_last_error = Some(error.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pdf() -> InvoicePdf {
        InvoicePdf {
            id: "pdf-1".into(),
            invoice_id: "inv-1".into(),
            access_key: "1503202401179001234500110010010000001231234567817".into(),
            url: "http://localhost/pdfs/a.pdf".into(),
            public_id: "a".into(),
            provider: "local".into(),
            generated_at: Utc::now(),
            status: PdfStatus::Generado,
            size: 10,
            authorization_number: "1503202401179001234500110010010000001231234567817".into(),
            authorization_date: Utc::now(),
            email_status: EmailStatus::default(),
            email_recipient: None,
            email_sent_at: None,
            email_attempts: 0,
            email_last_error: None,
        }
    }

    #[test]
    fn sri_status_round_trips_known_and_authority_values() {
        assert_eq!(SriStatus::from("RECIBIDA"), SriStatus::Recibida);
        assert_eq!(
            SriStatus::from("DEVUELTA"),
            SriStatus::Authority("DEVUELTA".into())
        );
        let json = serde_json::to_string(&SriStatus::ErrorFirma).unwrap();
        assert_eq!(json, "\"ERROR_FIRMA\"");
        let parsed: SriStatus = serde_json::from_str("\"PENDIENTE\"").unwrap();
        assert_eq!(parsed, SriStatus::Pendiente);
        assert!(SriStatus::ErrorProceso.is_retryable());
        assert!(!SriStatus::Recibida.is_retryable());
    }

    #[test]
    fn email_delivery_transitions() {
        let mut pdf = pdf();
        assert_eq!(
            pdf.queue_email("  "),
            Err(EmailDeliveryError::MissingRecipient)
        );
        pdf.queue_email("compras@cliente.ec").unwrap();
        assert_eq!(pdf.email_status, EmailStatus::Pendiente);

        pdf.mark_email_failed("smtp timeout").unwrap();
        assert_eq!(pdf.email_status, EmailStatus::Error);
        assert_eq!(pdf.email_attempts, 1);

        pdf.retry_email().unwrap();
        assert_eq!(pdf.email_last_error, None);
        pdf.mark_email_sent(Utc::now()).unwrap();
        assert_eq!(pdf.email_status, EmailStatus::Enviado);
        assert_eq!(pdf.email_attempts, 2);
        assert_eq!(pdf.retry_email(), Err(EmailDeliveryError::AlreadySent));
    }

    #[test]
    fn company_debug_hides_certificate_material() {
        let company = IssuingCompany {
            id: "c1".into(),
            ruc: "1790012345001".into(),
            business_name: "COMERCIAL ANDINA S.A.".into(),
            trade_name: "ANDINA".into(),
            head_office_address: None,
            establishment_address: None,
            phone: None,
            email: None,
            establishment_code: "001".into(),
            emission_point: "002".into(),
            environment: EnvironmentType::Pruebas,
            emission_type: 1,
            keeps_accounting: false,
            special_taxpayer: None,
            certificate: Some("TUlJ".into()),
            certificate_password: Some("secret-pass".into()),
        };
        let debug = format!("{company:?}");
        assert!(!debug.contains("secret-pass"));
        assert!(!debug.contains("TUlJ"));
        assert_eq!(company.series(), "001002");
    }
}
