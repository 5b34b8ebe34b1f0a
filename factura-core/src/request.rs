//! Inbound invoice request, as posted by callers.
//!
//! Every block is optional at the type level so that a missing block is a
//! validation error rather than a deserialization failure.
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InvoiceRequest {
    #[serde(rename = "infoTributaria", default, skip_serializing_if = "Option::is_none")]
    pub tax_info: Option<TaxInfo>,
    #[serde(rename = "infoFactura", default, skip_serializing_if = "Option::is_none")]
    pub invoice_info: Option<InvoiceInfo>,
    #[serde(rename = "detalles", default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<DetailEntry>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaxInfo {
    pub ruc: String,
    #[serde(rename = "razonSocial", default, skip_serializing_if = "Option::is_none")]
    pub business_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InvoiceInfo {
    #[serde(rename = "fechaEmision")]
    pub issue_date: String,
    #[serde(rename = "tipoIdentificacionComprador")]
    pub buyer_identification_type: String,
    #[serde(rename = "identificacionComprador")]
    pub buyer_identification: String,
    #[serde(rename = "razonSocialComprador", default, skip_serializing_if = "Option::is_none")]
    pub buyer_name: Option<String>,
    #[serde(rename = "totalSinImpuestos")]
    pub subtotal: String,
    #[serde(rename = "totalDescuento", default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<String>,
    #[serde(rename = "importeTotal")]
    pub total: String,
    #[serde(rename = "moneda", default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

/// One entry of `detalles`, wrapped in a `detalle` object on the wire.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetailEntry {
    #[serde(rename = "detalle")]
    pub detail: LineItem,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(rename = "codigoPrincipal")]
    pub product_code: String,
    #[serde(rename = "descripcion", default)]
    pub description: String,
    #[serde(rename = "cantidad")]
    pub quantity: String,
    #[serde(rename = "precioUnitario")]
    pub unit_price: String,
    #[serde(rename = "descuento", default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<String>,
    #[serde(rename = "precioTotalSinImpuesto")]
    pub total_without_tax: String,
    #[serde(rename = "impuestos", default)]
    pub taxes: Vec<TaxEntry>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaxEntry {
    #[serde(rename = "impuesto")]
    pub tax: Tax,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Tax {
    #[serde(rename = "codigo")]
    pub code: String,
    #[serde(rename = "codigoPorcentaje")]
    pub rate_code: String,
    #[serde(rename = "tarifa", default)]
    pub rate: String,
    #[serde(rename = "baseImponible")]
    pub taxable_base: String,
    #[serde(rename = "valor")]
    pub amount: String,
}

impl LineItem {
    /// VAT of the line: the first tax entry's amount, zero when none is listed.
    pub fn vat_amount(&self) -> Result<f64, String> {
        match self.taxes.first() {
            Some(entry) => parse_amount("impuesto.valor", &entry.tax.amount),
            None => Ok(0.0),
        }
    }
}

/// Parse an emission date written as `dd/mm/yyyy`, also accepting ISO
/// `yyyy-mm-dd`.
///
/// # Examples
/// ```rust
/// use chrono::NaiveDate;
/// use factura_core::request::parse_issue_date;
///
/// assert_eq!(parse_issue_date("15/03/2024"), NaiveDate::from_ymd_opt(2024, 3, 15));
/// assert_eq!(parse_issue_date("2024-03-15"), NaiveDate::from_ymd_opt(2024, 3, 15));
/// assert_eq!(parse_issue_date("31/02/2024"), None);
/// ```
pub fn parse_issue_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .ok()
}

/// Parse a decimal money or quantity field, naming the field on failure.
pub fn parse_amount(field: &str, value: &str) -> Result<f64, String> {
    let parsed: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("field '{field}' is not a number: '{value}'"))?;
    if !parsed.is_finite() {
        return Err(format!("field '{field}' is not a finite number: '{value}'"));
    }
    Ok(parsed)
}
