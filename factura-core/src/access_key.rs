//! The 49-digit SRI access key (`clave de acceso`).
//!
//! Layout of the first 48 digits, in order:
//!
//! | field          | width |
//! |----------------|-------|
//! | issue date     | 8 (`ddmmyyyy`) |
//! | document type  | 2 |
//! | taxpayer RUC   | 13 |
//! | environment    | 1 |
//! | series         | 6 (establishment + emission point) |
//! | sequential     | 9 |
//! | numeric code   | 8 |
//! | emission type  | 1 |
//!
//! followed by a modulus-11 check digit.
use chrono::NaiveDate;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const ACCESS_KEY_LEN: usize = 49;
const BODY_LEN: usize = ACCESS_KEY_LEN - 1;

/// Document type code for a sales invoice (`factura`).
pub const DOCUMENT_TYPE_INVOICE: &str = "01";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessKeyError {
    #[error("field '{field}' must be exactly {expected} digits, got '{value}'")]
    InvalidField {
        field: &'static str,
        expected: usize,
        value: String,
    },
    #[error("access key must be 49 digits, got {0}")]
    InvalidLength(usize),
    #[error("access key contains non-numeric characters")]
    NonNumeric,
    #[error("check digit mismatch: expected {expected}, found {found}")]
    CheckDigitMismatch { expected: u8, found: u8 },
}

/// Inputs for [`generate`]. Every field except the date is a digit string of
/// fixed width; nothing is padded implicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyParts {
    pub issue_date: NaiveDate,
    pub document_type: String,
    pub ruc: String,
    pub environment: String,
    pub series: String,
    pub sequential: String,
    pub numeric_code: String,
    pub emission_type: String,
}

impl AccessKeyParts {
    fn fields(&self) -> [(&'static str, usize, String); 8] {
        [
            ("issue_date", 8, self.issue_date.format("%d%m%Y").to_string()),
            ("document_type", 2, self.document_type.clone()),
            ("ruc", 13, self.ruc.clone()),
            ("environment", 1, self.environment.clone()),
            ("series", 6, self.series.clone()),
            ("sequential", 9, self.sequential.clone()),
            ("numeric_code", 8, self.numeric_code.clone()),
            ("emission_type", 1, self.emission_type.clone()),
        ]
    }
}

/// A validated access key.
///
/// # Examples
/// ```rust
/// use factura_core::access_key::AccessKey;
///
/// let key = AccessKey::parse("1503202401179001234500110010010000001231234567817")?;
/// assert_eq!(key.check_digit(), 7);
/// assert_eq!(key.components().sequential, "000000123");
/// # Ok::<(), factura_core::AccessKeyError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccessKey(String);

/// Fields decoded back out of an access key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessKeyComponents {
    pub issue_date: Option<NaiveDate>,
    pub document_type: String,
    pub ruc: String,
    pub environment: String,
    pub series: String,
    pub sequential: String,
    pub numeric_code: String,
    pub emission_type: String,
    pub check_digit: u8,
}

impl AccessKey {
    pub fn parse<S: Into<String>>(s: S) -> Result<Self, AccessKeyError> {
        let s = s.into().trim().to_string();
        if s.len() != ACCESS_KEY_LEN {
            return Err(AccessKeyError::InvalidLength(s.len()));
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AccessKeyError::NonNumeric);
        }
        let expected = modulo11_check_digit(&s[..BODY_LEN])?;
        let found = s.as_bytes()[BODY_LEN] - b'0';
        if expected != found {
            return Err(AccessKeyError::CheckDigitMismatch { expected, found });
        }
        Ok(AccessKey(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn check_digit(&self) -> u8 {
        self.0.as_bytes()[BODY_LEN] - b'0'
    }

    pub fn components(&self) -> AccessKeyComponents {
        let s = self.0.as_str();
        AccessKeyComponents {
            issue_date: NaiveDate::parse_from_str(&s[0..8], "%d%m%Y").ok(),
            document_type: s[8..10].to_string(),
            ruc: s[10..23].to_string(),
            environment: s[23..24].to_string(),
            series: s[24..30].to_string(),
            sequential: s[30..39].to_string(),
            numeric_code: s[39..47].to_string(),
            emission_type: s[47..48].to_string(),
            check_digit: self.check_digit(),
        }
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AccessKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl FromStr for AccessKey {
    type Err = AccessKeyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AccessKey::parse(s)
    }
}

impl TryFrom<String> for AccessKey {
    type Error = AccessKeyError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        AccessKey::parse(value)
    }
}

impl From<AccessKey> for String {
    fn from(key: AccessKey) -> String {
        key.0
    }
}

/// Build the access key for the given parts.
///
/// # Errors
/// Returns [`AccessKeyError::InvalidField`] when a field is not exactly its
/// fixed width of ASCII digits.
pub fn generate(parts: &AccessKeyParts) -> Result<AccessKey, AccessKeyError> {
    let mut body = String::with_capacity(ACCESS_KEY_LEN);
    for (field, expected, value) in parts.fields() {
        if value.len() != expected || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AccessKeyError::InvalidField {
                field,
                expected,
                value,
            });
        }
        body.push_str(&value);
    }
    let check = modulo11_check_digit(&body)?;
    body.push(char::from(b'0' + check));
    Ok(AccessKey(body))
}

/// Modulus-11 check digit with cyclic weights 2..=7 applied right to left.
/// A raw result of 11 maps to 0 and 10 maps to 1.
pub fn modulo11_check_digit(digits: &str) -> Result<u8, AccessKeyError> {
    let mut sum: u32 = 0;
    let mut weight: u32 = 2;
    for c in digits.chars().rev() {
        let digit = c.to_digit(10).ok_or(AccessKeyError::NonNumeric)?;
        sum += digit * weight;
        weight = if weight == 7 { 2 } else { weight + 1 };
    }
    Ok(match 11 - (sum % 11) {
        11 => 0,
        10 => 1,
        check => check as u8,
    })
}

/// Random 8-digit filler for the `codigo numerico` field.
pub fn random_numeric_code() -> String {
    let value: u32 = rand::thread_rng().gen_range(10_000_000..=99_999_999);
    value.to_string()
}
