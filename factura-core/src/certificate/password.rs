//! Certificate password handling: at-rest encryption and recovery candidates.
use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use tracing::warn;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_LEN: usize = 16;

/// Separator between the hex IV and the hex ciphertext.
pub const IV_DELIMITER: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PasswordCipherError {
    #[error("encrypted password must be 'iv:ciphertext'")]
    Format,
    #[error("invalid hex in encrypted password: {0}")]
    Hex(String),
    #[error("IV must be 16 bytes, got {0}")]
    IvLength(usize),
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("decrypted password is not UTF-8")]
    Utf8,
}

/// AES-256-CBC cipher for certificate passwords stored at rest as
/// `hex(iv):hex(ciphertext)`. The key is the SHA-256 digest of the configured
/// secret.
///
/// # Examples
/// ```rust
/// use factura_core::certificate::PasswordCipher;
///
/// let cipher = PasswordCipher::new("server-secret");
/// let stored = cipher.encrypt("clave123");
/// assert!(stored.contains(':'));
/// assert_eq!(cipher.decrypt(&stored)?, "clave123");
/// # Ok::<(), factura_core::certificate::PasswordCipherError>(())
/// ```
#[derive(Clone)]
pub struct PasswordCipher {
    key: [u8; 32],
}

impl fmt::Debug for PasswordCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordCipher { .. }")
    }
}

impl PasswordCipher {
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        format!("{}{IV_DELIMITER}{}", hex::encode(iv), hex::encode(ciphertext))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, PasswordCipherError> {
        let (iv_hex, ct_hex) = stored
            .split_once(IV_DELIMITER)
            .ok_or(PasswordCipherError::Format)?;
        let iv = hex::decode(iv_hex.trim()).map_err(|e| PasswordCipherError::Hex(e.to_string()))?;
        let ciphertext =
            hex::decode(ct_hex.trim()).map_err(|e| PasswordCipherError::Hex(e.to_string()))?;
        if iv.len() != IV_LEN {
            return Err(PasswordCipherError::IvLength(iv.len()));
        }
        let plaintext = Aes256CbcDec::new_from_slices(&self.key, &iv)
            .map_err(|e| PasswordCipherError::Decrypt(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|e| PasswordCipherError::Decrypt(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|_| PasswordCipherError::Utf8)
    }
}

/// Where the password handed to the container came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordSource {
    /// Stored value used as-is.
    Plaintext,
    /// Stored value decrypted with the configured key.
    Decrypted,
    /// Stored value looked encrypted but could not be decrypted, so it was
    /// used as plaintext.
    DecryptionFallback,
}

/// Turn the stored password into the plaintext candidate.
///
/// A value containing [`IV_DELIMITER`] is treated as encrypted. When it
/// cannot be decrypted, or no cipher is configured, the stored value is used
/// verbatim and the fallback is logged at `warn`.
pub fn resolve_stored_password(
    stored: &str,
    cipher: Option<&PasswordCipher>,
) -> (SecretString, PasswordSource) {
    if !stored.contains(IV_DELIMITER) {
        return (SecretString::from(stored), PasswordSource::Plaintext);
    }
    let reason = match cipher {
        Some(cipher) => match cipher.decrypt(stored) {
            Ok(plaintext) => return (SecretString::from(plaintext), PasswordSource::Decrypted),
            Err(e) => e.to_string(),
        },
        None => "no encryption key configured".to_string(),
    };
    warn!(
        reason = %reason,
        "stored certificate password looks encrypted but could not be decrypted; using it as plaintext"
    );
    (SecretString::from(stored), PasswordSource::DecryptionFallback)
}

/// Ordered, de-duplicated passwords to try when the resolved one fails.
///
/// Labels identify a candidate in logs without revealing the original.
pub fn recovery_candidates(original: &SecretString) -> Vec<(&'static str, SecretString)> {
    let original = original.expose_secret();
    let ordered: [(&'static str, String); 7] = [
        ("original", original.to_string()),
        ("empty", String::new()),
        ("password", "password".to_string()),
        ("123456", "123456".to_string()),
        ("admin", "admin".to_string()),
        ("lowercase", original.to_lowercase()),
        ("uppercase", original.to_uppercase()),
    ];
    let mut seen: Vec<String> = Vec::with_capacity(ordered.len());
    let mut candidates = Vec::with_capacity(ordered.len());
    for (label, value) in ordered {
        if seen.contains(&value) {
            continue;
        }
        seen.push(value.clone());
        candidates.push((label, SecretString::from(value)));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_uses_fresh_iv() {
        let cipher = PasswordCipher::new("k");
        let a = cipher.encrypt("same");
        let b = cipher.encrypt("same");
        assert_ne!(a, b);
        assert_eq!(a.split(':').next().map(str::len), Some(32));
        assert_eq!(cipher.decrypt(&b).unwrap(), "same");
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let stored = PasswordCipher::new("right").encrypt("clave-larga-123");
        assert!(PasswordCipher::new("wrong").decrypt(&stored).is_err());
        assert_eq!(
            PasswordCipher::new("k").decrypt("no-delimiter"),
            Err(PasswordCipherError::Format)
        );
        assert!(matches!(
            PasswordCipher::new("k").decrypt("zz:00"),
            Err(PasswordCipherError::Hex(_))
        ));
        assert_eq!(
            PasswordCipher::new("k").decrypt("0011:00"),
            Err(PasswordCipherError::IvLength(2))
        );
    }

    #[test]
    fn stored_password_resolution() {
        let cipher = PasswordCipher::new("secret");
        let (pw, source) = resolve_stored_password("plain", Some(&cipher));
        assert_eq!(pw.expose_secret(), "plain");
        assert_eq!(source, PasswordSource::Plaintext);

        let stored = cipher.encrypt("hidden");
        let (pw, source) = resolve_stored_password(&stored, Some(&cipher));
        assert_eq!(pw.expose_secret(), "hidden");
        assert_eq!(source, PasswordSource::Decrypted);

        let (pw, source) = resolve_stored_password("a:b", Some(&cipher));
        assert_eq!(pw.expose_secret(), "a:b");
        assert_eq!(source, PasswordSource::DecryptionFallback);

        let (_, source) = resolve_stored_password(&stored, None);
        assert_eq!(source, PasswordSource::DecryptionFallback);
    }

    #[test]
    fn candidates_are_ordered_and_deduplicated() {
        let labels: Vec<_> = recovery_candidates(&SecretString::from("Clave"))
            .into_iter()
            .map(|(label, _)| label)
            .collect();
        assert_eq!(
            labels,
            ["original", "empty", "password", "123456", "admin", "lowercase", "uppercase"]
        );

        let candidates = recovery_candidates(&SecretString::from("admin"));
        let labels: Vec<_> = candidates.iter().map(|(label, _)| *label).collect();
        assert_eq!(labels, ["original", "empty", "password", "123456", "uppercase"]);

        let candidates = recovery_candidates(&SecretString::from(""));
        assert_eq!(candidates.len(), 4);
    }
}
