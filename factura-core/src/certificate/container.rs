//! PKCS#12 containers in both the legacy layout (SHA-1 MAC, 3DES/RC2 bags)
//! and the one OpenSSL 3 writes by default (SHA-256 MAC, PBES2 with
//! PBKDF2 and AES-CBC).
//!
//! `p12` supplies the ASN.1 structures. MAC verification and bag
//! decryption happen here so every digest and cipher is checked before use.
use hmac::{Mac, SimpleHmac};
use p12::{AlgorithmIdentifier, CertBag, ContentInfo, MacData, PFX, SafeBag, SafeBagKind};
use pkcs5::{EncryptionScheme, pbes2};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512, digest::core_api::BlockSizeUser};
use std::fmt;
use thiserror::Error;
use x509_cert::der::Decode;
use yasna::models::ObjectIdentifier;

const OID_SHA256: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 2, 1];
const OID_SHA384: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 2, 2];
const OID_SHA512: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 2, 3];
const OID_PBES2: &[u64] = &[1, 2, 840, 113549, 1, 5, 13];
/// `pkcs-12-keyBag`: an unencrypted PKCS#8 key.
const OID_KEY_BAG: &[u64] = &[1, 2, 840, 113549, 1, 12, 10, 1, 1];

/// RFC 7292 appendix B diversifier for MAC keys.
const MAC_KEY_ID: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContainerError {
    #[error("not a PKCS#12 structure: {0}")]
    Malformed(String),
    #[error("unsupported PKCS#12 algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("password does not open the container")]
    WrongPassword,
}

/// A parsed, still locked, PKCS#12 container.
#[derive(Debug)]
pub struct Pkcs12Container {
    pfx: PFX,
}

/// Decrypted certificates and private keys, all DER.
#[derive(Clone, Default)]
pub struct ContainerContents {
    certificates: Vec<Vec<u8>>,
    shrouded_keys: Vec<Vec<u8>>,
    plain_keys: Vec<Vec<u8>>,
}

impl ContainerContents {
    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.certificates
    }

    /// The first `pkcs8ShroudedKeyBag` key, else the first plain `keyBag`.
    pub fn private_key(&self) -> Option<&[u8]> {
        self.shrouded_keys
            .first()
            .or_else(|| self.plain_keys.first())
            .map(Vec::as_slice)
    }
}

impl fmt::Debug for ContainerContents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerContents")
            .field("certificates", &self.certificates.len())
            .field("has_private_key", &self.private_key().is_some())
            .finish_non_exhaustive()
    }
}

impl Pkcs12Container {
    /// Parse the outer `PFX` structure. Accepts BER as well as DER.
    pub fn parse(bytes: &[u8]) -> Result<Self, ContainerError> {
        let pfx = yasna::parse_ber(bytes, |r| {
            r.read_sequence(|r| {
                let version = r.next().read_u8()?;
                let auth_safe = ContentInfo::parse(r.next())?;
                let mac_data = r.read_optional(MacData::parse)?;
                Ok(PFX {
                    version,
                    auth_safe,
                    mac_data,
                })
            })
        })
        .map_err(|e| ContainerError::Malformed(e.to_string()))?;
        if !matches!(pfx.auth_safe, ContentInfo::Data(_)) {
            return Err(ContainerError::UnsupportedAlgorithm(format!(
                "authSafe content type {}",
                dotted(&pfx.auth_safe.oid())
            )));
        }
        Ok(Self { pfx })
    }

    /// Verify the integrity MAC, then decrypt every bag.
    ///
    /// # Errors
    /// [`ContainerError::WrongPassword`] is only returned when the password
    /// is the problem. Algorithms this module cannot handle are reported as
    /// [`ContainerError::UnsupportedAlgorithm`] whatever the password.
    pub fn open(&self, password: &str) -> Result<ContainerContents, ContainerError> {
        let secret = Passwords::new(password);
        let ContentInfo::Data(auth_safe) = &self.pfx.auth_safe else {
            return Err(ContainerError::Malformed("authSafe is not data".into()));
        };
        if let Some(mac) = &self.pfx.mac_data {
            let digest = MacDigest::from_algorithm(&mac.mac.digest_algorithm)?;
            if !digest.verify(&secret.bmp, mac, auth_safe) {
                return Err(ContainerError::WrongPassword);
            }
        }

        let contents = yasna::parse_ber(auth_safe, |r| r.collect_sequence_of(ContentInfo::parse))
            .map_err(|e| ContainerError::Malformed(e.to_string()))?;
        let mut opened = ContainerContents::default();
        for content in &contents {
            let bags = match content {
                ContentInfo::Data(data) => parse_bags(data)
                    .map_err(|e| ContainerError::Malformed(e.to_string()))?,
                ContentInfo::EncryptedData(encrypted) => {
                    let info = &encrypted.encrypted_content_info;
                    let plain = decrypt(
                        &info.content_encryption_algorithm,
                        &info.encrypted_content,
                        &secret,
                    )?;
                    // Garbage that happens to unpad still fails here.
                    parse_bags(&plain).map_err(|_| ContainerError::WrongPassword)?
                }
                ContentInfo::OtherContext(other) => {
                    return Err(ContainerError::UnsupportedAlgorithm(format!(
                        "content type {}",
                        dotted(&other.content_type)
                    )));
                }
            };
            for bag in bags {
                opened.collect(bag, &secret)?;
            }
        }
        Ok(opened)
    }
}

impl ContainerContents {
    fn collect(&mut self, bag: SafeBag, secret: &Passwords) -> Result<(), ContainerError> {
        match bag.bag {
            SafeBagKind::CertBag(CertBag::X509(der)) => self.certificates.push(der),
            SafeBagKind::CertBag(CertBag::SDSI(_)) => {}
            SafeBagKind::Pkcs8ShroudedKeyBag(key) => {
                let der = decrypt(&key.encryption_algorithm, &key.encrypted_data, secret)?;
                self.shrouded_keys.push(der);
            }
            SafeBagKind::OtherBagKind(other) if is_oid(&other.bag_id, OID_KEY_BAG) => {
                self.plain_keys.push(other.bag_value);
            }
            SafeBagKind::OtherBagKind(_) => {}
        }
        Ok(())
    }
}

fn parse_bags(data: &[u8]) -> Result<Vec<SafeBag>, yasna::ASN1Error> {
    yasna::parse_ber(data, |r| r.collect_sequence_of(SafeBag::parse))
}

/// PKCS#12 PBE and MACs take the password as NUL-terminated UTF-16BE;
/// PBES2 takes the UTF-8 bytes.
struct Passwords<'a> {
    utf8: &'a str,
    bmp: Vec<u8>,
}

impl<'a> Passwords<'a> {
    fn new(password: &'a str) -> Self {
        let mut bmp: Vec<u8> = password.encode_utf16().flat_map(u16::to_be_bytes).collect();
        bmp.extend_from_slice(&[0, 0]);
        Self {
            utf8: password,
            bmp,
        }
    }
}

fn decrypt(
    algorithm: &AlgorithmIdentifier,
    ciphertext: &[u8],
    secret: &Passwords,
) -> Result<Vec<u8>, ContainerError> {
    match algorithm {
        AlgorithmIdentifier::PbewithSHAAnd40BitRC2CBC(_)
        | AlgorithmIdentifier::PbeWithSHAAnd3KeyTripleDESCBC(_) => algorithm
            .decrypt_pbe(ciphertext, &secret.bmp)
            .ok_or(ContainerError::WrongPassword),
        AlgorithmIdentifier::OtherAlg(other) if is_oid(&other.algorithm_type, OID_PBES2) => {
            let params = other
                .params
                .as_deref()
                .ok_or_else(|| ContainerError::Malformed("PBES2 without parameters".into()))?;
            let params = pbes2::Parameters::from_der(params).map_err(|e| {
                ContainerError::UnsupportedAlgorithm(format!("PBES2 parameters: {e}"))
            })?;
            match EncryptionScheme::Pbes2(params).decrypt(secret.utf8, ciphertext) {
                Ok(plain) => Ok(plain),
                Err(pkcs5::Error::DecryptFailed) => Err(ContainerError::WrongPassword),
                Err(e) => Err(ContainerError::UnsupportedAlgorithm(format!("PBES2: {e}"))),
            }
        }
        other => Err(ContainerError::UnsupportedAlgorithm(describe(other))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MacDigest {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl MacDigest {
    fn from_algorithm(algorithm: &AlgorithmIdentifier) -> Result<Self, ContainerError> {
        match algorithm {
            AlgorithmIdentifier::Sha1 => Ok(MacDigest::Sha1),
            AlgorithmIdentifier::OtherAlg(other) if is_oid(&other.algorithm_type, OID_SHA256) => {
                Ok(MacDigest::Sha256)
            }
            AlgorithmIdentifier::OtherAlg(other) if is_oid(&other.algorithm_type, OID_SHA384) => {
                Ok(MacDigest::Sha384)
            }
            AlgorithmIdentifier::OtherAlg(other) if is_oid(&other.algorithm_type, OID_SHA512) => {
                Ok(MacDigest::Sha512)
            }
            other => Err(ContainerError::UnsupportedAlgorithm(format!(
                "MAC {}",
                describe(other)
            ))),
        }
    }

    fn verify(self, bmp_password: &[u8], mac: &MacData, data: &[u8]) -> bool {
        let (salt, iterations, expected) = (&mac.salt, mac.iterations, &mac.mac.digest);
        match self {
            MacDigest::Sha1 => verify_hmac::<Sha1>(bmp_password, salt, iterations, data, expected),
            MacDigest::Sha256 => {
                verify_hmac::<Sha256>(bmp_password, salt, iterations, data, expected)
            }
            MacDigest::Sha384 => {
                verify_hmac::<Sha384>(bmp_password, salt, iterations, data, expected)
            }
            MacDigest::Sha512 => {
                verify_hmac::<Sha512>(bmp_password, salt, iterations, data, expected)
            }
        }
    }
}

fn verify_hmac<D: Digest + BlockSizeUser>(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    data: &[u8],
    expected: &[u8],
) -> bool {
    let key = derive_key::<D>(password, salt, MAC_KEY_ID, iterations, <D as Digest>::output_size());
    let Ok(mut mac) = <SimpleHmac<D> as Mac>::new_from_slice(&key) else {
        return false;
    };
    mac.update(data);
    mac.verify_slice(expected).is_ok()
}

/// RFC 7292 appendix B.2 key derivation.
fn derive_key<D: Digest + BlockSizeUser>(
    password: &[u8],
    salt: &[u8],
    id: u8,
    iterations: u32,
    len: usize,
) -> Vec<u8> {
    let v = D::block_size();
    let diversifier = vec![id; v];
    let mut input = [fill(salt, v), fill(password, v)].concat();
    let mut out = Vec::with_capacity(len + <D as Digest>::output_size());
    while out.len() < len {
        let mut block = D::new()
            .chain_update(&diversifier)
            .chain_update(&input)
            .finalize()
            .to_vec();
        for _ in 1..iterations.max(1) {
            block = D::digest(&block).to_vec();
        }
        let b: Vec<u8> = block.iter().cycle().take(v).copied().collect();
        for chunk in input.chunks_mut(v) {
            add_one_plus(chunk, &b);
        }
        out.extend_from_slice(&block);
    }
    out.truncate(len);
    out
}

/// Repeat `data` up to the next multiple of `v`; empty stays empty.
fn fill(data: &[u8], v: usize) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    data.iter()
        .cycle()
        .take(data.len().div_ceil(v) * v)
        .copied()
        .collect()
}

/// `chunk = (chunk + b + 1) mod 2^(8 * chunk.len())`, big-endian.
fn add_one_plus(chunk: &mut [u8], b: &[u8]) {
    let mut carry = 1u16;
    for (x, y) in chunk.iter_mut().zip(b).rev() {
        let sum = u16::from(*x) + u16::from(*y) + carry;
        *x = sum as u8;
        carry = sum >> 8;
    }
}

fn is_oid(oid: &ObjectIdentifier, expected: &[u64]) -> bool {
    oid.components().as_slice() == expected
}

fn dotted(oid: &ObjectIdentifier) -> String {
    oid.components()
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

fn describe(algorithm: &AlgorithmIdentifier) -> String {
    match algorithm {
        AlgorithmIdentifier::Sha1 => "sha1".to_string(),
        AlgorithmIdentifier::PbewithSHAAnd40BitRC2CBC(_) => "pbeWithSHAAnd40BitRC2-CBC".to_string(),
        AlgorithmIdentifier::PbeWithSHAAnd3KeyTripleDESCBC(_) => {
            "pbeWithSHAAnd3-KeyTripleDES-CBC".to_string()
        }
        AlgorithmIdentifier::OtherAlg(other) => dotted(&other.algorithm_type),
    }
}
