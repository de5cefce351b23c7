//! Key material and signature primitives.
//!
//! Certificates are accepted either as PEM or as the bare base64 DER that
//! appears inside `<ds:X509Certificate>` and metadata documents. ECDSA
//! signatures use the raw `r || s` encoding required by XML-DSig on the wire
//! and are converted to DER only at the OpenSSL boundary.

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{
    bn::BigNum,
    ecdsa::EcdsaSig,
    hash::MessageDigest,
    pkey::{Id, PKey, Private, Public},
    sign::{Signer, Verifier},
    x509::X509,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid certificate: {0}")]
    Certificate(String),

    #[error("Invalid private key: {0}")]
    Key(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Key type does not match algorithm {0}")]
    KeyMismatch(&'static str),

    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
}

// ─────────────────────────────────────────────────────────────────────────────
// Algorithms
// ─────────────────────────────────────────────────────────────────────────────

/// XML-DSig signature algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureAlgorithm {
    RsaSha1,
    #[default]
    RsaSha256,
    RsaSha384,
    RsaSha512,
    EcdsaSha256,
    EcdsaSha384,
    EcdsaSha512,
}

impl SignatureAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            SignatureAlgorithm::RsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384",
            SignatureAlgorithm::RsaSha512 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
            SignatureAlgorithm::EcdsaSha256 => {
                "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256"
            }
            SignatureAlgorithm::EcdsaSha384 => {
                "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha384"
            }
            SignatureAlgorithm::EcdsaSha512 => {
                "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha512"
            }
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self, CryptoError> {
        [
            SignatureAlgorithm::RsaSha1,
            SignatureAlgorithm::RsaSha256,
            SignatureAlgorithm::RsaSha384,
            SignatureAlgorithm::RsaSha512,
            SignatureAlgorithm::EcdsaSha256,
            SignatureAlgorithm::EcdsaSha384,
            SignatureAlgorithm::EcdsaSha512,
        ]
        .into_iter()
        .find(|alg| alg.uri() == uri)
        .ok_or_else(|| CryptoError::UnsupportedAlgorithm(uri.to_string()))
    }

    fn message_digest(&self) -> MessageDigest {
        match self {
            SignatureAlgorithm::RsaSha1 => MessageDigest::sha1(),
            SignatureAlgorithm::RsaSha256 | SignatureAlgorithm::EcdsaSha256 => {
                MessageDigest::sha256()
            }
            SignatureAlgorithm::RsaSha384 | SignatureAlgorithm::EcdsaSha384 => {
                MessageDigest::sha384()
            }
            SignatureAlgorithm::RsaSha512 | SignatureAlgorithm::EcdsaSha512 => {
                MessageDigest::sha512()
            }
        }
    }

    pub fn is_ecdsa(&self) -> bool {
        matches!(
            self,
            SignatureAlgorithm::EcdsaSha256
                | SignatureAlgorithm::EcdsaSha384
                | SignatureAlgorithm::EcdsaSha512
        )
    }
}

/// XML-DSig digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha1,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            DigestAlgorithm::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            DigestAlgorithm::Sha384 => "http://www.w3.org/2001/04/xmldsig-more#sha384",
            DigestAlgorithm::Sha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self, CryptoError> {
        [
            DigestAlgorithm::Sha1,
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384,
            DigestAlgorithm::Sha512,
        ]
        .into_iter()
        .find(|alg| alg.uri() == uri)
        .ok_or_else(|| CryptoError::UnsupportedAlgorithm(uri.to_string()))
    }

    fn message_digest(&self) -> MessageDigest {
        match self {
            DigestAlgorithm::Sha1 => MessageDigest::sha1(),
            DigestAlgorithm::Sha256 => MessageDigest::sha256(),
            DigestAlgorithm::Sha384 => MessageDigest::sha384(),
            DigestAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }

    pub fn digest(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(openssl::hash::hash(self.message_digest(), data)?.to_vec())
    }
}

/// Hash used to compare certificate fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintAlgorithm {
    Sha1,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl FingerprintAlgorithm {
    fn message_digest(&self) -> MessageDigest {
        match self {
            FingerprintAlgorithm::Sha1 => MessageDigest::sha1(),
            FingerprintAlgorithm::Sha256 => MessageDigest::sha256(),
            FingerprintAlgorithm::Sha384 => MessageDigest::sha384(),
            FingerprintAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }
}

impl fmt::Display for FingerprintAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FingerprintAlgorithm::Sha1 => "sha1",
            FingerprintAlgorithm::Sha256 => "sha256",
            FingerprintAlgorithm::Sha384 => "sha384",
            FingerprintAlgorithm::Sha512 => "sha512",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for FingerprintAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(FingerprintAlgorithm::Sha1),
            "sha256" => Ok(FingerprintAlgorithm::Sha256),
            "sha384" => Ok(FingerprintAlgorithm::Sha384),
            "sha512" => Ok(FingerprintAlgorithm::Sha512),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificates and keys
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed X.509 certificate.
#[derive(Clone)]
pub struct Certificate {
    x509: X509,
    der: Vec<u8>,
}

impl Certificate {
    /// Parse a certificate given as PEM or as bare base64 DER.
    pub fn parse(input: &str) -> Result<Self, CryptoError> {
        let trimmed = input.trim();
        let x509 = if trimmed.contains("-----BEGIN") {
            X509::from_pem(trimmed.as_bytes())
                .map_err(|e| CryptoError::Certificate(e.to_string()))?
        } else {
            let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
            let der = STANDARD
                .decode(compact)
                .map_err(|e| CryptoError::Certificate(format!("invalid base64: {e}")))?;
            X509::from_der(&der).map_err(|e| CryptoError::Certificate(e.to_string()))?
        };
        let der = x509.to_der()?;
        Ok(Self { x509, der })
    }

    pub fn public_key(&self) -> Result<PKey<Public>, CryptoError> {
        Ok(self.x509.public_key()?)
    }

    /// Lowercase hex fingerprint without separators.
    pub fn fingerprint(&self, algorithm: FingerprintAlgorithm) -> Result<String, CryptoError> {
        let digest = self.x509.digest(algorithm.message_digest())?;
        Ok(hex::encode(digest))
    }

    pub fn matches_fingerprint(&self, expected: &str, algorithm: FingerprintAlgorithm) -> bool {
        self.fingerprint(algorithm)
            .map(|actual| actual == normalize_fingerprint(expected))
            .unwrap_or(false)
    }

    /// Base64 DER, as embedded in metadata and `KeyInfo`.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.der)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subject = self
            .x509
            .subject_name()
            .entries()
            .map(|e| String::from_utf8_lossy(e.data().as_slice()).into_owned())
            .collect::<Vec<_>>()
            .join(",");
        f.debug_struct("Certificate")
            .field("subject", &subject)
            .finish_non_exhaustive()
    }
}

/// Strip colons and whitespace and lowercase a configured fingerprint.
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// A private signing key with its optional public certificate.
#[derive(Clone)]
pub struct SigningKey {
    key: PKey<Private>,
    certificate: Option<Certificate>,
}

impl SigningKey {
    pub fn from_pem(key_pem: &str, certificate: Option<Certificate>) -> Result<Self, CryptoError> {
        let key = PKey::private_key_from_pem(key_pem.trim().as_bytes())
            .map_err(|e| CryptoError::Key(e.to_string()))?;
        Ok(Self { key, certificate })
    }

    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    pub fn is_ec(&self) -> bool {
        self.key.id() == Id::EC
    }

    /// Default algorithm for this key type.
    pub fn default_algorithm(&self) -> SignatureAlgorithm {
        if self.is_ec() {
            SignatureAlgorithm::EcdsaSha256
        } else {
            SignatureAlgorithm::RsaSha256
        }
    }

    pub fn sign(&self, algorithm: SignatureAlgorithm, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if algorithm.is_ecdsa() != self.is_ec() {
            return Err(CryptoError::KeyMismatch(algorithm.uri()));
        }
        let mut signer = Signer::new(algorithm.message_digest(), &self.key)?;
        signer.update(data)?;
        let signature = signer.sign_to_vec()?;
        if algorithm.is_ecdsa() {
            ecdsa_der_to_raw(&signature, field_size(self.key.bits()))
        } else {
            Ok(signature)
        }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("ec", &self.is_ec())
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

/// Verify `signature` over `data` with a certificate's public key.
pub fn verify(
    certificate: &Certificate,
    algorithm: SignatureAlgorithm,
    data: &[u8],
    signature: &[u8],
) -> Result<bool, CryptoError> {
    let key = certificate.public_key()?;
    if algorithm.is_ecdsa() != (key.id() == Id::EC) {
        return Ok(false);
    }
    let signature = if algorithm.is_ecdsa() {
        match ecdsa_raw_to_der(signature) {
            Ok(der) => der,
            Err(_) => return Ok(false),
        }
    } else {
        signature.to_vec()
    };
    let mut verifier = Verifier::new(algorithm.message_digest(), &key)?;
    verifier.update(data)?;
    // OpenSSL reports malformed signatures as errors rather than `false`.
    Ok(verifier.verify(&signature).unwrap_or(false))
}

fn field_size(bits: u32) -> usize {
    (bits as usize).div_ceil(8)
}

fn ecdsa_der_to_raw(der: &[u8], size: usize) -> Result<Vec<u8>, CryptoError> {
    let sig = EcdsaSig::from_der(der)?;
    let pad = i32::try_from(size).map_err(|_| CryptoError::KeyMismatch("ecdsa"))?;
    let mut raw = sig.r().to_vec_padded(pad)?;
    raw.extend(sig.s().to_vec_padded(pad)?);
    Ok(raw)
}

fn ecdsa_raw_to_der(raw: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(CryptoError::KeyMismatch("ecdsa"));
    }
    let (r, s) = raw.split_at(raw.len() / 2);
    let sig = EcdsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?;
    Ok(sig.to_der()?)
}

/// A fresh SAML identifier: `_` followed by 40 hex characters of OS randomness.
///
/// The leading underscore keeps the value a valid `xs:ID` (NCName).
pub fn generate_id() -> String {
    let mut bytes = [0u8; 20];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("_{}", hex::encode(bytes))
}
