//! XML capability layer.
//!
//! The protocol engine never touches a parser or OpenSSL directly for
//! XML-level work; it goes through [`XmlSecurity`], which parses and
//! serializes documents and creates and checks enveloped XML signatures.
//! [`OpenSslXmlSecurity`] is the production implementation.

use std::borrow::Cow;

pub mod c14n;
pub mod dom;
pub mod dsig;

pub use dom::{Attribute, Element, Node};
pub use dsig::OpenSslXmlSecurity;

use crate::crypto::{Certificate, CryptoError, DigestAlgorithm, SignatureAlgorithm, SigningKey};

pub const NS_SAMLP: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const NS_SAML: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const NS_MD: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
pub const NS_DS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const NS_XML: &str = "http://www.w3.org/XML/1998/namespace";

/// Upper bound on a parsed document, in bytes.
pub const MAX_DOCUMENT_SIZE: usize = 1024 * 1024;

/// Maximum element nesting accepted by the parser.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("XML parse error: {0}")]
    Parse(String),

    #[error("Forbidden XML construct: {0}")]
    Forbidden(&'static str),

    #[error("Document too large")]
    TooLarge,

    #[error("Missing signature")]
    MissingSignature,

    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    #[error("Digest mismatch")]
    DigestMismatch,

    #[error("No trusted certificate verifies the signature")]
    UntrustedSignature,

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Certificates a signature may be verified against.
///
/// A signature is trusted when one of `certificates` verifies it, or when a
/// certificate embedded in its `KeyInfo` matches one of `fingerprints` and
/// verifies it.
#[derive(Debug, Clone, Default)]
pub struct TrustAnchors {
    pub certificates: Vec<Certificate>,
    pub fingerprints: Vec<String>,
    pub fingerprint_algorithm: crate::crypto::FingerprintAlgorithm,
}

impl TrustAnchors {
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty() && self.fingerprints.is_empty()
    }
}

/// Parameters for creating an enveloped signature.
#[derive(Debug, Clone, Copy)]
pub struct SignOptions<'a> {
    pub key: &'a SigningKey,
    pub signature_algorithm: SignatureAlgorithm,
    pub digest_algorithm: DigestAlgorithm,
}

/// Narrow XML and signature interface used by the engine.
pub trait XmlSecurity: Send + Sync {
    /// Parse a document, rejecting DTDs and oversized input.
    fn parse_xml(&self, xml: &str) -> Result<Element, XmlError>;

    /// Serialize an element tree back to text.
    fn serialize_xml(&self, element: &Element) -> String;

    /// Verify the enveloped `ds:Signature` that is a direct child of `signed`.
    ///
    /// The signature must reference `signed` by its `ID` attribute and nothing
    /// else.
    fn verify_signature(&self, signed: &Element, trust: &TrustAnchors) -> Result<(), XmlError>;

    /// Sign the root element of `xml` with an enveloped signature placed
    /// directly after its `Issuer`.
    fn sign_xml(&self, xml: &str, options: SignOptions<'_>) -> Result<String, XmlError>;

    /// Verify a detached signature, as used by the HTTP-Redirect binding.
    fn verify_detached(
        &self,
        data: &[u8],
        signature: &[u8],
        algorithm: SignatureAlgorithm,
        trust: &TrustAnchors,
    ) -> Result<(), XmlError>;
}

/// Escape text content for inclusion in a generated document.
pub fn escape_text(value: &str) -> Cow<'_, str> {
    quick_xml::escape::partial_escape(value)
}

/// Escape an attribute value for inclusion in a double-quoted attribute.
pub fn escape_attr(value: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(value)
}
