//! Enveloped XML-DSig signatures backed by OpenSSL.
//!
//! Verification accepts exactly the profile SAML uses: one `Reference` to the
//! parent element's `ID`, enveloped-signature and canonicalization transforms
//! only. Anything else is rejected as malformed.

use base64::{Engine, engine::general_purpose::STANDARD};

use super::{
    NS_DS, NS_SAML, SignOptions, TrustAnchors, XmlError, XmlSecurity,
    c14n::{self, ENVELOPED_SIGNATURE, EXC_C14N, Method},
    dom::{self, Element},
};
use crate::crypto::{self, Certificate, DigestAlgorithm, SignatureAlgorithm};

/// [`XmlSecurity`] implemented with the in-crate DOM and OpenSSL.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenSslXmlSecurity;

impl OpenSslXmlSecurity {
    pub fn new() -> Self {
        Self
    }
}

impl XmlSecurity for OpenSslXmlSecurity {
    fn parse_xml(&self, xml: &str) -> Result<Element, XmlError> {
        dom::parse(xml)
    }

    fn serialize_xml(&self, element: &Element) -> String {
        element.to_xml()
    }

    fn verify_signature(&self, signed: &Element, trust: &TrustAnchors) -> Result<(), XmlError> {
        let mut signatures = signed.children_named(NS_DS, "Signature");
        let signature = signatures.next().ok_or(XmlError::MissingSignature)?;
        if signatures.next().is_some() {
            return Err(malformed("more than one signature on element"));
        }

        let id = signed
            .attr("ID")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| malformed("signed element has no ID"))?;

        let signed_info = signature
            .child(NS_DS, "SignedInfo")
            .ok_or_else(|| malformed("missing SignedInfo"))?;
        let c14n_method = canonicalization_method(
            signed_info
                .child(NS_DS, "CanonicalizationMethod")
                .ok_or_else(|| malformed("missing CanonicalizationMethod"))?,
        )?;
        let signature_algorithm = SignatureAlgorithm::from_uri(
            signed_info
                .child(NS_DS, "SignatureMethod")
                .and_then(|m| m.attr("Algorithm"))
                .ok_or_else(|| malformed("missing SignatureMethod"))?,
        )?;

        let mut references = signed_info.children_named(NS_DS, "Reference");
        let reference = references
            .next()
            .ok_or_else(|| malformed("missing Reference"))?;
        if references.next().is_some() {
            return Err(malformed("more than one Reference"));
        }
        if reference.attr("URI") != Some(format!("#{id}").as_str()) {
            return Err(malformed("Reference does not point at the signed element"));
        }

        // Reference processing
        let (enveloped, reference_method) = reference_transforms(reference)?;
        let digest_algorithm = DigestAlgorithm::from_uri(
            reference
                .child(NS_DS, "DigestMethod")
                .and_then(|m| m.attr("Algorithm"))
                .ok_or_else(|| malformed("missing DigestMethod"))?,
        )?;
        let expected_digest = decode_base64(
            &reference
                .child(NS_DS, "DigestValue")
                .ok_or_else(|| malformed("missing DigestValue"))?
                .text(),
        )?;
        let exclude = enveloped.then_some(signature);
        let canonical = c14n::canonicalize(signed, &reference_method, exclude);
        let actual_digest = digest_algorithm.digest(canonical.as_bytes())?;
        if actual_digest.len() != expected_digest.len()
            || !openssl::memcmp::eq(&actual_digest, &expected_digest)
        {
            return Err(XmlError::DigestMismatch);
        }

        // SignedInfo processing
        let signature_value = decode_base64(
            &signature
                .child(NS_DS, "SignatureValue")
                .ok_or_else(|| malformed("missing SignatureValue"))?
                .text(),
        )?;
        let canonical_signed_info = c14n::canonicalize(signed_info, &c14n_method, None);

        for certificate in candidate_certificates(signature, trust) {
            if crypto::verify(
                &certificate,
                signature_algorithm,
                canonical_signed_info.as_bytes(),
                &signature_value,
            )? {
                return Ok(());
            }
        }
        Err(XmlError::UntrustedSignature)
    }

    fn sign_xml(&self, xml: &str, options: SignOptions<'_>) -> Result<String, XmlError> {
        let mut root = dom::parse(xml)?;
        let id = root
            .attr("ID")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| malformed("root element has no ID"))?
            .to_string();

        let method = Method::Exclusive {
            with_comments: false,
            inclusive_prefixes: Vec::new(),
        };
        let digest = options
            .digest_algorithm
            .digest(c14n::canonicalize(&root, &method, None).as_bytes())?;

        let signed_info_body = format!(
            concat!(
                r#"<ds:CanonicalizationMethod Algorithm="{c14n}"/>"#,
                r#"<ds:SignatureMethod Algorithm="{sig}"/>"#,
                r##"<ds:Reference URI="#{id}">"##,
                r#"<ds:Transforms>"#,
                r#"<ds:Transform Algorithm="{env}"/>"#,
                r#"<ds:Transform Algorithm="{c14n}"/>"#,
                r#"</ds:Transforms>"#,
                r#"<ds:DigestMethod Algorithm="{dig}"/>"#,
                r#"<ds:DigestValue>{value}</ds:DigestValue>"#,
                r#"</ds:Reference>"#,
            ),
            c14n = EXC_C14N,
            sig = options.signature_algorithm.uri(),
            id = id,
            env = ENVELOPED_SIGNATURE,
            dig = options.digest_algorithm.uri(),
            value = STANDARD.encode(digest),
        );

        // Exclusive c14n of SignedInfo only depends on the ds binding, so the
        // standalone form canonicalizes identically to the embedded one.
        let standalone = dom::parse(&format!(
            r#"<ds:SignedInfo xmlns:ds="{NS_DS}">{signed_info_body}</ds:SignedInfo>"#
        ))?;
        let signature_value = options.key.sign(
            options.signature_algorithm,
            c14n::canonicalize(&standalone, &method, None).as_bytes(),
        )?;

        let key_info = options
            .key
            .certificate()
            .map(|cert| {
                format!(
                    "<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>",
                    cert.to_base64()
                )
            })
            .unwrap_or_default();
        let signature = dom::parse(&format!(
            r#"<ds:Signature xmlns:ds="{NS_DS}"><ds:SignedInfo>{signed_info_body}</ds:SignedInfo><ds:SignatureValue>{}</ds:SignatureValue>{key_info}</ds:Signature>"#,
            STANDARD.encode(signature_value),
        ))?;

        let position = root
            .position_of(NS_SAML, "Issuer")
            .map(|i| i + 1)
            .unwrap_or(0);
        root.insert_child(position, signature);
        Ok(root.to_xml())
    }

    fn verify_detached(
        &self,
        data: &[u8],
        signature: &[u8],
        algorithm: SignatureAlgorithm,
        trust: &TrustAnchors,
    ) -> Result<(), XmlError> {
        if trust.certificates.is_empty() {
            // Redirect-binding signatures carry no KeyInfo to match a
            // fingerprint against.
            return Err(XmlError::UntrustedSignature);
        }
        for certificate in &trust.certificates {
            if crypto::verify(certificate, algorithm, data, signature)? {
                return Ok(());
            }
        }
        Err(XmlError::UntrustedSignature)
    }
}

fn malformed(message: &str) -> XmlError {
    XmlError::MalformedSignature(message.to_string())
}

fn decode_base64(text: &str) -> Result<Vec<u8>, XmlError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| XmlError::MalformedSignature(format!("invalid base64: {e}")))
}

fn inclusive_prefixes(method_element: &Element) -> Vec<String> {
    method_element
        .elements()
        .find(|e| e.name == "InclusiveNamespaces")
        .and_then(|e| e.attr("PrefixList"))
        .map(c14n::parse_prefix_list)
        .unwrap_or_default()
}

fn canonicalization_method(element: &Element) -> Result<Method, XmlError> {
    let uri = element
        .attr("Algorithm")
        .ok_or_else(|| malformed("CanonicalizationMethod has no Algorithm"))?;
    Method::from_uri(uri, inclusive_prefixes(element))
        .ok_or_else(|| XmlError::MalformedSignature(format!("unsupported canonicalization {uri}")))
}

/// Returns whether the enveloped transform is present and the
/// canonicalization to apply to the referenced element.
fn reference_transforms(reference: &Element) -> Result<(bool, Method), XmlError> {
    let mut enveloped = false;
    // Canonical XML 1.0 applies when a same-document reference names no
    // canonicalization transform.
    let mut method = Method::Inclusive {
        with_comments: false,
    };

    if let Some(transforms) = reference.child(NS_DS, "Transforms") {
        for transform in transforms.children_named(NS_DS, "Transform") {
            let uri = transform
                .attr("Algorithm")
                .ok_or_else(|| malformed("Transform has no Algorithm"))?;
            if uri == ENVELOPED_SIGNATURE {
                enveloped = true;
            } else if let Some(m) = Method::from_uri(uri, inclusive_prefixes(transform)) {
                method = m;
            } else {
                return Err(XmlError::MalformedSignature(format!(
                    "unsupported transform {uri}"
                )));
            }
        }
    }
    Ok((enveloped, method))
}

fn candidate_certificates(signature: &Element, trust: &TrustAnchors) -> Vec<Certificate> {
    let mut candidates = trust.certificates.clone();
    if trust.fingerprints.is_empty() {
        return candidates;
    }

    let mut embedded = Vec::new();
    if let Some(key_info) = signature.child(NS_DS, "KeyInfo") {
        for data in key_info.children_named(NS_DS, "X509Data") {
            for cert in data.children_named(NS_DS, "X509Certificate") {
                match Certificate::parse(&cert.text()) {
                    Ok(parsed) => embedded.push(parsed),
                    Err(e) => tracing::debug!(error = %e, "Ignoring unparseable KeyInfo certificate"),
                }
            }
        }
    }

    for cert in embedded {
        let trusted = trust
            .fingerprints
            .iter()
            .any(|fp| cert.matches_fingerprint(fp, trust.fingerprint_algorithm));
        if trusted && !candidates.contains(&cert) {
            candidates.push(cert);
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{
        FingerprintAlgorithm, SigningKey,
        test_support::{generate_ec_certificate, generate_rsa_certificate},
    };

    const DOCUMENT: &str = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_abc" Version="2.0">
  <saml:Issuer>https://idp.example.com</saml:Issuer>
  <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>
</samlp:Response>"#;

    fn keypair(ec: bool) -> (Certificate, SigningKey) {
        let (cert_pem, key_pem) = if ec {
            generate_ec_certificate("idp.example.com")
        } else {
            generate_rsa_certificate("idp.example.com")
        };
        let cert = Certificate::parse(&cert_pem).unwrap();
        let key = SigningKey::from_pem(&key_pem, Some(cert.clone())).unwrap();
        (cert, key)
    }

    fn sign(key: &SigningKey) -> String {
        OpenSslXmlSecurity
            .sign_xml(
                DOCUMENT,
                SignOptions {
                    key,
                    signature_algorithm: key.default_algorithm(),
                    digest_algorithm: DigestAlgorithm::Sha256,
                },
            )
            .unwrap()
    }

    fn trust(cert: &Certificate) -> TrustAnchors {
        TrustAnchors {
            certificates: vec![cert.clone()],
            ..Default::default()
        }
    }

    #[test]
    fn test_sign_then_verify() {
        for ec in [false, true] {
            let (cert, key) = keypair(ec);
            let signed = sign(&key);
            let root = OpenSslXmlSecurity.parse_xml(&signed).unwrap();

            // Signature lands directly after Issuer.
            let names: Vec<_> = root.elements().map(|e| e.name.as_str()).collect();
            assert_eq!(names, ["Issuer", "Signature", "Status"]);

            OpenSslXmlSecurity.verify_signature(&root, &trust(&cert)).unwrap();
        }
    }

    #[test]
    fn test_tampered_content_fails_digest() {
        let (cert, key) = keypair(false);
        let signed = sign(&key).replace("idp.example.com</", "evil.example.com</");
        let root = OpenSslXmlSecurity.parse_xml(&signed).unwrap();
        assert!(matches!(
            OpenSslXmlSecurity.verify_signature(&root, &trust(&cert)),
            Err(XmlError::DigestMismatch)
        ));
    }

    #[test]
    fn test_wrong_certificate_is_untrusted() {
        let (_, key) = keypair(false);
        let (other_cert, _) = keypair(false);
        let root = OpenSslXmlSecurity.parse_xml(&sign(&key)).unwrap();
        assert!(matches!(
            OpenSslXmlSecurity.verify_signature(&root, &trust(&other_cert)),
            Err(XmlError::UntrustedSignature)
        ));
    }

    #[test]
    fn test_fingerprint_trusts_embedded_certificate() {
        let (cert, key) = keypair(false);
        let root = OpenSslXmlSecurity.parse_xml(&sign(&key)).unwrap();

        let by_fingerprint = TrustAnchors {
            certificates: Vec::new(),
            fingerprints: vec![cert.fingerprint(FingerprintAlgorithm::Sha256).unwrap()],
            fingerprint_algorithm: FingerprintAlgorithm::Sha256,
        };
        OpenSslXmlSecurity.verify_signature(&root, &by_fingerprint).unwrap();

        let wrong_fingerprint = TrustAnchors {
            fingerprints: vec!["00".repeat(32)],
            ..by_fingerprint
        };
        assert!(matches!(
            OpenSslXmlSecurity.verify_signature(&root, &wrong_fingerprint),
            Err(XmlError::UntrustedSignature)
        ));
    }

    #[test]
    fn test_missing_signature() {
        let (cert, _) = keypair(false);
        let root = OpenSslXmlSecurity.parse_xml(DOCUMENT).unwrap();
        assert!(matches!(
            OpenSslXmlSecurity.verify_signature(&root, &trust(&cert)),
            Err(XmlError::MissingSignature)
        ));
    }

    #[test]
    fn test_reference_must_target_signed_element() {
        let (cert, key) = keypair(false);
        let signed = sign(&key).replace("URI=\"#_abc\"", "URI=\"#_other\"");
        let root = OpenSslXmlSecurity.parse_xml(&signed).unwrap();
        assert!(matches!(
            OpenSslXmlSecurity.verify_signature(&root, &trust(&cert)),
            Err(XmlError::MalformedSignature(_))
        ));
    }

    #[test]
    fn test_detached_signatures() {
        let (cert, key) = keypair(false);
        let data = b"SAMLRequest=abc&SigAlg=x";
        let sig = key.sign(SignatureAlgorithm::RsaSha256, data).unwrap();
        OpenSslXmlSecurity
            .verify_detached(data, &sig, SignatureAlgorithm::RsaSha256, &trust(&cert))
            .unwrap();
        assert!(
            OpenSslXmlSecurity
                .verify_detached(b"other", &sig, SignatureAlgorithm::RsaSha256, &trust(&cert))
                .is_err()
        );
    }

    // Signed outside this crate (openssl over hand-canonicalized bytes). The
    // xsi:type QName only verifies if the PrefixList renders xmlns:xs.
    const PREFIXLIST_VECTOR: &str = include_str!("testdata/exc_c14n_prefixlist.xml");
    const PREFIXLIST_VECTOR_CERT: &str = include_str!("testdata/exc_c14n_prefixlist.crt");

    #[test]
    fn test_verifies_external_exclusive_c14n_vector() {
        let cert = Certificate::parse(PREFIXLIST_VECTOR_CERT).unwrap();
        let root = OpenSslXmlSecurity.parse_xml(PREFIXLIST_VECTOR).unwrap();
        OpenSslXmlSecurity
            .verify_signature(&root, &trust(&cert))
            .unwrap();
    }

    #[test]
    fn test_external_vector_detects_qname_tampering() {
        let cert = Certificate::parse(PREFIXLIST_VECTOR_CERT).unwrap();
        let tampered = PREFIXLIST_VECTOR.replace("xs:string", "xs:int");
        let root = OpenSslXmlSecurity.parse_xml(&tampered).unwrap();
        assert!(matches!(
            OpenSslXmlSecurity.verify_signature(&root, &trust(&cert)),
            Err(XmlError::DigestMismatch)
        ));
    }
}
