//! A scripted identity provider.
//!
//! Produces real, signed SAML messages so the engine can be exercised end to
//! end without an external IdP. Every field of a response can be tampered
//! with before rendering.

use chrono::{DateTime, Duration, Utc};

use crate::{
    binding::{InboundMessage, MessageField, post_encode, redirect_url},
    crypto::{Certificate, DigestAlgorithm, SignatureAlgorithm, SigningKey, generate_id},
    crypto::test_support::generate_rsa_certificate,
    models::{
        IdpConfig,
        message::{CM_BEARER, NAMEID_EMAIL, STATUS_SUCCESS, format_instant},
        test_support::idp_config,
    },
    resolver::SpEndpoints,
    xml::{NS_SAML, NS_SAMLP, OpenSslXmlSecurity, SignOptions, XmlSecurity, escape_attr, escape_text},
};

pub struct IdpSimulator {
    pub key: String,
    pub entity_id: String,
    pub certificate_pem: String,
    signing_key: SigningKey,
    xml: OpenSslXmlSecurity,
}

/// Everything that goes into one rendered Response.
#[derive(Debug, Clone)]
pub struct ResponseSpec {
    pub response_id: String,
    pub in_response_to: Option<String>,
    pub destination: Option<String>,
    pub issuer: String,
    pub status_code: String,
    pub issue_instant: DateTime<Utc>,
    pub assertion_id: String,
    pub assertion_issuer: String,
    pub name_id: String,
    pub audience: Option<String>,
    pub recipient: Option<String>,
    pub not_before: DateTime<Utc>,
    pub not_on_or_after: DateTime<Utc>,
    pub session_index: Option<String>,
    pub session_not_on_or_after: Option<DateTime<Utc>>,
    pub attributes: Vec<(String, Vec<String>)>,
    pub sign_assertion: bool,
    pub sign_response: bool,
}

impl IdpSimulator {
    pub fn new(key: &str) -> Self {
        let (certificate_pem, key_pem) = generate_rsa_certificate(&format!("idp.{key}.com"));
        Self::with_key_pair(key, certificate_pem, &key_pem)
    }

    /// An IdP that publishes `certificate_pem` in its configuration but signs
    /// with some other key.
    pub fn impostor(key: &str) -> Self {
        let genuine = Self::new(key);
        let (_, key_pem) = generate_rsa_certificate(&format!("idp.{key}.com"));
        Self::with_key_pair(key, genuine.certificate_pem, &key_pem)
    }

    fn with_key_pair(key: &str, certificate_pem: String, key_pem: &str) -> Self {
        let certificate = Certificate::parse(&certificate_pem).unwrap();
        Self {
            key: key.to_string(),
            entity_id: format!("https://idp.{key}.com/saml"),
            signing_key: SigningKey::from_pem(key_pem, Some(certificate)).unwrap(),
            certificate_pem,
            xml: OpenSslXmlSecurity::new(),
        }
    }

    pub fn idp_config(&self) -> IdpConfig {
        idp_config(&self.key, &self.certificate_pem)
    }

    fn sign(&self, xml: &str) -> String {
        self.xml
            .sign_xml(
                xml,
                SignOptions {
                    key: &self.signing_key,
                    signature_algorithm: SignatureAlgorithm::RsaSha256,
                    digest_algorithm: DigestAlgorithm::Sha256,
                },
            )
            .unwrap()
    }

    /// A valid response to `in_response_to`, as of `now`.
    pub fn response(
        &self,
        sp: &SpEndpoints,
        in_response_to: Option<&str>,
        now: DateTime<Utc>,
    ) -> ResponseSpec {
        ResponseSpec {
            response_id: generate_id(),
            in_response_to: in_response_to.map(str::to_string),
            destination: Some(sp.acs_url.clone()),
            issuer: self.entity_id.clone(),
            status_code: STATUS_SUCCESS.to_string(),
            issue_instant: now,
            assertion_id: generate_id(),
            assertion_issuer: self.entity_id.clone(),
            name_id: "alice@acme.com".to_string(),
            audience: Some(sp.entity_id.clone()),
            recipient: Some(sp.acs_url.clone()),
            not_before: now - Duration::minutes(1),
            not_on_or_after: now + Duration::minutes(5),
            session_index: Some(generate_id()),
            session_not_on_or_after: None,
            attributes: vec![
                ("email".to_string(), vec!["alice@acme.com".to_string()]),
                (
                    "groups".to_string(),
                    vec!["admins".to_string(), "staff".to_string()],
                ),
            ],
            sign_assertion: true,
            sign_response: false,
        }
    }

    pub fn render(&self, spec: &ResponseSpec) -> String {
        let status = format!(
            r#"<samlp:Status><samlp:StatusCode Value="{}"/></samlp:Status>"#,
            escape_attr(&spec.status_code)
        );
        let assertion = if spec.status_code == STATUS_SUCCESS {
            self.render_assertion(spec)
        } else {
            String::new()
        };

        let xml = format!(
            r#"<samlp:Response xmlns:samlp="{NS_SAMLP}" xmlns:saml="{NS_SAML}" ID="{id}" Version="2.0" IssueInstant="{instant}"{irt}{destination}><saml:Issuer>{issuer}</saml:Issuer>{status}{assertion}</samlp:Response>"#,
            id = spec.response_id,
            instant = format_instant(spec.issue_instant),
            irt = optional_attr("InResponseTo", spec.in_response_to.as_deref()),
            destination = optional_attr("Destination", spec.destination.as_deref()),
            issuer = escape_text(&spec.issuer),
        );
        if spec.sign_response {
            self.sign(&xml)
        } else {
            xml
        }
    }

    fn render_assertion(&self, spec: &ResponseSpec) -> String {
        let audience = spec
            .audience
            .as_deref()
            .map(|a| {
                format!(
                    "<saml:AudienceRestriction><saml:Audience>{}</saml:Audience></saml:AudienceRestriction>",
                    escape_text(a)
                )
            })
            .unwrap_or_default();

        let attributes: String = spec
            .attributes
            .iter()
            .map(|(name, values)| {
                let values: String = values
                    .iter()
                    .map(|v| format!("<saml:AttributeValue>{}</saml:AttributeValue>", escape_text(v)))
                    .collect();
                format!(r#"<saml:Attribute Name="{}">{values}</saml:Attribute>"#, escape_attr(name))
            })
            .collect();
        let attribute_statement = if attributes.is_empty() {
            String::new()
        } else {
            format!("<saml:AttributeStatement>{attributes}</saml:AttributeStatement>")
        };

        let xml = format!(
            r#"<saml:Assertion xmlns:saml="{NS_SAML}" ID="{id}" Version="2.0" IssueInstant="{instant}"><saml:Issuer>{issuer}</saml:Issuer><saml:Subject><saml:NameID Format="{NAMEID_EMAIL}">{name_id}</saml:NameID><saml:SubjectConfirmation Method="{CM_BEARER}"><saml:SubjectConfirmationData NotOnOrAfter="{not_on_or_after}"{recipient}{irt}/></saml:SubjectConfirmation></saml:Subject><saml:Conditions NotBefore="{not_before}" NotOnOrAfter="{not_on_or_after}">{audience}</saml:Conditions><saml:AuthnStatement AuthnInstant="{instant}"{session_index}{session_limit}/>{attribute_statement}</saml:Assertion>"#,
            id = spec.assertion_id,
            instant = format_instant(spec.issue_instant),
            issuer = escape_text(&spec.assertion_issuer),
            name_id = escape_text(&spec.name_id),
            not_before = format_instant(spec.not_before),
            not_on_or_after = format_instant(spec.not_on_or_after),
            recipient = optional_attr("Recipient", spec.recipient.as_deref()),
            irt = optional_attr("InResponseTo", spec.in_response_to.as_deref()),
            session_index = optional_attr("SessionIndex", spec.session_index.as_deref()),
            session_limit = optional_attr(
                "SessionNotOnOrAfter",
                spec.session_not_on_or_after.map(format_instant).as_deref()
            ),
        );
        if spec.sign_assertion {
            self.sign(&xml)
        } else {
            xml
        }
    }

    /// A response delivered over the POST binding.
    pub fn post(&self, spec: &ResponseSpec, relay_state: Option<&str>) -> InboundMessage {
        InboundMessage::post(
            MessageField::Response,
            post_encode(&self.render(spec)),
            relay_state.map(str::to_string),
        )
    }

    /// A LogoutRequest for `name_id`, sent over the Redirect binding.
    pub fn logout_request(
        &self,
        sp: &SpEndpoints,
        name_id: &str,
        session_index: Option<&str>,
        now: DateTime<Utc>,
        signed: bool,
    ) -> (String, InboundMessage) {
        let id = generate_id();
        let session_index = session_index
            .map(|s| format!("<samlp:SessionIndex>{}</samlp:SessionIndex>", escape_text(s)))
            .unwrap_or_default();
        let xml = format!(
            r#"<samlp:LogoutRequest xmlns:samlp="{NS_SAMLP}" xmlns:saml="{NS_SAML}" ID="{id}" Version="2.0" IssueInstant="{instant}" NotOnOrAfter="{limit}"{destination}><saml:Issuer>{issuer}</saml:Issuer><saml:NameID Format="{NAMEID_EMAIL}">{name_id}</saml:NameID>{session_index}</samlp:LogoutRequest>"#,
            instant = format_instant(now),
            limit = format_instant(now + Duration::minutes(5)),
            destination = optional_attr("Destination", sp.sls_url.as_deref()),
            issuer = escape_text(&self.entity_id),
            name_id = escape_text(name_id),
        );
        let message = self.redirect(sp, MessageField::Request, &xml, signed);
        (id, message)
    }

    /// A LogoutResponse to one of the SP's LogoutRequests.
    pub fn logout_response(
        &self,
        sp: &SpEndpoints,
        in_response_to: &str,
        status_code: &str,
        now: DateTime<Utc>,
        signed: bool,
    ) -> InboundMessage {
        let xml = format!(
            r#"<samlp:LogoutResponse xmlns:samlp="{NS_SAMLP}" xmlns:saml="{NS_SAML}" ID="{id}" Version="2.0" IssueInstant="{instant}" InResponseTo="{irt}"{destination}><saml:Issuer>{issuer}</saml:Issuer><samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status></samlp:LogoutResponse>"#,
            id = generate_id(),
            instant = format_instant(now),
            irt = escape_attr(in_response_to),
            destination = optional_attr("Destination", sp.sls_url.as_deref()),
            issuer = escape_text(&self.entity_id),
            status = escape_attr(status_code),
        );
        self.redirect(sp, MessageField::Response, &xml, signed)
    }

    fn redirect(&self, sp: &SpEndpoints, field: MessageField, xml: &str, signed: bool) -> InboundMessage {
        let destination = sp.sls_url.as_deref().unwrap_or(&sp.acs_url);
        let signer = signed.then_some((&self.signing_key, SignatureAlgorithm::RsaSha256));
        let url = redirect_url(destination, field, xml, None, signer).unwrap();
        let (_, query) = url.split_once('?').unwrap();
        InboundMessage::from_query(query).unwrap()
    }
}

fn optional_attr(name: &str, value: Option<&str>) -> String {
    value
        .map(|v| format!(r#" {name}="{}""#, escape_attr(v)))
        .unwrap_or_default()
}
