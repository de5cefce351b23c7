use super::MetadataError;
use crate::{
    binding::Binding,
    resolver::SpEndpoints,
    sp::ServiceProvider,
    xml::{NS_DS, NS_MD, dom, escape_attr, escape_text},
};

/// Generate SP metadata XML for IdP registration.
///
/// Deterministic for a given SP and endpoint set. The document contains:
/// - SP entity ID and the signing flags the SP enforces
/// - Signing certificate (if one is configured)
/// - Single Logout Service with both bindings (if an SLS URL is known)
/// - NameID format
/// - Assertion Consumer Service with HTTP-POST binding
pub fn publish_metadata(sp: &ServiceProvider, endpoints: &SpEndpoints) -> String {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="{NS_MD}" entityID="{}">
  <md:SPSSODescriptor AuthnRequestsSigned="{}" WantAssertionsSigned="{}" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">"#,
        escape_attr(&endpoints.entity_id),
        sp.security.authn_requests_signed,
        sp.security.want_assertions_signed,
    );

    if let Some(cert) = sp.published_certificate() {
        xml.push_str(&format!(
            r#"
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo xmlns:ds="{NS_DS}">
        <ds:X509Data>
          <ds:X509Certificate>{}</ds:X509Certificate>
        </ds:X509Data>
      </ds:KeyInfo>
    </md:KeyDescriptor>"#,
            cert.to_base64()
        ));
    }

    if let Some(sls_url) = &endpoints.sls_url {
        for binding in [Binding::Redirect, Binding::Post] {
            xml.push_str(&format!(
                r#"
    <md:SingleLogoutService Binding="{}" Location="{}"/>"#,
                binding.uri(),
                escape_attr(sls_url)
            ));
        }
    }

    xml.push_str(&format!(
        r#"
    <md:NameIDFormat>{}</md:NameIDFormat>"#,
        escape_text(&sp.name_id_format)
    ));

    xml.push_str(&format!(
        r#"
    <md:AssertionConsumerService Binding="{}" Location="{}" index="0" isDefault="true"/>"#,
        Binding::Post.uri(),
        escape_attr(&endpoints.acs_url)
    ));

    xml.push_str(
        r#"
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#,
    );

    xml
}

/// The parts of an SP descriptor an IdP registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedSp {
    pub entity_id: String,
    pub acs_url: String,
    pub sls_url: Option<String>,
    /// Base64 DER of the signing certificate.
    pub certificate: Option<String>,
    pub authn_requests_signed: bool,
    pub want_assertions_signed: bool,
    pub name_id_formats: Vec<String>,
}

/// Parse an SP `EntityDescriptor`, as produced by [`publish_metadata`].
pub fn parse_sp_metadata(xml: &str) -> Result<PublishedSp, MetadataError> {
    let root = dom::parse(xml)?;
    if !root.is(NS_MD, "EntityDescriptor") {
        return Err(MetadataError::Invalid("root is not an EntityDescriptor".into()));
    }
    let entity_id = root
        .attr("entityID")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| MetadataError::Invalid("missing entityID".into()))?
        .to_string();
    let descriptor = root
        .child(NS_MD, "SPSSODescriptor")
        .ok_or_else(|| MetadataError::Invalid("missing SPSSODescriptor".into()))?;

    let acs_url = descriptor
        .children_named(NS_MD, "AssertionConsumerService")
        .find(|acs| acs.attr("Binding") == Some(Binding::Post.uri()))
        .and_then(|acs| acs.attr("Location"))
        .ok_or_else(|| MetadataError::Invalid("missing HTTP-POST AssertionConsumerService".into()))?
        .to_string();

    let sls_url = descriptor
        .children_named(NS_MD, "SingleLogoutService")
        .find_map(|sls| sls.attr("Location"))
        .map(str::to_string);

    let certificate = descriptor
        .children_named(NS_MD, "KeyDescriptor")
        .filter(|kd| matches!(kd.attr("use"), None | Some("signing")))
        .find_map(|kd| {
            kd.child(NS_DS, "KeyInfo")?
                .child(NS_DS, "X509Data")?
                .child(NS_DS, "X509Certificate")
                .map(|c| c.text().split_whitespace().collect::<String>())
        });

    Ok(PublishedSp {
        entity_id,
        acs_url,
        sls_url,
        certificate,
        authn_requests_signed: descriptor.attr("AuthnRequestsSigned") == Some("true"),
        want_assertions_signed: descriptor.attr("WantAssertionsSigned") == Some("true"),
        name_id_formats: descriptor
            .children_named(NS_MD, "NameIDFormat")
            .map(|f| f.trimmed_text())
            .collect(),
    })
}
