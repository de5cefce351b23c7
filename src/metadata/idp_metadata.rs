use chrono::{DateTime, Utc};

use super::MetadataError;
use crate::{
    binding::Binding,
    crypto::Certificate,
    xml::{Element, NS_DS, NS_MD, dom},
};

/// What the SP needs from an IdP's published `EntityDescriptor`.
#[derive(Debug, Clone, PartialEq)]
pub struct IdpMetadata {
    pub entity_id: String,
    /// Preferred SingleSignOnService location and its binding.
    pub sso: Option<(String, Binding)>,
    pub slo: Option<(String, Binding)>,
    /// Base64 DER of each signing certificate.
    pub signing_certificates: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Parse IdP metadata.
///
/// Accepts an `EntityDescriptor`, or an `EntitiesDescriptor` aggregate from
/// which the entry for `entity_id` (or, without one, the first IdP) is taken.
/// Endpoints using the Redirect binding are preferred over POST.
pub fn parse_idp_metadata(
    xml: &str,
    entity_id: Option<&str>,
) -> Result<IdpMetadata, MetadataError> {
    let root = dom::parse(xml)?;

    let descriptor = if root.is(NS_MD, "EntityDescriptor") {
        &root
    } else if root.is(NS_MD, "EntitiesDescriptor") {
        let mut entries = Vec::new();
        root.walk(&mut |e| {
            if e.is(NS_MD, "EntityDescriptor") && e.child(NS_MD, "IDPSSODescriptor").is_some() {
                entries.push(e);
            }
        });
        match entity_id {
            Some(wanted) => entries
                .into_iter()
                .find(|e| e.attr("entityID") == Some(wanted))
                .ok_or_else(|| {
                    MetadataError::Invalid(format!("no EntityDescriptor for {wanted}"))
                })?,
            None => entries
                .into_iter()
                .next()
                .ok_or_else(|| MetadataError::Invalid("no IdP in aggregate".into()))?,
        }
    } else {
        return Err(MetadataError::Invalid(
            "root is not an EntityDescriptor".into(),
        ));
    };

    let found_entity_id = descriptor
        .attr("entityID")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| MetadataError::Invalid("missing entityID".into()))?;
    if let Some(wanted) = entity_id
        && wanted != found_entity_id
    {
        return Err(MetadataError::Invalid(format!(
            "metadata describes {found_entity_id}, expected {wanted}"
        )));
    }

    let idp = descriptor
        .child(NS_MD, "IDPSSODescriptor")
        .ok_or_else(|| MetadataError::Invalid("missing IDPSSODescriptor".into()))?;

    let mut signing_certificates = Vec::new();
    for key_descriptor in idp.children_named(NS_MD, "KeyDescriptor") {
        if !matches!(key_descriptor.attr("use"), None | Some("signing")) {
            continue;
        }
        let Some(data) = key_descriptor
            .child(NS_DS, "KeyInfo")
            .and_then(|ki| ki.child(NS_DS, "X509Data"))
        else {
            continue;
        };
        for cert in data.children_named(NS_DS, "X509Certificate") {
            let encoded: String = cert.text().split_whitespace().collect();
            // Reject garbage here rather than at verification time
            let parsed = Certificate::parse(&encoded)
                .map_err(|e| MetadataError::Invalid(format!("signing certificate: {e}")))?;
            let encoded = parsed.to_base64();
            if !signing_certificates.contains(&encoded) {
                signing_certificates.push(encoded);
            }
        }
    }
    if signing_certificates.is_empty() {
        return Err(MetadataError::Invalid("no signing certificate".into()));
    }

    Ok(IdpMetadata {
        entity_id: found_entity_id.to_string(),
        sso: preferred_endpoint(idp, "SingleSignOnService"),
        slo: preferred_endpoint(idp, "SingleLogoutService"),
        signing_certificates,
        fetched_at: Utc::now(),
    })
}

fn preferred_endpoint(descriptor: &Element, name: &str) -> Option<(String, Binding)> {
    let endpoints: Vec<(String, Binding)> = descriptor
        .children_named(NS_MD, name)
        .filter_map(|e| {
            let binding = Binding::from_uri(e.attr("Binding")?)?;
            Some((e.attr("Location")?.to_string(), binding))
        })
        .collect();
    endpoints
        .iter()
        .find(|(_, b)| *b == Binding::Redirect)
        .or_else(|| endpoints.first())
        .cloned()
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::{crypto::Certificate, xml::NS_MD};

    /// A minimal IdP `EntityDescriptor` for `entity_id` signing with `cert_pem`.
    pub fn idp_metadata_xml(entity_id: &str, cert_pem: &str) -> String {
        let cert = Certificate::parse(cert_pem).expect("test certificate");
        format!(
            r#"<md:EntityDescriptor xmlns:md="{NS_MD}" entityID="{entity_id}">
  <md:IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
        <ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data>
      </ds:KeyInfo>
    </md:KeyDescriptor>
    <md:KeyDescriptor use="encryption">
      <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
        <ds:X509Data><ds:X509Certificate>not-a-certificate</ds:X509Certificate></ds:X509Data>
      </ds:KeyInfo>
    </md:KeyDescriptor>
    <md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{entity_id}/slo"/>
    <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{entity_id}/sso/post"/>
    <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="{entity_id}/sso"/>
  </md:IDPSSODescriptor>
</md:EntityDescriptor>"#,
            cert.to_base64()
        )
    }
}
