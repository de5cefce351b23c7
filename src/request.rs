//! Outbound protocol messages: AuthnRequest, LogoutRequest, LogoutResponse.
//!
//! The builder only produces the encoded artifact. Recording the request ID
//! for later correlation is up to the caller.

use std::sync::Arc;

use chrono::Utc;

use crate::{
    binding::{self, Binding, MessageField},
    crypto::generate_id,
    error::{SamlError, SamlResult},
    models::message::format_instant,
    resolver::ResolvedContext,
    sp::ServiceProvider,
    xml::{NS_SAML, NS_SAMLP, SignOptions, XmlSecurity, escape_attr, escape_text},
};

/// How an outbound message reaches the IdP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Send the browser to this URL.
    Redirect { url: String },
    /// Auto-submit a form to `action`.
    Post {
        action: String,
        field: MessageField,
        value: String,
        relay_state: Option<String>,
    },
}

impl OutboundMessage {
    pub fn binding(&self) -> Binding {
        match self {
            OutboundMessage::Redirect { .. } => Binding::Redirect,
            OutboundMessage::Post { .. } => Binding::Post,
        }
    }

    /// Self-submitting HTML form for the POST binding. `None` for redirects.
    pub fn to_html_form(&self) -> Option<String> {
        let OutboundMessage::Post {
            action,
            field,
            value,
            relay_state,
        } = self
        else {
            return None;
        };
        let relay_input = relay_state
            .as_deref()
            .map(|rs| {
                format!(
                    r#"<input type="hidden" name="RelayState" value="{}"/>"#,
                    escape_attr(rs)
                )
            })
            .unwrap_or_default();
        Some(format!(
            r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>Continue</title></head>
<body onload="document.forms[0].submit()">
<form method="post" action="{}">
<input type="hidden" name="{}" value="{}"/>{relay_input}
<noscript><button type="submit">Continue</button></noscript>
</form>
</body></html>"#,
            escape_attr(action),
            field.param(),
            escape_attr(value),
        ))
    }
}

/// A built request, ready to send.
#[derive(Debug, Clone)]
pub struct BuiltRequest {
    /// The message `ID`, for correlating the response.
    pub id: String,
    pub destination: String,
    pub relay_state: Option<String>,
    pub message: OutboundMessage,
}

pub struct RequestBuilder {
    sp: Arc<ServiceProvider>,
    xml: Arc<dyn XmlSecurity>,
}

impl RequestBuilder {
    pub fn new(sp: Arc<ServiceProvider>, xml: Arc<dyn XmlSecurity>) -> Self {
        Self { sp, xml }
    }

    /// Build an AuthnRequest for the tenant's SSO endpoint.
    pub fn build_authn_request(
        &self,
        ctx: &ResolvedContext,
        relay_state: Option<&str>,
    ) -> SamlResult<BuiltRequest> {
        let idp = &ctx.idp;
        let security = &self.sp.security;
        let id = generate_id();
        let destination = idp.sso_url.clone();
        let name_id_format = idp
            .name_id_format
            .as_deref()
            .unwrap_or(&self.sp.name_id_format);

        let force_authn = if security.force_authn {
            r#" ForceAuthn="true""#
        } else {
            ""
        };
        let authn_context = security
            .authn_context_class_ref
            .as_deref()
            .map(|class_ref| {
                format!(
                    r#"<samlp:RequestedAuthnContext Comparison="exact"><saml:AuthnContextClassRef>{}</saml:AuthnContextClassRef></samlp:RequestedAuthnContext>"#,
                    escape_text(class_ref)
                )
            })
            .unwrap_or_default();

        let xml = format!(
            concat!(
                r#"<samlp:AuthnRequest xmlns:samlp="{samlp}" xmlns:saml="{saml}" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}" AssertionConsumerServiceURL="{acs}" ProtocolBinding="{post}"{force}>"#,
                r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
                r#"<samlp:NameIDPolicy Format="{format}" AllowCreate="true"/>"#,
                r#"{context}"#,
                r#"</samlp:AuthnRequest>"#,
            ),
            samlp = NS_SAMLP,
            saml = NS_SAML,
            id = id,
            instant = format_instant(Utc::now()),
            destination = escape_attr(&destination),
            acs = escape_attr(&ctx.sp.acs_url),
            post = Binding::Post.uri(),
            force = force_authn,
            issuer = escape_text(&ctx.sp.entity_id),
            format = escape_attr(name_id_format),
            context = authn_context,
        );

        let message = self.encode(
            &destination,
            MessageField::Request,
            xml,
            relay_state,
            idp.sso_binding,
            security.authn_requests_signed,
        )?;

        tracing::debug!(
            idp_key = %ctx.idp_key,
            request_id = %id,
            binding = %idp.sso_binding,
            "Built AuthnRequest"
        );

        Ok(BuiltRequest {
            id,
            destination,
            relay_state: relay_state.map(str::to_string),
            message,
        })
    }

    /// Build a LogoutRequest for the tenant's SLO endpoint.
    pub fn build_logout_request(
        &self,
        ctx: &ResolvedContext,
        name_id: &str,
        name_id_format: Option<&str>,
        session_index: Option<&str>,
        relay_state: Option<&str>,
    ) -> SamlResult<BuiltRequest> {
        let idp = &ctx.idp;
        let destination = idp.slo_url.clone().ok_or_else(|| {
            SamlError::Configuration(format!("tenant '{}' has no SLO URL", ctx.idp_key))
        })?;
        let id = generate_id();
        let now = Utc::now();
        let not_on_or_after =
            now + chrono::Duration::seconds(self.sp.security.request_ttl_secs as i64);

        let format_attr = name_id_format
            .map(|f| format!(r#" Format="{}""#, escape_attr(f)))
            .unwrap_or_default();
        let session_index = session_index
            .map(|si| format!("<samlp:SessionIndex>{}</samlp:SessionIndex>", escape_text(si)))
            .unwrap_or_default();

        let xml = format!(
            concat!(
                r#"<samlp:LogoutRequest xmlns:samlp="{samlp}" xmlns:saml="{saml}" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}" NotOnOrAfter="{expires}">"#,
                r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
                r#"<saml:NameID{format}>{name_id}</saml:NameID>"#,
                r#"{session_index}"#,
                r#"</samlp:LogoutRequest>"#,
            ),
            samlp = NS_SAMLP,
            saml = NS_SAML,
            id = id,
            instant = format_instant(now),
            destination = escape_attr(&destination),
            expires = format_instant(not_on_or_after),
            issuer = escape_text(&ctx.sp.entity_id),
            format = format_attr,
            name_id = escape_text(name_id),
            session_index = session_index,
        );

        let message = self.encode(
            &destination,
            MessageField::Request,
            xml,
            relay_state,
            idp.slo_binding,
            self.sp.security.logout_requests_signed,
        )?;

        tracing::debug!(idp_key = %ctx.idp_key, request_id = %id, "Built LogoutRequest");

        Ok(BuiltRequest {
            id,
            destination,
            relay_state: relay_state.map(str::to_string),
            message,
        })
    }

    /// Answer an IdP-initiated LogoutRequest.
    pub fn build_logout_response(
        &self,
        ctx: &ResolvedContext,
        in_response_to: &str,
        status_code: &str,
        relay_state: Option<&str>,
    ) -> SamlResult<BuiltRequest> {
        let idp = &ctx.idp;
        let destination = idp.slo_url.clone().ok_or_else(|| {
            SamlError::Configuration(format!("tenant '{}' has no SLO URL", ctx.idp_key))
        })?;
        let id = generate_id();

        let xml = format!(
            concat!(
                r#"<samlp:LogoutResponse xmlns:samlp="{samlp}" xmlns:saml="{saml}" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}" InResponseTo="{in_response_to}">"#,
                r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
                r#"<samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>"#,
                r#"</samlp:LogoutResponse>"#,
            ),
            samlp = NS_SAMLP,
            saml = NS_SAML,
            id = id,
            instant = format_instant(Utc::now()),
            destination = escape_attr(&destination),
            in_response_to = escape_attr(in_response_to),
            issuer = escape_text(&ctx.sp.entity_id),
            status = escape_attr(status_code),
        );

        let message = self.encode(
            &destination,
            MessageField::Response,
            xml,
            relay_state,
            idp.slo_binding,
            self.sp.security.logout_responses_signed,
        )?;

        Ok(BuiltRequest {
            id,
            destination,
            relay_state: relay_state.map(str::to_string),
            message,
        })
    }

    fn encode(
        &self,
        destination: &str,
        field: MessageField,
        xml: String,
        relay_state: Option<&str>,
        binding: Binding,
        sign: bool,
    ) -> SamlResult<OutboundMessage> {
        let signer = self.sp.signer(sign);
        match binding {
            Binding::Redirect => Ok(OutboundMessage::Redirect {
                url: binding::redirect_url(destination, field, &xml, relay_state, signer)?,
            }),
            Binding::Post => {
                let xml = match signer {
                    Some((key, signature_algorithm)) => self
                        .xml
                        .sign_xml(
                            &xml,
                            SignOptions {
                                key,
                                signature_algorithm,
                                digest_algorithm: self.sp.security.digest_algorithm,
                            },
                        )
                        .map_err(|e| SamlError::Internal(format!("Failed to sign message: {e}")))?,
                    None => xml,
                };
                Ok(OutboundMessage::Post {
                    action: destination.to_string(),
                    field,
                    value: binding::post_encode(&xml),
                    relay_state: relay_state.map(str::to_string),
                })
            }
        }
    }
}
