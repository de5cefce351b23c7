//! Inbound message validation.
//!
//! A SAML Response is accepted only when every step passes, in order:
//! decode, schema, signature, status, issuer, temporal, audience and
//! correlation. The identity is projected before the correlation record is
//! consumed, so a response that fails extraction cannot burn its request ID.
//! Each rejection is logged with the tenant key and the failing step.

mod parse;

use std::{collections::BTreeMap, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, Utc};

pub use parse::{parse_logout_request, parse_logout_response, parse_response};

use crate::{
    binding::{InboundMessage, MessageField},
    correlation::{CorrelationStore, PendingRequest, RequestKind},
    crypto::SignatureAlgorithm,
    error::{SamlError, SamlResult},
    models::{
        AuthenticatedIdentity,
        message::{Assertion, LogoutRequest, SamlResponse, Status},
    },
    resolver::ResolvedContext,
    sp::ServiceProvider,
    xml::{Element, NS_DS, NS_SAML, TrustAnchors, XmlError, XmlSecurity},
};

/// A fully validated SSO response.
#[derive(Debug, Clone)]
pub struct ValidatedResponse {
    pub identity: AuthenticatedIdentity,
    pub response_id: String,
    /// The AuthnRequest this answered; `None` for an accepted unsolicited
    /// response.
    pub request: Option<PendingRequest>,
    pub relay_state: Option<String>,
}

/// A validated answer to one of our LogoutRequests.
#[derive(Debug, Clone)]
pub struct ValidatedLogoutResponse {
    pub request: PendingRequest,
    pub status: Status,
    pub relay_state: Option<String>,
}

/// A validated IdP-initiated LogoutRequest.
#[derive(Debug, Clone)]
pub struct ValidatedLogoutRequest {
    pub request: LogoutRequest,
    pub relay_state: Option<String>,
}

pub struct ResponseValidator {
    sp: Arc<ServiceProvider>,
    xml: Arc<dyn XmlSecurity>,
    correlation: Arc<dyn CorrelationStore>,
}

impl ResponseValidator {
    pub fn new(
        sp: Arc<ServiceProvider>,
        xml: Arc<dyn XmlSecurity>,
        correlation: Arc<dyn CorrelationStore>,
    ) -> Self {
        Self {
            sp,
            xml,
            correlation,
        }
    }

    fn skew(&self) -> Duration {
        Duration::seconds(self.sp.security.clock_skew_secs as i64)
    }

    /// Validate a `SAMLResponse` received at the ACS endpoint.
    pub async fn validate_response(
        &self,
        ctx: &ResolvedContext,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> SamlResult<ValidatedResponse> {
        let result = self.check_response(ctx, message, now).await;
        match &result {
            Ok(validated) => tracing::info!(
                idp_key = %ctx.idp_key,
                response_id = %validated.response_id,
                solicited = validated.request.is_some(),
                "SAML response accepted"
            ),
            Err(e) => log_rejection(ctx, "Response", e),
        }
        result
    }

    async fn check_response(
        &self,
        ctx: &ResolvedContext,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> SamlResult<ValidatedResponse> {
        let security = &self.sp.security;

        // Decode
        let root = self.decode(message, MessageField::Response)?;

        // Schema
        parse::check_unique_ids(&root)?;
        let mut response = parse_response(&root)?;

        // Signature, before anything in the message is trusted
        let trust = ctx.trust_anchors()?;
        response.signed = self.verify_message(&root, message, &trust)?;
        for (element, assertion) in root
            .children_named(NS_SAML, "Assertion")
            .zip(response.assertions.iter_mut())
        {
            if element.child(NS_DS, "Signature").is_some() {
                self.xml
                    .verify_signature(element, &trust)
                    .map_err(signature_error)?;
                assertion.signed = true;
            }
        }
        if security.want_messages_signed && !response.signed {
            return Err(SamlError::Signature("response is not signed".into()));
        }

        // Status
        if !response.status.is_success() {
            return Err(SamlError::Status {
                code: response.status.code.clone(),
                sub_code: response.status.sub_code.clone(),
                message: response.status.message.clone(),
            });
        }
        if response.assertions.is_empty() {
            return Err(SamlError::Schema("successful response has no assertion".into()));
        }
        for assertion in &response.assertions {
            if security.want_assertions_signed && !assertion.signed {
                return Err(SamlError::Signature(format!(
                    "assertion {} is not signed",
                    assertion.id
                )));
            }
            if !assertion.signed && !response.signed {
                return Err(SamlError::Signature(format!(
                    "assertion {} is not covered by any signature",
                    assertion.id
                )));
            }
        }
        if security.strict {
            for assertion in &response.assertions {
                require_bearer_confirmation(assertion)?;
            }
        }

        // Issuer
        let expected_issuer = &ctx.idp.entity_id;
        if let Some(issuer) = &response.issuer
            && issuer != expected_issuer
        {
            return Err(SamlError::Issuer(format!("response issued by {issuer}")));
        }
        if let Some(assertion) = response
            .assertions
            .iter()
            .find(|a| &a.issuer != expected_issuer)
        {
            return Err(SamlError::Issuer(format!(
                "assertion issued by {}",
                assertion.issuer
            )));
        }

        // Temporal
        self.check_issue_instant(response.issue_instant, now)?;
        for assertion in &response.assertions {
            self.check_assertion_window(assertion, now)?;
        }

        // Audience, recipient and destination
        self.check_destination(response.destination.as_deref(), Some(ctx.sp.acs_url.as_str()))?;
        for assertion in &response.assertions {
            self.check_audience(ctx, assertion)?;
        }

        // Extraction happens before the correlation record is spent
        let identity = extract_identity(ctx, &response)?;

        // Correlation. Replayed assertions are turned away before the pending
        // request is touched.
        let expected = expected_in_response_to(&response)?;
        for assertion in &response.assertions {
            if self
                .correlation
                .is_seen(&assertion.id, &ctx.idp_key, now)
                .await?
            {
                return Err(SamlError::Correlation(format!(
                    "assertion {} was already used",
                    assertion.id
                )));
            }
        }
        let request = match expected {
            Some(id) => Some(
                self.correlation
                    .consume(&id, &ctx.idp_key, RequestKind::Authn, now)
                    .await?,
            ),
            None if security.allow_unsolicited => None,
            None => {
                return Err(SamlError::Correlation(
                    "unsolicited responses are not accepted".into(),
                ));
            }
        };
        let replay_window = now + Duration::seconds(security.request_ttl_secs as i64);
        for assertion in &response.assertions {
            let until = assertion_expiry(assertion).unwrap_or(replay_window);
            if !self
                .correlation
                .mark_seen(&assertion.id, &ctx.idp_key, until, now)
                .await?
            {
                return Err(SamlError::Correlation(format!(
                    "assertion {} was already used",
                    assertion.id
                )));
            }
        }

        let relay_state = request
            .as_ref()
            .and_then(|r| r.relay_state.clone())
            .or_else(|| message.relay_state().map(str::to_string));

        Ok(ValidatedResponse {
            identity,
            response_id: response.id,
            request,
            relay_state,
        })
    }

    /// Validate a LogoutResponse answering one of our LogoutRequests.
    pub async fn validate_logout_response(
        &self,
        ctx: &ResolvedContext,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> SamlResult<ValidatedLogoutResponse> {
        let result = self.check_logout_response(ctx, message, now).await;
        if let Err(e) = &result {
            log_rejection(ctx, "LogoutResponse", e);
        }
        result
    }

    async fn check_logout_response(
        &self,
        ctx: &ResolvedContext,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> SamlResult<ValidatedLogoutResponse> {
        let root = self.decode(message, MessageField::Response)?;
        parse::check_unique_ids(&root)?;
        let response = parse_logout_response(&root)?;

        self.check_logout_signature(ctx, &root, message)?;
        if response.issuer != ctx.idp.entity_id {
            return Err(SamlError::Issuer(format!(
                "logout response issued by {}",
                response.issuer
            )));
        }
        self.check_issue_instant(response.issue_instant, now)?;
        self.check_destination(response.destination.as_deref(), ctx.sp.sls_url.as_deref())?;

        let in_response_to = response.in_response_to.as_deref().ok_or_else(|| {
            SamlError::Correlation("logout response has no InResponseTo".into())
        })?;
        let request = self
            .correlation
            .consume(in_response_to, &ctx.idp_key, RequestKind::Logout, now)
            .await?;

        // The request is spent either way; a failed logout is not retried.
        if !response.status.is_success() {
            return Err(SamlError::Status {
                code: response.status.code,
                sub_code: response.status.sub_code,
                message: response.status.message,
            });
        }

        let relay_state = request
            .relay_state
            .clone()
            .or_else(|| message.relay_state().map(str::to_string));
        Ok(ValidatedLogoutResponse {
            request,
            status: response.status,
            relay_state,
        })
    }

    /// Validate an IdP-initiated LogoutRequest.
    pub async fn validate_logout_request(
        &self,
        ctx: &ResolvedContext,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> SamlResult<ValidatedLogoutRequest> {
        let result = self.check_logout_request(ctx, message, now).await;
        if let Err(e) = &result {
            log_rejection(ctx, "LogoutRequest", e);
        }
        result
    }

    async fn check_logout_request(
        &self,
        ctx: &ResolvedContext,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> SamlResult<ValidatedLogoutRequest> {
        let root = self.decode(message, MessageField::Request)?;
        parse::check_unique_ids(&root)?;
        let request = parse_logout_request(&root)?;

        self.check_logout_signature(ctx, &root, message)?;
        if request.issuer != ctx.idp.entity_id {
            return Err(SamlError::Issuer(format!(
                "logout request issued by {}",
                request.issuer
            )));
        }
        self.check_issue_instant(request.issue_instant, now)?;
        if let Some(not_on_or_after) = request.not_on_or_after
            && now >= not_on_or_after
        {
            return Err(SamlError::Expired("logout request has expired".into()));
        }
        self.check_destination(request.destination.as_deref(), ctx.sp.sls_url.as_deref())?;

        let until = request.not_on_or_after.unwrap_or_else(|| {
            request.issue_instant + Duration::seconds(self.sp.security.request_ttl_secs as i64)
        });
        if !self
            .correlation
            .mark_seen(&request.id, &ctx.idp_key, until.max(now), now)
            .await?
        {
            return Err(SamlError::Correlation(format!(
                "logout request {} was already processed",
                request.id
            )));
        }

        Ok(ValidatedLogoutRequest {
            request,
            relay_state: message.relay_state().map(str::to_string),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Steps
    // ─────────────────────────────────────────────────────────────────────────

    fn decode(&self, message: &InboundMessage, expected: MessageField) -> SamlResult<Element> {
        if message.field() != expected {
            return Err(SamlError::Decode(format!(
                "expected {} parameter",
                expected.param()
            )));
        }
        let xml = message.xml()?;
        self.xml.parse_xml(&xml).map_err(|e| match e {
            XmlError::Forbidden(what) => SamlError::Schema(format!("forbidden construct: {what}")),
            other => SamlError::Decode(other.to_string()),
        })
    }

    /// Verify the message-level signature, enveloped or (Redirect binding)
    /// detached. Returns whether one was present. A present signature that
    /// fails is always an error.
    fn verify_message(
        &self,
        root: &Element,
        message: &InboundMessage,
        trust: &TrustAnchors,
    ) -> SamlResult<bool> {
        let mut signed = false;
        if root.child(NS_DS, "Signature").is_some() {
            self.xml
                .verify_signature(root, trust)
                .map_err(signature_error)?;
            signed = true;
        }
        if let InboundMessage::Redirect(redirect) = message
            && let Some(signature) = &redirect.signature
        {
            let algorithm = redirect
                .sig_alg
                .as_deref()
                .ok_or_else(|| SamlError::Signature("Signature without SigAlg".into()))
                .and_then(|uri| {
                    SignatureAlgorithm::from_uri(uri)
                        .map_err(|e| SamlError::Signature(e.to_string()))
                })?;
            let signature = STANDARD
                .decode(signature.trim())
                .map_err(|_| SamlError::Signature("Signature is not base64".into()))?;
            self.xml
                .verify_detached(redirect.signed_octets(), &signature, algorithm, trust)
                .map_err(signature_error)?;
            signed = true;
        }
        Ok(signed)
    }

    fn check_logout_signature(
        &self,
        ctx: &ResolvedContext,
        root: &Element,
        message: &InboundMessage,
    ) -> SamlResult<()> {
        let trust = ctx.trust_anchors()?;
        let signed = self.verify_message(root, message, &trust)?;
        if self.sp.security.want_messages_signed && !signed {
            return Err(SamlError::Signature("logout message is not signed".into()));
        }
        Ok(())
    }

    fn check_issue_instant(&self, issue_instant: DateTime<Utc>, now: DateTime<Utc>) -> SamlResult<()> {
        if issue_instant - self.skew() > now {
            return Err(SamlError::Expired("message issued in the future".into()));
        }
        Ok(())
    }

    /// `NotBefore` gets the clock-skew allowance; `NotOnOrAfter` does not.
    fn check_assertion_window(&self, assertion: &Assertion, now: DateTime<Utc>) -> SamlResult<()> {
        let skew = self.skew();
        let windows = assertion
            .conditions
            .iter()
            .map(|c| ("conditions", c.not_before, c.not_on_or_after))
            .chain(
                assertion
                    .bearer_confirmations()
                    .filter_map(|c| c.data.as_ref())
                    .map(|d| ("subject confirmation", d.not_before, d.not_on_or_after)),
            );

        for (what, not_before, not_on_or_after) in windows {
            if let Some(not_before) = not_before
                && now < not_before - skew
            {
                return Err(SamlError::Expired(format!(
                    "assertion {} {what} not yet valid",
                    assertion.id
                )));
            }
            if let Some(not_on_or_after) = not_on_or_after
                && now >= not_on_or_after
            {
                return Err(SamlError::Expired(format!(
                    "assertion {} {what} expired",
                    assertion.id
                )));
            }
        }
        Ok(())
    }

    fn check_destination(&self, destination: Option<&str>, expected: Option<&str>) -> SamlResult<()> {
        match (destination, expected) {
            (Some(destination), Some(expected)) if destination != expected => Err(
                SamlError::Audience(format!("Destination {destination} is not this endpoint")),
            ),
            _ => Ok(()),
        }
    }

    fn check_audience(&self, ctx: &ResolvedContext, assertion: &Assertion) -> SamlResult<()> {
        let strict = self.sp.security.strict;
        let restrictions = assertion
            .conditions
            .as_ref()
            .map(|c| c.audience_restrictions.as_slice())
            .unwrap_or_default();

        if restrictions.is_empty() && strict {
            return Err(SamlError::Audience(format!(
                "assertion {} has no AudienceRestriction",
                assertion.id
            )));
        }
        for restriction in restrictions {
            if !restriction.iter().any(|a| a == &ctx.sp.entity_id) {
                return Err(SamlError::Audience(format!(
                    "assertion {} is not addressed to {}",
                    assertion.id, ctx.sp.entity_id
                )));
            }
        }

        for data in assertion
            .bearer_confirmations()
            .filter_map(|c| c.data.as_ref())
        {
            match data.recipient.as_deref() {
                Some(recipient) if recipient != ctx.sp.acs_url => {
                    return Err(SamlError::Audience(format!(
                        "Recipient {recipient} is not this ACS"
                    )));
                }
                None if strict => {
                    return Err(SamlError::Audience(format!(
                        "assertion {} has no Recipient",
                        assertion.id
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Every assertion needs a bearer confirmation with an expiry.
fn require_bearer_confirmation(assertion: &Assertion) -> SamlResult<()> {
    let has_bounded_bearer = assertion
        .bearer_confirmations()
        .any(|c| c.data.as_ref().is_some_and(|d| d.not_on_or_after.is_some()));
    if has_bounded_bearer {
        Ok(())
    } else {
        Err(SamlError::Schema(format!(
            "assertion {} has no bearer SubjectConfirmation with NotOnOrAfter",
            assertion.id
        )))
    }
}

/// The request ID a response claims to answer, taken from the Response and
/// every bearer confirmation, which must all agree.
fn expected_in_response_to(response: &SamlResponse) -> SamlResult<Option<String>> {
    let mut expected = response.in_response_to.clone();
    for data in response
        .assertions
        .iter()
        .flat_map(|a| a.bearer_confirmations())
        .filter_map(|c| c.data.as_ref())
    {
        match (&expected, &data.in_response_to) {
            (Some(e), Some(found)) if e != found => {
                return Err(SamlError::Correlation(
                    "InResponseTo differs between response and assertion".into(),
                ));
            }
            (None, Some(found)) => expected = Some(found.clone()),
            _ => {}
        }
    }
    Ok(expected)
}

/// Latest instant at which an assertion is still usable.
fn assertion_expiry(assertion: &Assertion) -> Option<DateTime<Utc>> {
    assertion
        .conditions
        .iter()
        .filter_map(|c| c.not_on_or_after)
        .chain(
            assertion
                .bearer_confirmations()
                .filter_map(|c| c.data.as_ref()?.not_on_or_after),
        )
        .max()
}

fn extract_identity(
    ctx: &ResolvedContext,
    response: &SamlResponse,
) -> SamlResult<AuthenticatedIdentity> {
    let primary = response
        .assertions
        .iter()
        .find(|a| !a.authn_statements.is_empty())
        .or_else(|| response.assertions.first())
        .ok_or_else(|| SamlError::Schema("no assertion".into()))?;

    if response
        .assertions
        .iter()
        .any(|a| a.name_id.value != primary.name_id.value)
    {
        return Err(SamlError::Schema("assertions name different subjects".into()));
    }

    let mut attributes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut friendly_names = BTreeMap::new();
    for attribute in response.assertions.iter().flat_map(|a| &a.attributes) {
        attributes
            .entry(attribute.name.clone())
            .or_default()
            .extend(attribute.values.iter().cloned());
        if let Some(friendly) = &attribute.friendly_name {
            friendly_names.insert(friendly.clone(), attribute.name.clone());
        }
    }

    let authn = primary.authn_statements.first();
    let session_limit = response
        .assertions
        .iter()
        .flat_map(|a| &a.authn_statements)
        .filter_map(|s| s.session_not_on_or_after)
        .min();
    let assertion_limit = response
        .assertions
        .iter()
        .filter_map(|a| {
            a.conditions
                .as_ref()
                .and_then(|c| c.not_on_or_after)
                .or_else(|| assertion_expiry(a))
        })
        .min();

    Ok(AuthenticatedIdentity {
        name_id: primary.name_id.value.clone(),
        name_id_format: primary.name_id.format.clone(),
        attributes,
        friendly_names,
        session_index: authn.and_then(|s| s.session_index.clone()),
        idp_key: ctx.idp_key.clone(),
        issuer: primary.issuer.clone(),
        authn_instant: authn.map(|s| s.authn_instant),
        valid_until: session_limit.or(assertion_limit),
    })
}

fn signature_error(e: XmlError) -> SamlError {
    SamlError::Signature(e.to_string())
}

fn log_rejection(ctx: &ResolvedContext, message_type: &'static str, error: &SamlError) {
    let step = error.step().map(|s| s.as_str()).unwrap_or("internal");
    tracing::warn!(
        idp_key = %ctx.idp_key,
        message_type,
        step,
        kind = error.kind(),
        error = %error,
        "SAML message rejected"
    );
}
