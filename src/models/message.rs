//! Parsed SAML protocol messages.
//!
//! These are projections of documents that have passed the structural check.
//! Nothing here is trusted until the signature step has marked it signed.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const STATUS_REQUESTER: &str = "urn:oasis:names:tc:SAML:2.0:status:Requester";
pub const STATUS_RESPONDER: &str = "urn:oasis:names:tc:SAML:2.0:status:Responder";
pub const STATUS_PARTIAL_LOGOUT: &str = "urn:oasis:names:tc:SAML:2.0:status:PartialLogout";
pub const CM_BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";
pub const NAMEID_EMAIL: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";

#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub code: String,
    pub sub_code: Option<String>,
    pub message: Option<String>,
}

impl Status {
    pub fn is_success(&self) -> bool {
        self.code == STATUS_SUCCESS
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NameId {
    pub value: String,
    pub format: Option<String>,
    pub name_qualifier: Option<String>,
    pub sp_name_qualifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubjectConfirmationData {
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub recipient: Option<String>,
    pub in_response_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubjectConfirmation {
    pub method: String,
    pub data: Option<SubjectConfirmationData>,
}

impl SubjectConfirmation {
    pub fn is_bearer(&self) -> bool {
        self.method == CM_BEARER
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Conditions {
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    /// One entry per `AudienceRestriction`; each must name the SP.
    pub audience_restrictions: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthnStatement {
    pub authn_instant: DateTime<Utc>,
    pub session_index: Option<String>,
    pub session_not_on_or_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub friendly_name: Option<String>,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assertion {
    pub id: String,
    pub issuer: String,
    pub issue_instant: DateTime<Utc>,
    pub name_id: NameId,
    pub confirmations: Vec<SubjectConfirmation>,
    pub conditions: Option<Conditions>,
    pub authn_statements: Vec<AuthnStatement>,
    pub attributes: Vec<Attribute>,
    /// Carries its own valid signature.
    pub signed: bool,
}

impl Assertion {
    pub fn bearer_confirmations(&self) -> impl Iterator<Item = &SubjectConfirmation> {
        self.confirmations.iter().filter(|c| c.is_bearer())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamlResponse {
    pub id: String,
    pub in_response_to: Option<String>,
    pub issuer: Option<String>,
    pub destination: Option<String>,
    pub issue_instant: DateTime<Utc>,
    pub status: Status,
    pub assertions: Vec<Assertion>,
    /// The Response element carries a valid signature.
    pub signed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogoutRequest {
    pub id: String,
    pub issuer: String,
    pub destination: Option<String>,
    pub issue_instant: DateTime<Utc>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub name_id: NameId,
    pub session_indexes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogoutResponse {
    pub id: String,
    pub in_response_to: Option<String>,
    pub issuer: String,
    pub destination: Option<String>,
    pub issue_instant: DateTime<Utc>,
    pub status: Status,
}

/// `xs:dateTime` in UTC, second precision, as SAML expects.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an `xs:dateTime`. Values without a zone designator are taken as UTC.
pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
