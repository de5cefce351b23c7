//! Error taxonomy for the SAML protocol engine.
//!
//! Every inbound message that fails validation is rejected with exactly one
//! [`SamlError`], tagged with the [`ValidationStep`] at which it failed.
//! Messages returned by [`SamlError::public_message`] are safe to show to end
//! users: they never contain assertion content or cryptographic material.

use std::fmt;

use crate::{db::DbError, session::SessionError};

/// The stage of the inbound validation pipeline that rejected a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStep {
    Decode,
    Schema,
    Signature,
    Status,
    Issuer,
    Temporal,
    Audience,
    Correlation,
    Extraction,
}

impl ValidationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStep::Decode => "decode",
            ValidationStep::Schema => "schema",
            ValidationStep::Status => "status",
            ValidationStep::Signature => "signature",
            ValidationStep::Issuer => "issuer",
            ValidationStep::Temporal => "temporal",
            ValidationStep::Audience => "audience",
            ValidationStep::Correlation => "correlation",
            ValidationStep::Extraction => "extraction",
        }
    }
}

impl fmt::Display for ValidationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SamlError {
    #[error("Failed to decode SAML message: {0}")]
    Decode(String),

    #[error("Malformed SAML message: {0}")]
    Schema(String),

    #[error("Identity provider returned status {code}")]
    Status {
        code: String,
        sub_code: Option<String>,
        message: Option<String>,
    },

    #[error("Signature validation failed: {0}")]
    Signature(String),

    #[error("Unexpected issuer: {0}")]
    Issuer(String),

    #[error("Message outside its validity window: {0}")]
    Expired(String),

    #[error("Audience or recipient mismatch: {0}")]
    Audience(String),

    #[error("Correlation failed: {0}")]
    Correlation(String),

    #[error("No identity provider configured for {0}")]
    ResolutionNotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Tenant store error: {0}")]
    Store(#[from] DbError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SamlError {
    /// `ResolutionNotFound` lets the host proceed without SAML context.
    /// Everything else ends the current authentication attempt.
    pub fn is_soft(&self) -> bool {
        matches!(self, SamlError::ResolutionNotFound(_))
    }

    /// Pipeline step for validation failures, `None` for everything else.
    pub fn step(&self) -> Option<ValidationStep> {
        match self {
            SamlError::Decode(_) => Some(ValidationStep::Decode),
            SamlError::Schema(_) => Some(ValidationStep::Schema),
            SamlError::Status { .. } => Some(ValidationStep::Status),
            SamlError::Signature(_) => Some(ValidationStep::Signature),
            SamlError::Issuer(_) => Some(ValidationStep::Issuer),
            SamlError::Expired(_) => Some(ValidationStep::Temporal),
            SamlError::Audience(_) => Some(ValidationStep::Audience),
            SamlError::Correlation(_) => Some(ValidationStep::Correlation),
            _ => None,
        }
    }

    /// Stable machine-readable code.
    pub fn kind(&self) -> &'static str {
        match self {
            SamlError::Decode(_) => "decode_error",
            SamlError::Schema(_) => "schema_error",
            SamlError::Status { .. } => "status_error",
            SamlError::Signature(_) => "signature_error",
            SamlError::Issuer(_) => "issuer_error",
            SamlError::Expired(_) => "expired_error",
            SamlError::Audience(_) => "audience_error",
            SamlError::Correlation(_) => "correlation_error",
            SamlError::ResolutionNotFound(_) => "resolution_not_found",
            SamlError::Configuration(_) => "configuration_error",
            SamlError::Session(_) => "session_error",
            SamlError::Store(_) => "store_error",
            SamlError::Internal(_) => "internal_error",
        }
    }

    /// A message suitable for end users.
    pub fn public_message(&self) -> &'static str {
        match self {
            SamlError::Decode(_)
            | SamlError::Schema(_)
            | SamlError::Signature(_)
            | SamlError::Issuer(_)
            | SamlError::Audience(_) => "The sign-in response could not be verified.",
            SamlError::Status { .. } => "The identity provider did not complete the sign-in.",
            SamlError::Expired(_) => "The sign-in response has expired. Please try again.",
            SamlError::Correlation(_) => {
                "The sign-in response does not match a pending sign-in. Please try again."
            }
            SamlError::ResolutionNotFound(_) => "Single sign-on is not configured here.",
            SamlError::Session(SessionError::NotFound | SessionError::Expired) => {
                "Your session has ended. Please sign in again."
            }
            SamlError::Configuration(_)
            | SamlError::Session(_)
            | SamlError::Store(_)
            | SamlError::Internal(_) => "Single sign-on is temporarily unavailable.",
        }
    }
}

pub type SamlResult<T> = Result<T, SamlError>;
