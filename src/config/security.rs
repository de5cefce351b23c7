use serde::{Deserialize, Serialize};

use crate::crypto::{DigestAlgorithm, SignatureAlgorithm};

/// Validation and signing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    /// Require `AudienceRestriction` and a bearer `Recipient` to be present.
    /// When off, missing values are tolerated but wrong values still fail.
    #[serde(default = "default_true")]
    pub strict: bool,

    /// Allowance applied to `NotBefore` checks. `NotOnOrAfter` is exact.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// Every assertion must carry its own signature.
    #[serde(default = "default_true")]
    pub want_assertions_signed: bool,

    /// The protocol message (Response, LogoutRequest, LogoutResponse) must be
    /// signed.
    #[serde(default)]
    pub want_messages_signed: bool,

    /// Accept responses with no `InResponseTo` (IdP-initiated SSO).
    #[serde(default)]
    pub allow_unsolicited: bool,

    /// Sign outbound AuthnRequests.
    #[serde(default)]
    pub authn_requests_signed: bool,

    /// Sign outbound LogoutRequests.
    #[serde(default)]
    pub logout_requests_signed: bool,

    /// Sign outbound LogoutResponses.
    #[serde(default)]
    pub logout_responses_signed: bool,

    /// Defaults to the algorithm matching the SP key type.
    #[serde(default)]
    pub signature_algorithm: Option<SignatureAlgorithm>,

    #[serde(default)]
    pub digest_algorithm: DigestAlgorithm,

    /// How long an issued request ID stays redeemable.
    #[serde(default = "default_request_ttl")]
    pub request_ttl_secs: u64,

    /// Ask the IdP to re-authenticate the user.
    #[serde(default)]
    pub force_authn: bool,

    /// Requested authentication context class.
    #[serde(default)]
    pub authn_context_class_ref: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            strict: true,
            clock_skew_secs: default_clock_skew(),
            want_assertions_signed: true,
            want_messages_signed: false,
            allow_unsolicited: false,
            authn_requests_signed: false,
            logout_requests_signed: false,
            logout_responses_signed: false,
            signature_algorithm: None,
            digest_algorithm: DigestAlgorithm::default(),
            request_ttl_secs: default_request_ttl(),
            force_authn: false,
            authn_context_class_ref: None,
        }
    }
}

impl SecurityConfig {
    pub fn signs_anything(&self) -> bool {
        self.authn_requests_signed || self.logout_requests_signed || self.logout_responses_signed
    }
}

fn default_true() -> bool {
    true
}

fn default_clock_skew() -> u64 {
    60
}

fn default_request_ttl() -> u64 {
    600 // 10 minutes
}
