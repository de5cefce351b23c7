use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    binding::Binding,
    crypto::{Certificate, FingerprintAlgorithm, normalize_fingerprint},
    error::SamlError,
    xml::TrustAnchors,
};

/// Identity Provider descriptor for one tenant.
///
/// Looked up per request and never mutated while a request is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdpConfig {
    /// Tenant key used in routes and session tagging.
    pub key: String,
    pub entity_id: String,
    pub sso_url: String,
    #[serde(default)]
    pub slo_url: Option<String>,
    #[serde(default)]
    pub sso_binding: Binding,
    #[serde(default)]
    pub slo_binding: Binding,
    /// Signing certificates, PEM or bare base64 DER.
    #[serde(default)]
    pub certificates: Vec<String>,
    /// Trust any `KeyInfo` certificate with this fingerprint.
    #[serde(default)]
    pub cert_fingerprint: Option<String>,
    #[serde(default)]
    pub fingerprint_algorithm: FingerprintAlgorithm,
    /// Metadata document kept fresh by the metadata cache.
    #[serde(default)]
    pub metadata_url: Option<String>,
    /// Hostnames that select this tenant.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// NameID format to request; falls back to the SP default.
    #[serde(default)]
    pub name_id_format: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl IdpConfig {
    /// Certificates and fingerprints that may sign this IdP's messages.
    ///
    /// Fails with a configuration error when nothing is configured, so a
    /// tenant without trust material can never accept a response.
    pub fn trust_anchors(&self) -> Result<TrustAnchors, SamlError> {
        let certificates = self
            .certificates
            .iter()
            .map(|c| Certificate::parse(c))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                SamlError::Configuration(format!("tenant '{}' certificate: {e}", self.key))
            })?;
        let anchors = TrustAnchors {
            certificates,
            fingerprints: self
                .cert_fingerprint
                .iter()
                .map(|fp| normalize_fingerprint(fp))
                .collect(),
            fingerprint_algorithm: self.fingerprint_algorithm,
        };
        if anchors.is_empty() {
            return Err(SamlError::Configuration(format!(
                "tenant '{}' has no IdP certificate or fingerprint",
                self.key
            )));
        }
        Ok(anchors)
    }

    /// Structural checks shared by config loading and tenant creation.
    pub fn validate(&self) -> Result<(), String> {
        if self.key.is_empty() || self.key.contains(['/', '?', '#']) {
            return Err(format!("invalid tenant key '{}'", self.key));
        }
        if self.metadata_url.is_none() {
            if self.entity_id.is_empty() {
                return Err(format!("tenant '{}' needs an IdP entity_id", self.key));
            }
            url::Url::parse(&self.sso_url)
                .map_err(|e| format!("tenant '{}' sso_url: {e}", self.key))?;
            if self.certificates.is_empty() && self.cert_fingerprint.is_none() {
                return Err(format!(
                    "tenant '{}' needs a certificate, a fingerprint, or a metadata_url",
                    self.key
                ));
            }
        }
        if let Some(slo) = &self.slo_url {
            url::Url::parse(slo).map_err(|e| format!("tenant '{}' slo_url: {e}", self.key))?;
        }
        if let Some(metadata) = &self.metadata_url {
            url::Url::parse(metadata)
                .map_err(|e| format!("tenant '{}' metadata_url: {e}", self.key))?;
        }
        for cert in &self.certificates {
            Certificate::parse(cert).map_err(|e| format!("tenant '{}': {e}", self.key))?;
        }
        Ok(())
    }

    pub fn serves_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.hosts.iter().any(|h| normalize_host(h) == host)
    }
}

/// Lowercase a host and drop any port.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    match host.rsplit_once(':') {
        Some((name, port)) if !name.ends_with(']') && port.chars().all(|c| c.is_ascii_digit()) => {
            name.to_string()
        }
        _ => host,
    }
}

/// A stored tenant: an IdP descriptor plus lifecycle metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub idp: IdpConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when soft-deleted; cleared by restore.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Tenant {
    pub fn new(idp: IdpConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            idp,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.idp.key
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Resolvable: not deleted and not disabled.
    pub fn is_active(&self) -> bool {
        !self.is_deleted() && self.idp.enabled
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn idp_config(key: &str, certificate_pem: &str) -> IdpConfig {
        IdpConfig {
            key: key.to_string(),
            entity_id: format!("https://idp.{key}.com/saml"),
            sso_url: format!("https://idp.{key}.com/sso"),
            slo_url: Some(format!("https://idp.{key}.com/slo")),
            sso_binding: Binding::Redirect,
            slo_binding: Binding::Redirect,
            certificates: vec![certificate_pem.to_string()],
            cert_fingerprint: None,
            fingerprint_algorithm: FingerprintAlgorithm::Sha256,
            metadata_url: None,
            hosts: vec![format!("{key}.example.com")],
            name_id_format: None,
            enabled: true,
        }
    }
}
