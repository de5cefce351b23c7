use serde::{Deserialize, Serialize};

use crate::{binding::Binding, crypto::FingerprintAlgorithm, models::IdpConfig};

/// Service Provider identity, shared by every tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpConfig {
    /// Entity ID. Defaults to the per-tenant metadata URL.
    #[serde(default)]
    pub entity_id: Option<String>,

    /// Assertion Consumer Service URL. Defaults to the per-tenant ACS route.
    #[serde(default)]
    pub acs_url: Option<String>,

    /// Single Logout Service URL. Defaults to the per-tenant SLS route.
    #[serde(default)]
    pub sls_url: Option<String>,

    /// NameID format requested when the tenant doesn't set one.
    #[serde(default = "default_name_id_format")]
    pub name_id_format: String,

    /// SP certificate (PEM), published in metadata.
    #[serde(default)]
    pub certificate: Option<String>,

    /// SP private key (PEM) for signing requests.
    #[serde(default)]
    pub private_key: Option<String>,
}

impl Default for SpConfig {
    fn default() -> Self {
        Self {
            entity_id: None,
            acs_url: None,
            sls_url: None,
            name_id_format: default_name_id_format(),
            certificate: None,
            private_key: None,
        }
    }
}

fn default_name_id_format() -> String {
    crate::models::message::NAMEID_EMAIL.to_string()
}

/// A statically configured tenant, `[tenants.<key>]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantConfig {
    #[serde(default)]
    pub entity_id: String,

    #[serde(default)]
    pub sso_url: String,

    #[serde(default)]
    pub slo_url: Option<String>,

    #[serde(default)]
    pub sso_binding: Binding,

    #[serde(default)]
    pub slo_binding: Binding,

    /// Shorthand for a single entry in `certs.x509`.
    #[serde(default)]
    pub certificate: Option<String>,

    #[serde(default)]
    pub certs: CertsConfig,

    #[serde(default)]
    pub metadata_url: Option<String>,

    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub name_id_format: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Trust material for a tenant's IdP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertsConfig {
    /// Signing certificates, PEM or bare base64.
    #[serde(default)]
    pub x509: Vec<String>,

    #[serde(default)]
    pub fingerprint: Option<String>,

    #[serde(default)]
    pub fingerprint_algorithm: FingerprintAlgorithm,
}

impl TenantConfig {
    /// Fold `certificate` and `certs.*` into a single descriptor.
    pub fn to_idp_config(&self, key: &str) -> IdpConfig {
        let mut certificates: Vec<String> = self.certificate.iter().cloned().collect();
        for cert in &self.certs.x509 {
            if !certificates.contains(cert) {
                certificates.push(cert.clone());
            }
        }

        IdpConfig {
            key: key.to_string(),
            entity_id: self.entity_id.clone(),
            sso_url: self.sso_url.clone(),
            slo_url: self.slo_url.clone(),
            sso_binding: self.sso_binding,
            slo_binding: self.slo_binding,
            certificates,
            cert_fingerprint: self.certs.fingerprint.clone(),
            fingerprint_algorithm: self.certs.fingerprint_algorithm,
            metadata_url: self.metadata_url.clone(),
            hosts: self.hosts.clone(),
            name_id_format: self.name_id_format.clone(),
            enabled: self.enabled,
        }
    }
}

fn default_true() -> bool {
    true
}
