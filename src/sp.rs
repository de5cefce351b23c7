//! Service Provider runtime settings.
//!
//! The validated, parsed form of `[sp]`, `[security]` and `[session]`: keys are
//! loaded once at startup and shared by the request builder, the response
//! validator and the metadata publisher.

use crate::{
    config::{SamlConfig, SecurityConfig, SessionConfig},
    crypto::{Certificate, SignatureAlgorithm, SigningKey},
    error::SamlError,
};

#[derive(Debug)]
pub struct ServiceProvider {
    pub security: SecurityConfig,
    pub session: SessionConfig,
    /// NameID format requested when a tenant doesn't override it.
    pub name_id_format: String,
    pub signing_key: Option<SigningKey>,
    /// Published in metadata. Falls back to the signing key's certificate.
    pub certificate: Option<Certificate>,
}

impl ServiceProvider {
    pub fn from_config(config: &SamlConfig) -> Result<Self, SamlError> {
        let certificate = config
            .sp
            .certificate
            .as_deref()
            .map(Certificate::parse)
            .transpose()
            .map_err(|e| SamlError::Configuration(format!("sp.certificate: {e}")))?;

        let signing_key = config
            .sp
            .private_key
            .as_deref()
            .map(|pem| SigningKey::from_pem(pem, certificate.clone()))
            .transpose()
            .map_err(|e| SamlError::Configuration(format!("sp.private_key: {e}")))?;

        if signing_key.is_none() && config.security.signs_anything() {
            return Err(SamlError::Configuration(
                "request signing is enabled but no SP private key is configured".into(),
            ));
        }

        Ok(Self {
            security: config.security.clone(),
            session: config.session.clone(),
            name_id_format: config.sp.name_id_format.clone(),
            signing_key,
            certificate,
        })
    }

    /// Configured algorithm, or the one matching the key type.
    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.security.signature_algorithm.unwrap_or_else(|| {
            self.signing_key
                .as_ref()
                .map(SigningKey::default_algorithm)
                .unwrap_or_default()
        })
    }

    /// The key and algorithm to sign with when `enabled` is set.
    pub fn signer(&self, enabled: bool) -> Option<(&SigningKey, SignatureAlgorithm)> {
        if !enabled {
            return None;
        }
        self.signing_key
            .as_ref()
            .map(|key| (key, self.signature_algorithm()))
    }

    /// Certificate to advertise in SP metadata.
    pub fn published_certificate(&self) -> Option<&Certificate> {
        self.certificate
            .as_ref()
            .or_else(|| self.signing_key.as_ref().and_then(SigningKey::certificate))
    }

    #[cfg(test)]
    pub(crate) fn for_tests(security: SecurityConfig, signing_key: Option<SigningKey>) -> Self {
        let certificate = signing_key.as_ref().and_then(|k| k.certificate().cloned());
        Self {
            security,
            session: SessionConfig::default(),
            name_id_format: crate::models::message::NAMEID_EMAIL.to_string(),
            signing_key,
            certificate,
        }
    }
}
